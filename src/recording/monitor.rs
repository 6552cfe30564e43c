// Monitor: the context object that owns one camera's monitoring loop
//
// A single worker thread reads frames, runs detection and feeds the incident
// state machine. It is the only owner of the source, the rolling buffer and
// the recorder. Callers talk to it through a command channel and read an
// immutable status snapshot that the worker republishes after every frame.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use uuid::Uuid;

use crate::config::Config;
use crate::detection::{DetectionAdapter, DetectionResult};
use crate::encoding::SinkFactory;
use crate::events::{EventBus, MonitorEvent};
use crate::session::AlertLog;
use crate::video::{FrameBroadcast, PreviewStream, SourceError, SourceOpener, VideoSource};

use super::incident::{AlertStateMachine, IncidentConfig, IncidentState, IncidentStatus, StepOutcome};
use super::recorder::IncidentRecorder;

/// Error type for monitor commands
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Monitoring is already running")]
    AlreadyRunning,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("Failed to spawn monitor worker: {0}")]
    Spawn(String),
}

/// Live status, republished by the worker after every frame
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorStatus {
    pub monitoring: bool,
    pub camera_connected: bool,
    pub weapon_detected: bool,
    pub detection_duration_seconds: f64,
    pub recording: bool,
    pub current_recording: Option<String>,
    pub threshold_seconds: f64,
    pub session_id: Option<Uuid>,
    pub state: IncidentState,
    /// Why monitoring last stopped on its own, if it did
    pub last_error: Option<String>,
}

impl MonitorStatus {
    fn idle(threshold_seconds: f64, last_error: Option<String>) -> Self {
        Self {
            threshold_seconds,
            last_error,
            ..Self::default()
        }
    }

    fn running(threshold_seconds: f64, camera_connected: bool, incident: IncidentStatus) -> Self {
        Self {
            monitoring: true,
            camera_connected,
            weapon_detected: incident.weapon_detected,
            detection_duration_seconds: incident.detection_duration_seconds,
            recording: incident.recording,
            current_recording: incident.current_recording,
            threshold_seconds,
            session_id: incident.session_id,
            state: incident.state,
            last_error: None,
        }
    }
}

type SharedStatus = Arc<RwLock<Arc<MonitorStatus>>>;

enum Command {
    Stop,
}

struct Worker {
    commands: Sender<Command>,
    handle: JoinHandle<()>,
}

/// Monitors one camera. Create one per camera; nothing here is global.
pub struct Monitor {
    config: Config,
    opener: Arc<dyn SourceOpener>,
    detector: Arc<Mutex<DetectionAdapter>>,
    sink_factory: Arc<dyn SinkFactory>,
    events: EventBus,
    preview: FrameBroadcast,
    status: SharedStatus,
    worker: Option<Worker>,
}

impl Monitor {
    pub fn new(
        config: Config,
        opener: Arc<dyn SourceOpener>,
        detector: DetectionAdapter,
        sink_factory: Arc<dyn SinkFactory>,
    ) -> Self {
        let status = MonitorStatus::idle(config.alert_threshold_secs, None);
        Self {
            events: EventBus::new(config.subscriber_capacity),
            preview: FrameBroadcast::default(),
            status: Arc::new(RwLock::new(Arc::new(status))),
            config,
            opener,
            detector: Arc::new(Mutex::new(detector)),
            sink_factory,
            worker: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe_events(&self) -> Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Frames already read by the worker, for live preview
    pub fn subscribe_preview(&self) -> PreviewStream {
        self.preview.subscribe()
    }

    /// Current status snapshot
    pub fn status(&self) -> Arc<MonitorStatus> {
        self.status.read().clone()
    }

    /// True while the worker is alive
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().map(|w| !w.handle.is_finished()).unwrap_or(false)
    }

    /// Open the camera and start the worker.
    ///
    /// Fails with [`MonitorError::AlreadyRunning`] if a worker is alive; the
    /// running worker is left untouched. A camera that cannot be opened is
    /// reported here and nothing is started.
    pub fn start(&mut self) -> Result<(), MonitorError> {
        if self.is_running() {
            return Err(MonitorError::AlreadyRunning);
        }
        // A worker that stopped on its own is joined before starting over
        self.reap();

        let warnings = self
            .config
            .validate()
            .map_err(|e| MonitorError::InvalidConfig(e.to_string()))?;
        for warning in warnings {
            log::warn!("Config: {}", warning);
        }

        super::recover_interrupted_recordings(&self.config.recordings_dir());

        let index = self.config.camera_index;
        let source = match self.opener.open(index) {
            Ok(source) => source,
            Err(e) => {
                log::error!("Could not start monitoring: {}", e);
                self.publish(MonitorStatus::idle(self.config.alert_threshold_secs, Some(e.to_string())));
                return Err(e.into());
            }
        };
        log::info!("Camera {} opened, monitoring started", index);

        let incident_config = IncidentConfig::from_config(&self.config);
        let recorder = IncidentRecorder::new(
            self.config.recordings_dir(),
            self.sink_factory.clone(),
            self.config.frame_rate,
        );
        let machine = AlertStateMachine::new(
            incident_config,
            recorder,
            AlertLog::new(self.config.logs_dir()),
            self.events.clone(),
        );

        let (commands, command_rx) = unbounded();
        let context = WorkerContext {
            source,
            detector: self.detector.clone(),
            machine,
            preview: self.preview.clone(),
            status: self.status.clone(),
            commands: command_rx,
            threshold_seconds: self.config.alert_threshold_secs,
            retry_base: Duration::from_millis(self.config.read_retry_base_ms),
            retry_cap: Duration::from_millis(self.config.read_retry_max_ms),
            max_read_failures: self.config.max_consecutive_read_failures.max(1),
        };

        self.publish(MonitorStatus::running(
            self.config.alert_threshold_secs,
            true,
            IncidentStatus::default(),
        ));

        let handle = std::thread::Builder::new()
            .name(format!("vigil-monitor-{}", index))
            .spawn(move || context.run())
            .map_err(|e| {
                self.publish(MonitorStatus::idle(self.config.alert_threshold_secs, Some(e.to_string())));
                MonitorError::Spawn(e.to_string())
            })?;

        self.worker = Some(Worker { commands, handle });
        Ok(())
    }

    /// Stop the worker: close any open recording, release the camera, clear
    /// the session. Safe to call at any time, any number of times.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = worker.commands.send(Command::Stop);
        if worker.handle.join().is_err() {
            log::error!("Monitor worker panicked");
        }

        // A worker that stopped on its own leaves its reason in the snapshot
        let last_error = self.status.read().last_error.clone();
        self.publish(MonitorStatus::idle(self.config.alert_threshold_secs, last_error));
        log::info!("Monitoring stopped");
    }

    fn reap(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.handle.join();
        }
    }

    fn publish(&self, status: MonitorStatus) {
        *self.status.write() = Arc::new(status);
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Delay before the `attempt`-th retry: `base * 2^(attempt-1)`, capped
pub fn retry_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}

/// Everything the worker thread owns
struct WorkerContext {
    source: Box<dyn VideoSource>,
    detector: Arc<Mutex<DetectionAdapter>>,
    machine: AlertStateMachine,
    preview: FrameBroadcast,
    status: SharedStatus,
    commands: Receiver<Command>,
    threshold_seconds: f64,
    retry_base: Duration,
    retry_cap: Duration,
    max_read_failures: u32,
}

impl WorkerContext {
    fn run(mut self) {
        let failure = self.ingest();

        // Teardown order: finish the recording, then release the camera
        self.machine.shutdown();
        self.source.close();

        if let Some(reason) = &failure {
            log::error!("Monitoring stopped: {}", reason);
        }
        *self.status.write() = Arc::new(MonitorStatus::idle(self.threshold_seconds, failure));
    }

    /// Frame loop. Returns the failure that ended it, `None` for a requested
    /// stop or end of stream.
    fn ingest(&mut self) -> Option<String> {
        let mut consecutive_failures = 0u32;

        loop {
            match self.commands.try_recv() {
                Ok(Command::Stop) | Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) => {}
            }

            match self.source.read() {
                Ok(frame) => {
                    if consecutive_failures > 0 {
                        log::info!("Camera recovered after {} failed reads", consecutive_failures);
                        consecutive_failures = 0;
                    }

                    let result = self.detector.lock().detect(&frame);
                    match &result {
                        DetectionResult::Ok(detections) => self.preview.publish(&frame, detections),
                        DetectionResult::Failed(_) => self.preview.publish(&frame, &[]),
                    }

                    if let StepOutcome::Stop(reason) = self.machine.process(frame, result) {
                        return Some(reason);
                    }
                    self.publish(true);
                }
                Err(SourceError::EndOfStream) => {
                    log::info!("Camera reached end of stream");
                    return None;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    log::warn!(
                        "Frame read failed ({}/{}): {}",
                        consecutive_failures,
                        self.max_read_failures,
                        e
                    );
                    if consecutive_failures >= self.max_read_failures {
                        return Some(format!(
                            "Camera read failed {} times in a row: {}",
                            consecutive_failures, e
                        ));
                    }
                    self.publish(false);

                    // Back off, but stay responsive to stop
                    let delay = retry_delay(self.retry_base, self.retry_cap, consecutive_failures);
                    match self.commands.recv_timeout(delay) {
                        Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => return None,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                }
            }
        }
    }

    fn publish(&self, camera_connected: bool) {
        let status = MonitorStatus::running(self.threshold_seconds, camera_connected, self.machine.status());
        *self.status.write() = Arc::new(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_up_to_cap() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(1);
        let delays: Vec<u64> = (1..=6)
            .map(|n| retry_delay(base, cap, n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(retry_delay(base, cap, 200), cap);
    }

    #[test]
    fn status_serializes_state_name() {
        let status = MonitorStatus::idle(5.0, None);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "idle");
        assert_eq!(json["monitoring"], false);
        assert_eq!(json["threshold_seconds"], 5.0);
    }
}
