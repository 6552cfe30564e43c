// Incident state machine
//
// Consumes (frame, detection result) pairs in capture order and drives the
// rolling buffer, the recorder, the alert log and the event bus. All timing is
// measured on frame capture timestamps, so a given frame sequence always
// produces the same incident timeline.
//
//   Idle -> Detecting -> Armed <-> PostEvent -> Cooldown -> Idle
//
// Both the post-event window and the reset grace period are measured from the
// last positive frame. A session is never reset while its recording is open:
// the effective reset point of an alerted session is
// max(reset_grace, post_event_window) after the last detection.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Config;
use crate::detection::{Detection, DetectionResult, FailurePolicy};
use crate::events::{EventBus, MonitorEvent};
use crate::session::{short_token, AlertLog, AlertLogEntry};
use crate::video::annotate::annotate;
use crate::video::Frame;

use super::preroll::RollingFrameBuffer;
use super::recorder::{IncidentRecorder, RecordingSummary, WriteOutcome};

/// Where the machine is in an incident
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentState {
    /// No session
    #[default]
    Idle,
    /// Session open, detections below the alert threshold
    Detecting,
    /// Alert fired, detections ongoing, recording
    Armed,
    /// Detections stopped, recording the post-event window
    PostEvent,
    /// Recording closed, session kept until the reset grace period passes
    Cooldown,
}

impl IncidentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentState::Idle => "idle",
            IncidentState::Detecting => "detecting",
            IncidentState::Armed => "armed",
            IncidentState::PostEvent => "post_event",
            IncidentState::Cooldown => "cooldown",
        }
    }

    /// States in which the recorder is expected to be open
    pub fn is_recording_eligible(&self) -> bool {
        matches!(self, IncidentState::Armed | IncidentState::PostEvent)
    }
}

impl std::fmt::Display for IncidentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One continuous detection episode
#[derive(Debug, Clone, PartialEq)]
pub struct IncidentSession {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub started_pts: Duration,
    pub last_detection_pts: Duration,
    pub alert_fired_at: Option<DateTime<Utc>>,
    pub recording_name: Option<String>,
}

impl IncidentSession {
    fn token(&self) -> String {
        short_token(&self.session_id)
    }
}

/// Timing and policy inputs of the state machine
#[derive(Debug, Clone, PartialEq)]
pub struct IncidentConfig {
    pub frame_rate: f64,
    pub alert_threshold: Duration,
    pub post_event_window: Duration,
    pub reset_grace: Duration,
    pub buffer_capacity_secs: f64,
    pub failure_policy: FailurePolicy,
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            frame_rate: 30.0,
            alert_threshold: Duration::from_secs(5),
            post_event_window: Duration::from_secs(10),
            reset_grace: Duration::from_secs(5),
            buffer_capacity_secs: 10.0,
            failure_policy: FailurePolicy::TreatAsNegative,
        }
    }
}

impl IncidentConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            frame_rate: config.frame_rate,
            alert_threshold: secs(config.alert_threshold_secs),
            post_event_window: secs(config.post_event_window_secs),
            reset_grace: secs(config.reset_grace_secs),
            buffer_capacity_secs: config.buffer_capacity_secs,
            failure_policy: config.failure_policy,
        }
    }

    /// Gap after the last detection at which an alerted session resets
    pub fn effective_reset(&self) -> Duration {
        self.reset_grace.max(self.post_event_window)
    }
}

/// Non-positive and NaN windows are zero; windows too long to represent saturate
fn secs(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

/// What the worker should do after a frame
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Continue,
    /// Detection failed under [`FailurePolicy::StopMonitoring`]
    Stop(String),
}

/// Incident-related part of the live status
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncidentStatus {
    pub state: IncidentState,
    pub weapon_detected: bool,
    pub detection_duration_seconds: f64,
    pub recording: bool,
    pub current_recording: Option<String>,
    pub session_id: Option<Uuid>,
}

/// The incident state machine and the resources it drives
pub struct AlertStateMachine {
    config: IncidentConfig,
    state: IncidentState,
    session: Option<IncidentSession>,
    buffer: RollingFrameBuffer,
    recorder: IncidentRecorder,
    alert_log: AlertLog,
    events: EventBus,
    last_pts: Option<Duration>,
    last_positive: bool,
}

impl AlertStateMachine {
    pub fn new(config: IncidentConfig, recorder: IncidentRecorder, alert_log: AlertLog, events: EventBus) -> Self {
        let buffer = RollingFrameBuffer::from_window(config.frame_rate, config.buffer_capacity_secs);
        log::debug!(
            "Incident machine ready: threshold {:?}, post-event {:?}, reset {:?} (effective {:?}), buffer {} frames",
            config.alert_threshold,
            config.post_event_window,
            config.reset_grace,
            config.effective_reset(),
            buffer.capacity()
        );
        Self {
            config,
            state: IncidentState::Idle,
            session: None,
            buffer,
            recorder,
            alert_log,
            events,
            last_pts: None,
            last_positive: false,
        }
    }

    pub fn state(&self) -> IncidentState {
        self.state
    }

    pub fn session(&self) -> Option<&IncidentSession> {
        self.session.as_ref()
    }

    pub fn buffer(&self) -> &RollingFrameBuffer {
        &self.buffer
    }

    pub fn recorder(&self) -> &IncidentRecorder {
        &self.recorder
    }

    pub fn config(&self) -> &IncidentConfig {
        &self.config
    }

    /// Handle one frame and its detection result
    pub fn process(&mut self, frame: Frame, result: DetectionResult) -> StepOutcome {
        let detections = match result {
            DetectionResult::Ok(detections) => Some(detections),
            DetectionResult::Failed(reason) => {
                log::warn!(
                    "Detection failed at {:?}{}: {}",
                    frame.pts,
                    self.session_suffix(),
                    reason
                );
                match self.config.failure_policy {
                    FailurePolicy::TreatAsNegative => Some(Vec::new()),
                    FailurePolicy::SkipFrame => None,
                    FailurePolicy::StopMonitoring => {
                        return StepOutcome::Stop(format!("Detection failed: {}", reason));
                    }
                }
            }
        };

        match detections {
            Some(detections) => self.step(frame, detections),
            None => {
                // No decision for this frame: keep it for footage only
                if self.state.is_recording_eligible() {
                    self.write_live(&frame, &[]);
                }
                self.remember(frame, Vec::new());
            }
        }
        StepOutcome::Continue
    }

    fn step(&mut self, frame: Frame, detections: Vec<Detection>) {
        let now = frame.pts;
        let positive = !detections.is_empty();
        self.last_positive = positive;

        if positive {
            match self.session.as_mut() {
                Some(session) => session.last_detection_pts = now,
                None => self.begin_session(&frame),
            }
        }

        match self.state {
            IncidentState::Idle => {}
            IncidentState::Detecting => {
                if !positive && self.gap(now) >= self.config.reset_grace {
                    self.reset(now);
                }
            }
            IncidentState::Armed => {
                if !positive {
                    self.transition(IncidentState::PostEvent, now);
                }
            }
            IncidentState::PostEvent => {
                if positive {
                    self.transition(IncidentState::Armed, now);
                }
            }
            IncidentState::Cooldown => {
                if !positive && self.gap(now) >= self.config.reset_grace {
                    self.reset(now);
                }
            }
        }

        if self.state == IncidentState::PostEvent && self.gap(now) >= self.config.post_event_window {
            self.finish_recording(&frame);
            if self.gap(now) >= self.config.reset_grace {
                self.reset(now);
            } else {
                self.transition(IncidentState::Cooldown, now);
            }
        }

        if self.state == IncidentState::Detecting && positive && self.elapsed(now) >= self.config.alert_threshold {
            self.arm(&frame, &detections);
        } else if self.state.is_recording_eligible() {
            self.write_live(&frame, &detections);
        }

        self.publish_update(&frame, &detections);
        self.remember(frame, detections);
    }

    /// Close any recording and drop the session. Used when monitoring stops.
    pub fn shutdown(&mut self) {
        if let Some(summary) = self.recorder.complete() {
            let session_id = self.session.as_ref().map(|s| s.session_id).unwrap_or_default();
            self.publish_stopped(summary, session_id, Utc::now());
        }
        if let Some(session) = self.session.take() {
            log::info!("Session {} cleared by shutdown", session.token());
        }
        self.state = IncidentState::Idle;
        self.buffer.clear();
        self.last_positive = false;
    }

    pub fn status(&self) -> IncidentStatus {
        IncidentStatus {
            state: self.state,
            weapon_detected: self.session.is_some() && self.last_positive,
            detection_duration_seconds: match (&self.session, self.last_pts) {
                (Some(session), Some(now)) => now.saturating_sub(session.started_pts).as_secs_f64(),
                _ => 0.0,
            },
            recording: self.recorder.is_open(),
            current_recording: self.recorder.current_name().map(str::to_string),
            session_id: self.session.as_ref().map(|s| s.session_id),
        }
    }

    fn begin_session(&mut self, frame: &Frame) {
        let session = IncidentSession {
            session_id: Uuid::new_v4(),
            started_at: frame.captured_at,
            started_pts: frame.pts,
            last_detection_pts: frame.pts,
            alert_fired_at: None,
            recording_name: None,
        };
        log::info!("Session {} started at {:?}", session.token(), frame.pts);
        self.session = Some(session);
        self.state = IncidentState::Detecting;
    }

    fn arm(&mut self, frame: &Frame, detections: &[Detection]) {
        let now = frame.pts;
        let elapsed = self.elapsed(now);
        let Some(session_id) = self.session.as_ref().map(|s| s.session_id) else {
            return;
        };

        // Seed with everything buffered before the trigger frame
        let seed: Vec<Frame> = self
            .buffer
            .drain_ordered()
            .into_iter()
            .map(|entry| annotate(&entry.frame, &entry.detections))
            .collect();
        let seeded = seed.len();

        let recording_name = match self.recorder.start(seed, session_id, frame.captured_at, Some(frame.geometry())) {
            Ok(filename) => {
                self.events.emit(MonitorEvent::RecordingStarted {
                    filename: filename.clone(),
                    session_id,
                    timestamp: frame.captured_at,
                });
                Some(filename)
            }
            Err(e) => {
                log::error!(
                    "Session {}: recording could not be started at {:?}: {}",
                    short_token(&session_id),
                    now,
                    e
                );
                None
            }
        };

        if let Some(session) = self.session.as_mut() {
            session.alert_fired_at = Some(frame.captured_at);
            session.recording_name = recording_name.clone();
        }
        self.transition(IncidentState::Armed, now);

        if recording_name.is_some() {
            self.write_live(frame, detections);
        }

        let entry = AlertLogEntry::new(
            frame.captured_at,
            elapsed.as_secs_f64(),
            detections.to_vec(),
            self.config.alert_threshold.as_secs_f64(),
            recording_name.clone(),
            session_id,
        );
        log::warn!(
            "ALERT session {}: detections persisted {:.2}s at {:?}, recording {} ({} buffered frames)",
            short_token(&session_id),
            entry.duration_seconds,
            now,
            recording_name.as_deref().unwrap_or("none"),
            seeded
        );
        if let Err(e) = self.alert_log.append(&entry) {
            log::error!("Session {}: failed to write alert log: {}", short_token(&session_id), e);
        }
        self.events.emit(MonitorEvent::AlertFired {
            entry,
            recording_active: self.recorder.is_open(),
        });
    }

    fn write_live(&mut self, frame: &Frame, detections: &[Detection]) {
        if !self.recorder.is_open() {
            return;
        }
        let annotated = annotate(frame, detections);
        if let WriteOutcome::Failed { error, summary } = self.recorder.write(&annotated) {
            let session_id = self.session.as_ref().map(|s| s.session_id).unwrap_or_default();
            log::error!(
                "Session {}: recording {} force-closed at {:?}: {}",
                short_token(&session_id),
                summary.filename,
                frame.pts,
                error
            );
            self.publish_stopped(summary, session_id, frame.captured_at);
        }
    }

    fn finish_recording(&mut self, frame: &Frame) {
        if let Some(summary) = self.recorder.complete() {
            let session_id = self.session.as_ref().map(|s| s.session_id).unwrap_or_default();
            log::info!(
                "Session {}: post-event window over at {:?}, recording {} complete",
                short_token(&session_id),
                frame.pts,
                summary.filename
            );
            self.publish_stopped(summary, session_id, frame.captured_at);
        }
    }

    fn reset(&mut self, now: Duration) {
        // Recording must be closed before a session can end
        if self.recorder.is_open() {
            return;
        }
        if let Some(session) = self.session.take() {
            log::info!(
                "Session {} reset at {:?} (alerted: {})",
                session.token(),
                now,
                session.alert_fired_at.is_some()
            );
        }
        self.state = IncidentState::Idle;
    }

    fn transition(&mut self, to: IncidentState, now: Duration) {
        if self.state != to {
            log::info!("{} -> {} at {:?}{}", self.state, to, now, self.session_suffix());
            self.state = to;
        }
    }

    fn publish_update(&self, frame: &Frame, detections: &[Detection]) {
        self.events.emit(MonitorEvent::DetectionUpdate {
            detected: !detections.is_empty(),
            duration: self.elapsed(frame.pts).as_secs_f64(),
            detections: detections.to_vec(),
            count: detections.len(),
            session_id: self.session.as_ref().map(|s| s.session_id),
            timestamp: frame.captured_at,
        });
    }

    fn publish_stopped(&self, summary: RecordingSummary, session_id: Uuid, timestamp: DateTime<Utc>) {
        self.events.emit(MonitorEvent::RecordingStopped {
            filename: summary.filename,
            session_id,
            file_size: summary.byte_size,
            timestamp,
        });
    }

    fn remember(&mut self, frame: Frame, detections: Vec<Detection>) {
        self.last_pts = Some(frame.pts);
        self.buffer.push(frame, detections);
    }

    fn gap(&self, now: Duration) -> Duration {
        self.session
            .as_ref()
            .map(|s| now.saturating_sub(s.last_detection_pts))
            .unwrap_or_default()
    }

    fn elapsed(&self, now: Duration) -> Duration {
        self.session
            .as_ref()
            .map(|s| now.saturating_sub(s.started_pts))
            .unwrap_or_default()
    }

    fn session_suffix(&self) -> String {
        self.session
            .as_ref()
            .map(|s| format!(" [session {}]", s.token()))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BoundingBox;
    use crate::encoding::AviSinkFactory;
    use std::sync::Arc;

    const FPS: u64 = 10;

    struct Harness {
        _dir: tempfile::TempDir,
        machine: AlertStateMachine,
        events: crossbeam_channel::Receiver<MonitorEvent>,
        frame: u64,
    }

    impl Harness {
        fn new(config: IncidentConfig) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let bus = EventBus::new(100_000);
            let events = bus.subscribe();
            let recorder = IncidentRecorder::new(dir.path().join("recordings"), Arc::new(AviSinkFactory), config.frame_rate);
            let log = AlertLog::new(dir.path().join("logs"));
            Self {
                machine: AlertStateMachine::new(config, recorder, log, bus),
                _dir: dir,
                events,
                frame: 0,
            }
        }

        fn feed(&mut self, result: DetectionResult) -> StepOutcome {
            let pts = Duration::from_nanos(self.frame * 1_000_000_000 / FPS);
            self.frame += 1;
            let frame = Frame::new(vec![0u8; 2 * 2 * 3], 2, 2, pts, Utc::now());
            self.machine.process(frame, result)
        }

        fn feed_secs(&mut self, secs: u64, positive: bool) {
            for _ in 0..secs * FPS {
                self.feed(if positive { hit() } else { DetectionResult::Ok(Vec::new()) });
            }
        }

        fn kinds(&self) -> Vec<&'static str> {
            self.events
                .try_iter()
                .map(|e| e.kind())
                .filter(|k| *k != "detection_update")
                .collect()
        }
    }

    fn config() -> IncidentConfig {
        IncidentConfig {
            frame_rate: FPS as f64,
            alert_threshold: Duration::from_secs(2),
            post_event_window: Duration::from_secs(3),
            reset_grace: Duration::from_secs(1),
            buffer_capacity_secs: 1.0,
            failure_policy: FailurePolicy::TreatAsNegative,
        }
    }

    fn hit() -> DetectionResult {
        DetectionResult::Ok(vec![Detection {
            label: "gun".into(),
            confidence: 0.9,
            bbox: BoundingBox { x1: 0.0, y1: 0.0, x2: 1.0, y2: 1.0 },
        }])
    }

    #[test]
    fn arms_exactly_at_threshold() {
        let mut h = Harness::new(config());
        h.feed_secs(2, true);
        assert_eq!(h.machine.state(), IncidentState::Detecting);
        h.feed(hit()); // pts 2.0s
        assert_eq!(h.machine.state(), IncidentState::Armed);
        assert!(h.machine.recorder().is_open());
        assert_eq!(h.kinds(), vec!["recording_started", "alert_fired"]);
    }

    #[test]
    fn post_event_then_cooldown_ordering() {
        let mut h = Harness::new(IncidentConfig {
            reset_grace: Duration::from_secs(5),
            ..config()
        });
        h.feed_secs(3, true);
        h.feed(DetectionResult::Ok(Vec::new()));
        assert_eq!(h.machine.state(), IncidentState::PostEvent);

        // Last detection at 2.9s: recording closes at 5.9s, reset at 7.9s
        h.feed_secs(3, false);
        assert_eq!(h.machine.state(), IncidentState::Cooldown);
        assert!(!h.machine.recorder().is_open());
        assert!(h.machine.session().is_some());

        h.feed_secs(2, false);
        assert_eq!(h.machine.state(), IncidentState::Idle);
        assert!(h.machine.session().is_none());
    }

    #[test]
    fn short_reset_grace_waits_for_recording() {
        let mut h = Harness::new(config());
        h.feed_secs(3, true);
        // reset_grace (1s) elapses long before the post-event window (3s)
        h.feed_secs(2, false);
        assert_eq!(h.machine.state(), IncidentState::PostEvent);
        assert!(h.machine.recorder().is_open());
        h.feed_secs(1, false);
        assert_eq!(h.machine.state(), IncidentState::Idle);
        assert!(!h.machine.recorder().is_open());
    }

    #[test]
    fn cooldown_detection_keeps_session_without_new_alert() {
        let mut h = Harness::new(IncidentConfig {
            reset_grace: Duration::from_secs(10),
            ..config()
        });
        h.feed_secs(3, true);
        h.feed_secs(4, false);
        assert_eq!(h.machine.state(), IncidentState::Cooldown);
        let id = h.machine.session().unwrap().session_id;

        h.feed_secs(3, true);
        assert_eq!(h.machine.state(), IncidentState::Cooldown);
        assert_eq!(h.machine.session().unwrap().session_id, id);
        assert_eq!(h.kinds(), vec!["recording_started", "alert_fired", "recording_stopped"]);
    }

    #[test]
    fn skip_frame_policy_leaves_state_alone() {
        let mut h = Harness::new(IncidentConfig {
            failure_policy: FailurePolicy::SkipFrame,
            ..config()
        });
        h.feed(hit());
        for _ in 0..30 {
            h.feed(DetectionResult::Failed("model busy".into()));
        }
        // Failures neither reset the session nor count as detections
        assert_eq!(h.machine.state(), IncidentState::Detecting);
        h.feed(hit());
        assert_eq!(h.machine.state(), IncidentState::Armed);
    }

    #[test]
    fn treat_as_negative_policy_resets() {
        let mut h = Harness::new(config());
        h.feed(hit());
        for _ in 0..10 {
            h.feed(DetectionResult::Failed("model busy".into()));
        }
        assert_eq!(h.machine.state(), IncidentState::Idle);
    }

    #[test]
    fn stop_policy_requests_teardown() {
        let mut h = Harness::new(IncidentConfig {
            failure_policy: FailurePolicy::StopMonitoring,
            ..config()
        });
        assert!(matches!(h.feed(DetectionResult::Failed("gone".into())), StepOutcome::Stop(_)));
    }

    #[test]
    fn shutdown_closes_recording_and_clears_session() {
        let mut h = Harness::new(config());
        h.feed_secs(3, true);
        assert!(h.machine.recorder().is_open());
        h.machine.shutdown();
        assert!(!h.machine.recorder().is_open());
        assert!(h.machine.session().is_none());
        assert_eq!(h.machine.state(), IncidentState::Idle);
        assert!(h.machine.buffer().is_empty());
        assert_eq!(h.kinds(), vec!["recording_started", "alert_fired", "recording_stopped"]);
    }

    #[test]
    fn status_reports_session_duration() {
        let mut h = Harness::new(config());
        h.feed_secs(1, true);
        let status = h.machine.status();
        assert!(status.weapon_detected);
        assert!((status.detection_duration_seconds - 0.9).abs() < 1e-9);
        assert_eq!(status.state, IncidentState::Detecting);
        assert!(!status.recording);
    }

    #[test]
    fn config_windows_out_of_duration_range_saturate() {
        let config = IncidentConfig::from_config(&Config {
            reset_grace_secs: 1e20,
            post_event_window_secs: f64::INFINITY,
            alert_threshold_secs: -3.0,
            ..Config::default()
        });
        assert_eq!(config.reset_grace, Duration::MAX);
        assert_eq!(config.post_event_window, Duration::MAX);
        assert_eq!(config.alert_threshold, Duration::ZERO);
        assert_eq!(config.effective_reset(), Duration::MAX);
    }
}
