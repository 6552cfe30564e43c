// Incident recorder
//
// Owns at most one open recording. Frames reach the sink in strictly
// increasing capture order: seed frames from the rolling buffer first, then
// live frames. A frame that would break that order is dropped.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::encoding::{RecorderError, RecordingSink, SinkFactory};
use crate::session::short_token;
use crate::video::{Frame, FrameGeometry, DEFAULT_GEOMETRY};

/// Result of a closed recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSummary {
    pub filename: String,
    pub byte_size: u64,
    pub frames: u64,
}

/// What happened to a frame handed to [`IncidentRecorder::write`]
#[derive(Debug)]
pub enum WriteOutcome {
    Written,
    /// Nothing open, or the frame is not newer than the last one written
    Skipped,
    /// The sink failed; the recording has been force-closed
    Failed {
        error: RecorderError,
        summary: RecordingSummary,
    },
}

struct ActiveRecording {
    sink: Box<dyn RecordingSink>,
    filename: String,
    path: PathBuf,
    frames: u64,
    last_pts: Option<Duration>,
}

impl ActiveRecording {
    fn accepts(&self, frame: &Frame) -> bool {
        self.last_pts.map_or(true, |last| frame.pts > last)
    }

    fn write(&mut self, frame: &Frame) -> Result<(), RecorderError> {
        self.sink.write(frame)?;
        self.frames += 1;
        self.last_pts = Some(frame.pts);
        Ok(())
    }

    fn close(self) -> RecordingSummary {
        let fallback = self.sink.bytes_written();
        let byte_size = match self.sink.finish() {
            Ok(size) => size,
            Err(e) => {
                log::error!("Failed to finalize recording {}: {}", self.filename, e);
                std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(fallback)
            }
        };
        RecordingSummary {
            filename: self.filename,
            byte_size,
            frames: self.frames,
        }
    }
}

/// Lifecycle of one incident recording at a time
pub struct IncidentRecorder {
    dir: PathBuf,
    factory: Arc<dyn SinkFactory>,
    fps: f64,
    active: Option<ActiveRecording>,
}

impl IncidentRecorder {
    pub fn new(dir: impl Into<PathBuf>, factory: Arc<dyn SinkFactory>, fps: f64) -> Self {
        Self {
            dir: dir.into(),
            factory,
            fps,
            active: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }

    pub fn current_name(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.filename.as_str())
    }

    pub fn frames_written(&self) -> u64 {
        self.active.as_ref().map(|a| a.frames).unwrap_or(0)
    }

    /// Open a new recording and write `seed` into it.
    ///
    /// Geometry comes from the first seed frame, then `live_hint`, then
    /// [`DEFAULT_GEOMETRY`]. Returns the file name.
    pub fn start(
        &mut self,
        seed: Vec<Frame>,
        session_id: Uuid,
        started_at: DateTime<Utc>,
        live_hint: Option<FrameGeometry>,
    ) -> Result<String, RecorderError> {
        if let Some(active) = &self.active {
            return Err(RecorderError::Open {
                path: active.filename.clone(),
                reason: "a recording is already open".into(),
            });
        }

        let geometry = seed
            .first()
            .map(Frame::geometry)
            .or(live_hint)
            .unwrap_or(DEFAULT_GEOMETRY);

        std::fs::create_dir_all(&self.dir).map_err(|e| RecorderError::Open {
            path: self.dir.display().to_string(),
            reason: e.to_string(),
        })?;
        let (filename, path) = self.unique_path(&session_id, started_at);

        let sink = self.factory.open(&path, geometry, self.fps)?;
        let mut active = ActiveRecording {
            sink,
            filename: filename.clone(),
            path,
            frames: 0,
            last_pts: None,
        };

        for frame in seed.iter().filter(|f| f.is_well_formed()) {
            if !active.accepts(frame) {
                continue;
            }
            if let Err(e) = active.write(frame) {
                log::error!("Seeding recording {} failed: {}", filename, e);
                let path = active.path.clone();
                active.close();
                if let Err(e) = std::fs::remove_file(&path) {
                    log::warn!("Failed to remove unusable recording {}: {}", path.display(), e);
                }
                return Err(e);
            }
        }

        log::info!(
            "Recording {} opened ({}x{}, {} buffered frames)",
            filename,
            geometry.width,
            geometry.height,
            active.frames
        );
        self.active = Some(active);
        Ok(filename)
    }

    /// Append one live frame. A sink failure closes the recording.
    pub fn write(&mut self, frame: &Frame) -> WriteOutcome {
        let Some(active) = self.active.as_mut() else {
            return WriteOutcome::Skipped;
        };
        if !active.accepts(frame) {
            log::debug!("Dropping out-of-order frame at {:?} for {}", frame.pts, active.filename);
            return WriteOutcome::Skipped;
        }

        match active.write(frame) {
            Ok(()) => WriteOutcome::Written,
            Err(error) => {
                log::error!("Write to {} failed, closing recording: {}", active.filename, error);
                let summary = match self.active.take() {
                    Some(active) => active.close(),
                    None => return WriteOutcome::Skipped,
                };
                WriteOutcome::Failed { error, summary }
            }
        }
    }

    /// Finish the open recording. `None` if nothing was open.
    pub fn complete(&mut self) -> Option<RecordingSummary> {
        let summary = self.active.take()?.close();
        log::info!(
            "Recording {} closed ({} frames, {} bytes)",
            summary.filename,
            summary.frames,
            summary.byte_size
        );
        Some(summary)
    }

    fn unique_path(&self, session_id: &Uuid, started_at: DateTime<Utc>) -> (String, PathBuf) {
        let ext = self.factory.format().extension();
        let stem = recording_stem(session_id, started_at);

        let mut filename = format!("{}.{}", stem, ext);
        let mut n = 1;
        while self.dir.join(&filename).exists() {
            filename = format!("{}_{}.{}", stem, n, ext);
            n += 1;
        }
        let path = self.dir.join(&filename);
        (filename, path)
    }
}

impl Drop for IncidentRecorder {
    fn drop(&mut self) {
        if let Some(summary) = self.complete() {
            log::warn!("Recording {} closed on drop", summary.filename);
        }
    }
}

/// `incident_<UTC yyyymmdd_HHMMSS>_<session token>`
pub fn recording_stem(session_id: &Uuid, started_at: DateTime<Utc>) -> String {
    format!("incident_{}_{}", started_at.format("%Y%m%d_%H%M%S"), short_token(session_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{AviSinkFactory, ContainerFormat};
    use chrono::TimeZone;

    fn frame(ms: u64) -> Frame {
        Frame::new(vec![50u8; 4 * 4 * 3], 4, 4, Duration::from_millis(ms), Utc::now())
    }

    fn recorder(dir: &Path) -> IncidentRecorder {
        IncidentRecorder::new(dir, Arc::new(AviSinkFactory), 30.0)
    }

    /// Sink that fails after a number of frames
    struct Failing {
        left: usize,
    }

    impl RecordingSink for Failing {
        fn write(&mut self, _frame: &Frame) -> Result<(), RecorderError> {
            if self.left == 0 {
                return Err(RecorderError::Write("disk full".into()));
            }
            self.left -= 1;
            Ok(())
        }
        fn bytes_written(&self) -> u64 {
            0
        }
        fn finish(self: Box<Self>) -> Result<u64, RecorderError> {
            Ok(0)
        }
    }

    struct FailingFactory(usize);

    impl SinkFactory for FailingFactory {
        fn open(&self, path: &Path, _: FrameGeometry, _: f64) -> Result<Box<dyn RecordingSink>, RecorderError> {
            std::fs::write(path, b"").map_err(|e| RecorderError::Write(e.to_string()))?;
            Ok(Box::new(Failing { left: self.0 }))
        }
        fn format(&self) -> ContainerFormat {
            ContainerFormat::Avi
        }
    }

    #[test]
    fn name_encodes_time_and_session() {
        let id = Uuid::parse_str("0123456789abcdef0123456789abcdef").unwrap();
        let at = Utc.with_ymd_and_hms(2026, 10, 18, 9, 5, 7).unwrap();
        assert_eq!(recording_stem(&id, at), "incident_20261018_090507_01234567");
    }

    #[test]
    fn same_second_same_session_gets_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recorder(dir.path());
        let id = Uuid::new_v4();
        let at = Utc::now();

        let first = rec.start(vec![frame(0)], id, at, None).unwrap();
        rec.complete().unwrap();
        let second = rec.start(vec![frame(0)], id, at, None).unwrap();
        rec.complete().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn seeds_then_live_frames_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recorder(dir.path());
        rec.start(vec![frame(0), frame(33), frame(66)], Uuid::new_v4(), Utc::now(), None)
            .unwrap();

        assert!(matches!(rec.write(&frame(100)), WriteOutcome::Written));
        // Not newer than the last frame written
        assert!(matches!(rec.write(&frame(66)), WriteOutcome::Skipped));
        assert_eq!(rec.frames_written(), 4);

        let summary = rec.complete().unwrap();
        assert_eq!(summary.frames, 4);
        let on_disk = std::fs::metadata(dir.path().join(&summary.filename)).unwrap().len();
        assert_eq!(summary.byte_size, on_disk);
    }

    #[test]
    fn complete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recorder(dir.path());
        assert!(rec.complete().is_none());
        rec.start(Vec::new(), Uuid::new_v4(), Utc::now(), Some(FrameGeometry { width: 4, height: 4 }))
            .unwrap();
        assert!(rec.complete().is_some());
        assert!(rec.complete().is_none());
        assert!(!rec.is_open());
    }

    #[test]
    fn empty_seed_without_hint_uses_default_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recorder(dir.path());
        rec.start(Vec::new(), Uuid::new_v4(), Utc::now(), None).unwrap();
        // A live 640x480 frame fits exactly
        let live = Frame::new(vec![0u8; DEFAULT_GEOMETRY.rgb_len()], 640, 480, Duration::ZERO, Utc::now());
        assert!(matches!(rec.write(&live), WriteOutcome::Written));
        rec.complete();
    }

    #[test]
    fn write_failure_force_closes() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = IncidentRecorder::new(dir.path(), Arc::new(FailingFactory(1)), 30.0);
        rec.start(vec![frame(0)], Uuid::new_v4(), Utc::now(), None).unwrap();

        match rec.write(&frame(33)) {
            WriteOutcome::Failed { summary, .. } => assert_eq!(summary.frames, 1),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(!rec.is_open());
        assert!(matches!(rec.write(&frame(66)), WriteOutcome::Skipped));
    }

    #[test]
    fn start_while_open_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recorder(dir.path());
        rec.start(vec![frame(0)], Uuid::new_v4(), Utc::now(), None).unwrap();
        assert!(rec.start(vec![frame(0)], Uuid::new_v4(), Utc::now(), None).is_err());
        rec.complete();
    }

    #[test]
    fn seed_failure_discards_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = IncidentRecorder::new(dir.path(), Arc::new(FailingFactory(1)), 30.0);

        let seed = vec![frame(0), frame(33), frame(66)];
        assert!(rec.start(seed, Uuid::new_v4(), Utc::now(), None).is_err());
        assert!(!rec.is_open());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
