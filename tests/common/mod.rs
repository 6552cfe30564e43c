// Scripted collaborators shared by the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use vigil_lib::detection::{BoundingBox, Detection, DetectionError, DetectionModel};
use vigil_lib::encoding::{ContainerFormat, RecorderError, RecordingSink, SinkFactory};
use vigil_lib::video::{Frame, FrameGeometry, SourceError, SourceOpener, VideoSource};

pub const WIDTH: u32 = 4;
pub const HEIGHT: u32 = 4;

/// Wall-clock time of pts zero
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()
}

/// The `index`-th frame of a stream at `fps`
pub fn frame_at(index: u64, fps: u64) -> Frame {
    let pts = Duration::from_nanos(index * 1_000_000_000 / fps);
    let captured_at = epoch() + chrono::Duration::from_std(pts).unwrap();
    Frame::new(vec![(index % 251) as u8; (WIDTH * HEIGHT * 3) as usize], WIDTH, HEIGHT, pts, captured_at)
}

pub fn gun() -> Detection {
    Detection {
        label: "gun".into(),
        confidence: 0.92,
        bbox: BoundingBox { x1: 1.0, y1: 1.0, x2: 3.0, y2: 3.0 },
    }
}

/// What a scripted source does on one read
#[derive(Debug, Clone)]
pub enum Read {
    Frame,
    Fail,
    End,
}

/// Camera double: follows a script, then keeps producing frames at `pace`
pub struct ScriptedSource {
    script: Vec<Read>,
    next: usize,
    frame: u64,
    fps: u64,
    pace: Duration,
    open: bool,
    closed: Arc<AtomicBool>,
}

impl VideoSource for ScriptedSource {
    fn read(&mut self) -> Result<Frame, SourceError> {
        if !self.open {
            return Err(SourceError::Read("source closed".into()));
        }
        let step = self.script.get(self.next).cloned().unwrap_or(Read::Frame);
        self.next += 1;
        match step {
            Read::Frame => {
                std::thread::sleep(self.pace);
                let frame = frame_at(self.frame, self.fps);
                self.frame += 1;
                Ok(frame)
            }
            Read::Fail => Err(SourceError::Read("usb hiccup".into())),
            Read::End => Err(SourceError::EndOfStream),
        }
    }

    fn close(&mut self) {
        self.open = false;
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Opener handing out [`ScriptedSource`]s, counting opens and closes
#[derive(Clone)]
pub struct ScriptedOpener {
    pub script: Vec<Read>,
    pub fps: u64,
    pub pace: Duration,
    pub fail_open: bool,
    pub opens: Arc<AtomicUsize>,
    pub closed: Arc<AtomicBool>,
}

impl ScriptedOpener {
    pub fn new(script: Vec<Read>) -> Self {
        Self {
            script,
            fps: 30,
            pace: Duration::from_millis(2),
            fail_open: false,
            opens: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn unplugged() -> Self {
        Self {
            fail_open: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl SourceOpener for ScriptedOpener {
    fn open(&self, index: u32) -> Result<Box<dyn VideoSource>, SourceError> {
        if self.fail_open {
            return Err(SourceError::Open {
                index,
                reason: "no such device".into(),
            });
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.closed.store(false, Ordering::SeqCst);
        Ok(Box::new(ScriptedSource {
            script: self.script.clone(),
            next: 0,
            frame: 0,
            fps: self.fps,
            pace: self.pace,
            open: true,
            closed: self.closed.clone(),
        }))
    }
}

/// Model double: sees a gun in frames whose pts falls inside any window
pub struct ScriptedModel {
    windows: Vec<(Duration, Duration)>,
    failing: bool,
}

impl ScriptedModel {
    pub fn positive_between(windows: &[(f64, f64)]) -> Self {
        Self {
            windows: windows
                .iter()
                .map(|&(from, to)| (Duration::from_secs_f64(from), Duration::from_secs_f64(to)))
                .collect(),
            failing: false,
        }
    }

    pub fn always() -> Self {
        Self::positive_between(&[(0.0, 1.0e6)])
    }

    pub fn broken() -> Self {
        Self {
            windows: Vec::new(),
            failing: true,
        }
    }
}

impl DetectionModel for ScriptedModel {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
        if self.failing {
            return Err(DetectionError::Inference("model crashed".into()));
        }
        let hit = self.windows.iter().any(|(from, to)| frame.pts >= *from && frame.pts < *to);
        Ok(if hit { vec![gun()] } else { Vec::new() })
    }
}

/// Frames written to one in-memory recording
#[derive(Debug, Clone, Default)]
pub struct Written {
    pub pts: Vec<Duration>,
    pub finished: bool,
}

/// Recording sinks that keep frame timestamps in memory
#[derive(Clone, Default)]
pub struct MemorySinks {
    pub files: Arc<Mutex<HashMap<String, Written>>>,
    /// Fail every write after this many frames
    pub fail_after: Option<usize>,
    pub fail_open: bool,
}

impl MemorySinks {
    pub fn get(&self, name: &str) -> Written {
        self.files.lock().get(name).cloned().unwrap_or_default()
    }

    pub fn open_count(&self) -> usize {
        self.files.lock().values().filter(|w| !w.finished).count()
    }
}

struct MemorySink {
    name: String,
    files: Arc<Mutex<HashMap<String, Written>>>,
    fail_after: Option<usize>,
    frames: usize,
}

impl RecordingSink for MemorySink {
    fn write(&mut self, frame: &Frame) -> Result<(), RecorderError> {
        if self.fail_after.is_some_and(|n| self.frames >= n) {
            return Err(RecorderError::Write("disk full".into()));
        }
        self.frames += 1;
        if let Some(written) = self.files.lock().get_mut(&self.name) {
            written.pts.push(frame.pts);
        }
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        (self.frames * (WIDTH * HEIGHT * 3) as usize) as u64
    }

    fn finish(self: Box<Self>) -> Result<u64, RecorderError> {
        if let Some(written) = self.files.lock().get_mut(&self.name) {
            written.finished = true;
        }
        Ok(self.bytes_written())
    }
}

impl SinkFactory for MemorySinks {
    fn open(&self, path: &Path, _geometry: FrameGeometry, _fps: f64) -> Result<Box<dyn RecordingSink>, RecorderError> {
        if self.fail_open {
            return Err(RecorderError::Open {
                path: path.display().to_string(),
                reason: "read-only filesystem".into(),
            });
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.files.lock().insert(name.clone(), Written::default());
        Ok(Box::new(MemorySink {
            name,
            files: self.files.clone(),
            fail_after: self.fail_after,
            frames: 0,
        }))
    }

    fn format(&self) -> ContainerFormat {
        ContainerFormat::Avi
    }
}
