// Video frames and capture sources
//
// The worker thread is the only reader of a capture device. Everything else
// (recorder, rolling buffer, live preview) works on `Frame` values that the
// worker has already pulled, so pixel data lives behind an `Arc` and cloning
// a frame never copies it.

pub mod annotate;
pub mod preview;

#[cfg(feature = "gstreamer")]
pub mod gst_source;

pub use preview::{FrameBroadcast, PreviewFrame, PreviewStream};

#[cfg(feature = "gstreamer")]
pub use gst_source::GstCameraOpener;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Frame geometry used when nothing better is known (no seed frames, no live frame)
pub const DEFAULT_GEOMETRY: FrameGeometry = FrameGeometry { width: 640, height: 480 };

/// Bytes per pixel of the packed RGB24 layout every source delivers
pub const BYTES_PER_PIXEL: usize = 3;

/// Error type for capture sources
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The device could not be opened; fatal to starting monitoring
    #[error("Failed to open camera {index}: {reason}")]
    Open { index: u32, reason: String },

    /// A single read failed; the caller backs off and retries
    #[error("Frame read failed: {0}")]
    Read(String),

    /// The source has no more frames
    #[error("End of stream")]
    EndOfStream,
}

/// Width and height of a frame in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
}

impl FrameGeometry {
    /// Number of bytes a packed RGB24 frame of this size occupies
    pub fn rgb_len(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }
}

/// A decoded RGB24 frame plus its capture timestamps
#[derive(Debug, Clone)]
pub struct Frame {
    /// Packed RGB24 pixels, row-major, top row first
    pub data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    /// Monotonic capture timestamp relative to the start of the stream.
    /// All incident timing is derived from this value.
    pub pts: Duration,
    /// Wall-clock capture time, used for file names and log records
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(data: impl Into<Arc<[u8]>>, width: u32, height: u32, pts: Duration, captured_at: DateTime<Utc>) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            pts,
            captured_at,
        }
    }

    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry { width: self.width, height: self.height }
    }

    /// True if the pixel buffer matches the declared geometry
    pub fn is_well_formed(&self) -> bool {
        self.data.len() == self.geometry().rgb_len()
    }
}

/// An open capture device.
///
/// `read` blocks until the next frame is available. Only the monitor worker
/// calls it; preview consumers subscribe to a [`FrameBroadcast`] instead.
pub trait VideoSource: Send {
    fn read(&mut self) -> Result<Frame, SourceError>;

    /// Release the device. Must be safe to call more than once.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Opens capture devices by index
pub trait SourceOpener: Send + Sync {
    fn open(&self, index: u32) -> Result<Box<dyn VideoSource>, SourceError>;
}

impl<F> SourceOpener for F
where
    F: Fn(u32) -> Result<Box<dyn VideoSource>, SourceError> + Send + Sync,
{
    fn open(&self, index: u32) -> Result<Box<dyn VideoSource>, SourceError> {
        self(index)
    }
}
