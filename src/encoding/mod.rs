// Recording sinks and container formats
//
// A sink receives RGB24 frames in capture order and turns them into one file.
// The built-in AVI writer needs nothing but the filesystem; the Matroska sink
// goes through GStreamer and is only compiled with the `gstreamer` feature.
// To add a container:
// 1. Add a variant to ContainerFormat
// 2. Add its extension in extension() / from_extension()
// 3. Return its SinkFactory from sink_factory()

pub mod avi;

#[cfg(feature = "gstreamer")]
pub mod encoder;

pub use avi::{avi_file_needs_repair, repair_avi_file, AviSinkFactory, AviStreamWriter};

#[cfg(feature = "gstreamer")]
pub use encoder::MkvSinkFactory;

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::video::{Frame, FrameGeometry};

/// Error type for recording sinks
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("Failed to open recording {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("Failed to write frame: {0}")]
    Write(String),

    #[error("Frame geometry error: {0}")]
    Geometry(String),

    #[error("Container not available: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RecorderError>;

/// An open recording file. Frames must arrive in capture order.
pub trait RecordingSink: Send {
    fn write(&mut self, frame: &Frame) -> Result<()>;

    /// Bytes handed to the file so far
    fn bytes_written(&self) -> u64;

    /// Flush, finalize the container and close the file. Returns the final file size.
    fn finish(self: Box<Self>) -> Result<u64>;
}

/// Creates sinks for one container format
pub trait SinkFactory: Send + Sync {
    fn open(&self, path: &Path, geometry: FrameGeometry, fps: f64) -> Result<Box<dyn RecordingSink>>;

    fn format(&self) -> ContainerFormat;
}

/// Supported container formats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    /// Uncompressed AVI (.avi), written without external dependencies
    #[default]
    Avi,
    /// Matroska with MJPEG (.mkv), needs GStreamer
    Mkv,
}

impl ContainerFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::Avi => "avi",
            ContainerFormat::Mkv => "mkv",
        }
    }

    pub fn from_extension(ext: &str) -> Option<ContainerFormat> {
        match ext.to_lowercase().as_str() {
            "avi" => Some(ContainerFormat::Avi),
            "mkv" => Some(ContainerFormat::Mkv),
            _ => None,
        }
    }

    /// Sink factory for this container in the current build
    pub fn sink_factory(&self) -> Result<Arc<dyn SinkFactory>> {
        match self {
            ContainerFormat::Avi => Ok(Arc::new(AviSinkFactory)),
            #[cfg(feature = "gstreamer")]
            ContainerFormat::Mkv => Ok(Arc::new(MkvSinkFactory)),
            #[cfg(not(feature = "gstreamer"))]
            ContainerFormat::Mkv => Err(RecorderError::Unsupported(
                "Matroska recording requires the gstreamer feature".into(),
            )),
        }
    }
}
