//! Matroska recording sink built on GStreamer
//!
//! Pipeline: `appsrc ! queue ! videoconvert ! jpegenc ! matroskamux ! filesink`.
//! Frames are pushed from the monitor worker with their capture timestamps
//! rebased to the first frame, so pre-incident and live frames keep their
//! original spacing in the file.

use std::path::{Path, PathBuf};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;

use crate::video::{Frame, FrameGeometry};

use super::{ContainerFormat, RecorderError, RecordingSink, Result, SinkFactory};

/// JPEG quality used for recorded frames
const JPEG_QUALITY: i32 = 85;

/// Seconds to wait for the muxer to finalize after end-of-stream
const EOS_TIMEOUT_SECS: u64 = 30;

fn pipeline_err(what: &str, e: impl std::fmt::Display) -> RecorderError {
    RecorderError::Write(format!("{}: {}", what, e))
}

/// Opens [`MkvSink`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct MkvSinkFactory;

impl SinkFactory for MkvSinkFactory {
    fn open(&self, path: &Path, geometry: FrameGeometry, fps: f64) -> Result<Box<dyn RecordingSink>> {
        crate::gstreamer_init::init().map_err(|e| RecorderError::Unsupported(e.to_string()))?;
        Ok(Box::new(MkvSink::new(path, geometry, fps)?))
    }

    fn format(&self) -> ContainerFormat {
        ContainerFormat::Mkv
    }
}

/// MJPEG-in-Matroska writer
pub struct MkvSink {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    path: PathBuf,
    geometry: FrameGeometry,
    frame_duration_ns: u64,
    first_pts: Option<u64>,
    bytes_pushed: u64,
    frames: u64,
}

impl MkvSink {
    pub fn new(path: &Path, geometry: FrameGeometry, fps: f64) -> Result<Self> {
        let fps = if fps.is_finite() && fps > 0.0 { fps } else { 30.0 };
        let pipeline = Self::create_pipeline(path, geometry, fps).map_err(|e| RecorderError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| pipeline_err("Pipeline", "could not find appsrc"))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| pipeline_err("Pipeline", "could not downcast to AppSrc"))?;

        pipeline.set_state(gst::State::Playing).map_err(|e| RecorderError::Open {
            path: path.display().to_string(),
            reason: format!("Failed to start pipeline: {:?}", e),
        })?;

        log::debug!("MKV pipeline started for {}", path.display());

        Ok(Self {
            pipeline,
            appsrc,
            path: path.to_path_buf(),
            geometry,
            frame_duration_ns: (1_000_000_000.0 / fps) as u64,
            first_pts: None,
            bytes_pushed: 0,
            frames: 0,
        })
    }

    fn create_pipeline(path: &Path, geometry: FrameGeometry, fps: f64) -> Result<gst::Pipeline> {
        let pipeline = gst::Pipeline::new();

        let caps = gst::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .field("width", geometry.width as i32)
            .field("height", geometry.height as i32)
            .field("framerate", gst::Fraction::new((fps * 1000.0).round() as i32, 1000))
            .build();

        let appsrc = gst_app::AppSrc::builder()
            .name("src")
            .caps(&caps)
            .format(gst::Format::Time)
            .is_live(true)
            .stream_type(gst_app::AppStreamType::Stream)
            .build();

        let queue = gst::ElementFactory::make("queue")
            .property("max-size-buffers", 60u32)
            .property("max-size-time", 0u64)
            .property("max-size-bytes", 0u32)
            .build()
            .map_err(|e| pipeline_err("Failed to create queue", e))?;

        let videoconvert = gst::ElementFactory::make("videoconvert")
            .build()
            .map_err(|e| pipeline_err("Failed to create videoconvert", e))?;

        let jpegenc = gst::ElementFactory::make("jpegenc")
            .property("quality", JPEG_QUALITY)
            .build()
            .map_err(|e| pipeline_err("Failed to create jpegenc", e))?;

        let muxer = gst::ElementFactory::make("matroskamux")
            .build()
            .map_err(|e| pipeline_err("Failed to create matroskamux", e))?;

        let filesink = gst::ElementFactory::make("filesink")
            .property("location", path.to_string_lossy().to_string())
            .property("async", false)
            .property("sync", false)
            .build()
            .map_err(|e| pipeline_err("Failed to create filesink", e))?;

        pipeline
            .add_many([appsrc.upcast_ref(), &queue, &videoconvert, &jpegenc, &muxer, &filesink])
            .map_err(|e| pipeline_err("Failed to add elements", e))?;
        gst::Element::link_many([appsrc.upcast_ref(), &queue, &videoconvert, &jpegenc, &muxer, &filesink])
            .map_err(|e| pipeline_err("Failed to link elements", e))?;

        Ok(pipeline)
    }

    /// Surface asynchronous pipeline errors on the next write
    fn check_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else { return Ok(()) };
        while let Some(msg) = bus.pop() {
            if let gst::MessageView::Error(err) = msg.view() {
                return Err(RecorderError::Write(format!("{} ({:?})", err.error(), err.debug())));
            }
        }
        Ok(())
    }
}

impl RecordingSink for MkvSink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        if frame.geometry() != self.geometry || !frame.is_well_formed() {
            return Err(RecorderError::Geometry(format!(
                "frame is {}x{} ({} bytes), recording is {}x{}",
                frame.width,
                frame.height,
                frame.data.len(),
                self.geometry.width,
                self.geometry.height
            )));
        }
        self.check_bus()?;

        let pts_ns = frame.pts.as_nanos() as u64;
        let base = *self.first_pts.get_or_insert(pts_ns);

        let mut buffer = gst::Buffer::from_slice(frame.data.to_vec());
        if let Some(buffer_ref) = buffer.get_mut() {
            buffer_ref.set_pts(gst::ClockTime::from_nseconds(pts_ns.saturating_sub(base)));
            buffer_ref.set_duration(gst::ClockTime::from_nseconds(self.frame_duration_ns));
        }

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| RecorderError::Write(format!("Failed to push buffer: {:?}", e)))?;

        self.frames += 1;
        self.bytes_pushed += frame.data.len() as u64;
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    fn finish(self: Box<Self>) -> Result<u64> {
        if let Err(e) = self.appsrc.end_of_stream() {
            log::warn!("EOS send failed for {}: {:?}", self.path.display(), e);
        }

        let mut got_eos = false;
        if let Some(bus) = self.pipeline.bus() {
            for msg in bus.iter_timed(gst::ClockTime::from_seconds(EOS_TIMEOUT_SECS)) {
                match msg.view() {
                    gst::MessageView::Eos(..) => {
                        got_eos = true;
                        break;
                    }
                    gst::MessageView::Error(err) => {
                        // Keep whatever the muxer managed to write
                        log::error!("Error while finalizing {}: {}", self.path.display(), err.error());
                        break;
                    }
                    _ => {}
                }
            }
        }
        if !got_eos {
            log::warn!("No EOS from pipeline for {}, forcing stop", self.path.display());
        }

        self.pipeline.set_state(gst::State::Null).ok();

        let size = std::fs::metadata(&self.path).map(|m| m.len())?;
        log::debug!(
            "MKV recording finished: {} ({} frames, {} raw bytes in, {} bytes out)",
            self.path.display(),
            self.frames,
            self.bytes_pushed,
            size
        );
        Ok(size)
    }
}

impl Drop for MkvSink {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
