// Camera capture through GStreamer
//
// Pipeline: platform camera source ! videoconvert ! RGB caps ! appsink.
// The monitor worker pulls samples synchronously; nothing here spawns threads.

use std::time::Duration;

use chrono::Utc;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;

use super::{Frame, SourceError, SourceOpener, VideoSource, BYTES_PER_PIXEL};

/// How long one read waits for a sample before reporting a read failure
const PULL_TIMEOUT: Duration = Duration::from_secs(2);

/// Opens cameras by index with the platform's GStreamer source element
#[derive(Debug, Clone, Default)]
pub struct GstCameraOpener {
    /// Requested capture size; `None` lets the camera choose
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl SourceOpener for GstCameraOpener {
    fn open(&self, index: u32) -> Result<Box<dyn VideoSource>, SourceError> {
        let open_err = |reason: String| SourceError::Open { index, reason };

        crate::gstreamer_init::init().map_err(|e| open_err(e.to_string()))?;
        let source = GstCamera::new(index, self.width, self.height).map_err(open_err)?;
        Ok(Box::new(source))
    }
}

/// A running capture pipeline
pub struct GstCamera {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    index: u32,
    open: bool,
    first_pts: Option<u64>,
}

impl GstCamera {
    fn new(index: u32, width: Option<u32>, height: Option<u32>) -> Result<Self, String> {
        let pipeline = gst::Pipeline::new();
        let source = create_source_element(index)?;

        let convert = gst::ElementFactory::make("videoconvert")
            .build()
            .map_err(|e| format!("Failed to create videoconvert: {}", e))?;

        let mut caps = gst_video::VideoCapsBuilder::new().format(gst_video::VideoFormat::Rgb);
        if let (Some(w), Some(h)) = (width, height) {
            caps = caps.width(w as i32).height(h as i32);
        }

        let appsink = gst_app::AppSink::builder()
            .name("sink")
            .caps(&caps.build())
            .max_buffers(2)
            .drop(true)
            .sync(false)
            .build();

        pipeline
            .add_many([&source, &convert, appsink.upcast_ref()])
            .map_err(|e| format!("Failed to add elements: {}", e))?;
        gst::Element::link_many([&source, &convert, appsink.upcast_ref()])
            .map_err(|e| format!("Failed to link pipeline: {}", e))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| format!("Failed to start capture: {:?}", e))?;

        // Surface "no such device" now rather than on the first read
        let (state, _, _) = pipeline.state(Some(gst::ClockTime::from_seconds(5)));
        if let Err(e) = state {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(format!("Camera did not start: {:?}", e));
        }

        log::info!("Camera {} capture pipeline running", index);

        Ok(Self {
            pipeline,
            appsink,
            index,
            open: true,
            first_pts: None,
        })
    }
}

impl VideoSource for GstCamera {
    fn read(&mut self) -> Result<Frame, SourceError> {
        if !self.open {
            return Err(SourceError::EndOfStream);
        }

        let timeout = gst::ClockTime::from_nseconds(PULL_TIMEOUT.as_nanos() as u64);
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            if self.appsink.is_eos() {
                return Err(SourceError::EndOfStream);
            }
            return Err(SourceError::Read(format!("No frame from camera {} within {:?}", self.index, PULL_TIMEOUT)));
        };

        let caps = sample.caps().ok_or_else(|| SourceError::Read("Sample without caps".into()))?;
        let info = gst_video::VideoInfo::from_caps(caps).map_err(|e| SourceError::Read(e.to_string()))?;
        let (width, height) = (info.width(), info.height());

        let buffer = sample.buffer().ok_or_else(|| SourceError::Read("Sample without buffer".into()))?;
        let map = buffer.map_readable().map_err(|e| SourceError::Read(e.to_string()))?;

        // RGB rows are padded to 4 bytes; repack tightly
        let row = width as usize * BYTES_PER_PIXEL;
        let stride = info.stride().first().map(|s| *s as usize).unwrap_or(row);
        let data: Vec<u8> = if stride == row {
            map.as_slice().to_vec()
        } else {
            map.as_slice()
                .chunks(stride)
                .take(height as usize)
                .flat_map(|r| r[..row.min(r.len())].iter().copied())
                .collect()
        };

        let pts_ns = buffer.pts().map(|t| t.nseconds()).unwrap_or(0);
        let base = *self.first_pts.get_or_insert(pts_ns);

        Ok(Frame::new(
            data,
            width,
            height,
            Duration::from_nanos(pts_ns.saturating_sub(base)),
            Utc::now(),
        ))
    }

    fn close(&mut self) {
        if self.open {
            let _ = self.pipeline.set_state(gst::State::Null);
            self.open = false;
            log::info!("Camera {} released", self.index);
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl Drop for GstCamera {
    fn drop(&mut self) {
        self.close();
    }
}

fn create_source_element(index: u32) -> Result<gst::Element, String> {
    #[cfg(target_os = "windows")]
    let source = gst::ElementFactory::make("mfvideosrc")
        .property("device-index", index as i32)
        .build();

    #[cfg(target_os = "macos")]
    let source = gst::ElementFactory::make("avfvideosrc")
        .property("device-index", index as i32)
        .build();

    #[cfg(target_os = "linux")]
    let source = gst::ElementFactory::make("v4l2src")
        .property("device", format!("/dev/video{}", index))
        .build();

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    let source = gst::ElementFactory::make("autovideosrc").build();

    source.map_err(|e| format!("Failed to create camera source: {}", e))
}
