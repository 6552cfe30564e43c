// Live preview fan-out
//
// Preview consumers never touch the capture device. The monitor worker
// publishes every frame it has read (plus that frame's detections) here, and
// each subscriber gets a small bounded queue; a lagging viewer just misses
// frames.

use std::time::Duration;

use base64::Engine;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::Serialize;

use crate::detection::Detection;
use crate::events::Broadcast;

use super::annotate::annotate;
use super::Frame;

/// Frames a preview subscriber may lag behind before frames are dropped for it
pub const PREVIEW_QUEUE_DEPTH: usize = 4;

/// A frame read by the worker together with what was detected in it
#[derive(Debug, Clone)]
pub struct PreviewFrame {
    pub frame: Frame,
    pub detections: Vec<Detection>,
}

/// Transport form of a preview frame (binary PPM, base64 encoded)
#[derive(Debug, Clone, Serialize)]
pub struct PreviewPayload {
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: u64,
    pub detection_count: usize,
    pub data_base64: String,
}

impl PreviewFrame {
    /// The frame with detection boxes drawn in
    pub fn annotated(&self) -> Frame {
        annotate(&self.frame, &self.detections)
    }

    /// Annotated frame as a binary PPM (P6) image
    pub fn to_ppm(&self) -> Vec<u8> {
        let frame = self.annotated();
        let header = format!("P6\n{} {}\n255\n", frame.width, frame.height);
        let mut out = Vec::with_capacity(header.len() + frame.data.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&frame.data);
        out
    }

    pub fn to_payload(&self) -> PreviewPayload {
        PreviewPayload {
            width: self.frame.width,
            height: self.frame.height,
            timestamp_ms: self.frame.pts.as_millis() as u64,
            detection_count: self.detections.len(),
            data_base64: base64::engine::general_purpose::STANDARD.encode(self.to_ppm()),
        }
    }
}

/// Worker-side handle for publishing preview frames
#[derive(Clone)]
pub struct FrameBroadcast {
    inner: Broadcast<PreviewFrame>,
}

impl FrameBroadcast {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            inner: Broadcast::new(queue_depth),
        }
    }

    pub fn subscribe(&self) -> PreviewStream {
        PreviewStream {
            rx: self.inner.subscribe(),
        }
    }

    /// Publish a frame; a no-op without subscribers
    pub fn publish(&self, frame: &Frame, detections: &[Detection]) {
        if self.inner.subscriber_count() == 0 {
            return;
        }
        self.inner.publish(PreviewFrame {
            frame: frame.clone(),
            detections: detections.to_vec(),
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriber_count()
    }
}

impl Default for FrameBroadcast {
    fn default() -> Self {
        Self::new(PREVIEW_QUEUE_DEPTH)
    }
}

/// Consumer side of the preview fan-out
pub struct PreviewStream {
    rx: Receiver<PreviewFrame>,
}

impl PreviewStream {
    /// Wait up to `timeout` for the next frame.
    /// Returns `None` on timeout or once the monitor has gone away.
    pub fn next(&self, timeout: Duration) -> Option<PreviewFrame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_next(&self) -> Option<PreviewFrame> {
        self.rx.try_recv().ok()
    }

    /// Skip queued frames and return only the most recent one
    pub fn latest(&self) -> Option<PreviewFrame> {
        self.rx.try_iter().last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BoundingBox;
    use chrono::Utc;

    fn frame(ms: u64) -> Frame {
        Frame::new(vec![10u8; 2 * 2 * 3], 2, 2, Duration::from_millis(ms), Utc::now())
    }

    #[test]
    fn subscribers_receive_published_frames() {
        let broadcast = FrameBroadcast::new(2);
        let stream = broadcast.subscribe();

        broadcast.publish(&frame(0), &[]);
        broadcast.publish(&frame(33), &[]);
        broadcast.publish(&frame(66), &[]);

        // Queue depth 2: the third frame was dropped for this subscriber
        assert_eq!(stream.try_next().unwrap().frame.pts, Duration::from_millis(0));
        assert_eq!(stream.latest().unwrap().frame.pts, Duration::from_millis(33));
        assert!(stream.try_next().is_none());
    }

    #[test]
    fn stream_ends_when_broadcast_is_dropped() {
        let broadcast = FrameBroadcast::default();
        let stream = broadcast.subscribe();
        drop(broadcast);
        assert!(stream.next(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn ppm_has_header_and_pixels() {
        let preview = PreviewFrame {
            frame: frame(0),
            detections: Vec::new(),
        };
        let ppm = preview.to_ppm();
        assert!(ppm.starts_with(b"P6\n2 2\n255\n"));
        assert_eq!(ppm.len(), b"P6\n2 2\n255\n".len() + 12);

        let payload = preview.to_payload();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(payload.data_base64)
            .unwrap();
        assert_eq!(decoded, ppm);
    }

    #[test]
    fn annotated_preview_draws_boxes() {
        let preview = PreviewFrame {
            frame: frame(0),
            detections: vec![Detection {
                label: "gun".into(),
                confidence: 0.9,
                bbox: BoundingBox { x1: 0.0, y1: 0.0, x2: 1.0, y2: 1.0 },
            }],
        };
        assert_eq!(&preview.annotated().data[0..3], &super::super::annotate::BOX_COLOR);
    }
}
