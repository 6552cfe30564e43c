// Rolling pre-incident frame buffer
// Keeps the most recent N seconds of frames so a recording can start with
// footage from before the trigger.

use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

use crate::detection::Detection;
use crate::video::Frame;

/// Upper bound on the buffer window. Raw frames are large; a 640x480 RGB
/// frame is ~900 KB, so 30 s at 30 fps is already ~800 MB.
pub const MAX_BUFFER_SECS: f64 = 30.0;

/// A frame held by the rolling buffer, with what was detected in it
#[derive(Debug, Clone)]
pub struct FrameBufferEntry {
    pub frame: Frame,
    pub detections: Vec<Detection>,
}

/// Fixed-capacity FIFO of recent frames.
///
/// Push and eviction are O(1) (ring buffer); a full buffer overwrites its
/// oldest entry. A zero capacity buffer accepts pushes and keeps nothing.
pub struct RollingFrameBuffer {
    ring: Option<HeapRb<FrameBufferEntry>>,
}

impl RollingFrameBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: (capacity > 0).then(|| HeapRb::new(capacity)),
        }
    }

    /// Capacity for `secs` seconds at `frame_rate`, clamped to [`MAX_BUFFER_SECS`]
    pub fn from_window(frame_rate: f64, secs: f64) -> Self {
        Self::new(capacity_for(frame_rate, secs))
    }

    pub fn push(&mut self, frame: Frame, detections: Vec<Detection>) {
        if let Some(ring) = self.ring.as_mut() {
            ring.push_overwrite(FrameBufferEntry { frame, detections });
        }
    }

    /// All buffered entries, oldest first. The buffer itself is left as is;
    /// frames share pixel data, so this copies no pixels.
    pub fn drain_ordered(&self) -> Vec<FrameBufferEntry> {
        match &self.ring {
            Some(ring) => ring.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.ring.as_ref().map(|r| r.occupied_len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.as_ref().map(|r| r.capacity().get()).unwrap_or(0)
    }

    pub fn clear(&mut self) {
        if let Some(ring) = self.ring.as_mut() {
            ring.clear();
        }
    }
}

/// Frames needed to cover `secs` at `frame_rate`
pub fn capacity_for(frame_rate: f64, secs: f64) -> usize {
    if !frame_rate.is_finite() || !secs.is_finite() || frame_rate <= 0.0 || secs <= 0.0 {
        return 0;
    }
    (frame_rate * secs.min(MAX_BUFFER_SECS)).round() as usize
}
