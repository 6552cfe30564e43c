// Detection overlays for recorded and previewed frames

use crate::detection::Detection;

use super::{Frame, BYTES_PER_PIXEL};

/// Box outline colour (RGB)
pub const BOX_COLOR: [u8; 3] = [255, 0, 0];

/// Box outline thickness in pixels
pub const BOX_THICKNESS: u32 = 2;

/// Return a copy of `frame` with a rectangle drawn around every detection.
///
/// Frames without detections (or with a malformed pixel buffer) are returned
/// as-is without copying.
pub fn annotate(frame: &Frame, detections: &[Detection]) -> Frame {
    if detections.is_empty() || !frame.is_well_formed() || frame.width == 0 || frame.height == 0 {
        return frame.clone();
    }

    let mut pixels = frame.data.to_vec();
    for detection in detections {
        draw_box(&mut pixels, frame.width, frame.height, detection);
    }

    Frame {
        data: pixels.into(),
        ..frame.clone()
    }
}

fn draw_box(pixels: &mut [u8], width: u32, height: u32, detection: &Detection) {
    let clamp_x = |v: f32| (v.max(0.0) as u32).min(width - 1);
    let clamp_y = |v: f32| (v.max(0.0) as u32).min(height - 1);

    let bbox = &detection.bbox;
    let (x1, x2) = (clamp_x(bbox.x1.min(bbox.x2)), clamp_x(bbox.x1.max(bbox.x2)));
    let (y1, y2) = (clamp_y(bbox.y1.min(bbox.y2)), clamp_y(bbox.y1.max(bbox.y2)));

    for t in 0..BOX_THICKNESS {
        // Horizontal edges
        for x in x1..=x2 {
            put(pixels, width, x, (y1 + t).min(y2));
            put(pixels, width, x, y2.saturating_sub(t).max(y1));
        }
        // Vertical edges
        for y in y1..=y2 {
            put(pixels, width, (x1 + t).min(x2), y);
            put(pixels, width, x2.saturating_sub(t).max(x1), y);
        }
    }
}

fn put(pixels: &mut [u8], width: u32, x: u32, y: u32) {
    let offset = (y as usize * width as usize + x as usize) * BYTES_PER_PIXEL;
    if let Some(px) = pixels.get_mut(offset..offset + BYTES_PER_PIXEL) {
        px.copy_from_slice(&BOX_COLOR);
    }
}
