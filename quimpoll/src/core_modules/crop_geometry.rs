// THEORY:
// `CropGeometry` turns a wrist position and a face-relative scale into the
// rectangle that will be cut out of the frame and handed to the gesture
// classifier. The box is a square centered on the wrist, clipped to the frame.
// Anything that clips down to nothing is reported as "no crop" so that a
// zero-area image can never reach the classifier.

use image::{RgbImage, imageops};

/// Integer pixel rectangle, half-open on the max side.
/// Invariant: `x_min < x_max <= frame_width` and `y_min < y_max <= frame_height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropBox {
    pub x_min: u32,
    pub y_min: u32,
    pub x_max: u32,
    pub y_max: u32,
}

impl CropBox {
    pub fn width(&self) -> u32 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> u32 {
        self.y_max - self.y_min
    }

    /// Copies the boxed region out of `frame`.
    pub fn extract(&self, frame: &RgbImage) -> RgbImage {
        imageops::crop_imm(frame, self.x_min, self.y_min, self.width(), self.height()).to_image()
    }
}

/// Computes the crop around a wrist, or `None` if clipping leaves no area.
///
/// `scale` is the signed face width; only its magnitude is used.
pub fn crop_box(
    wrist: (f32, f32),
    scale: f32,
    crop_scale: f32,
    frame_width: u32,
    frame_height: u32,
) -> Option<CropBox> {
    let half = (scale * crop_scale).abs();
    let (x, y) = wrist;
    if !half.is_finite() || !x.is_finite() || !y.is_finite() || half == 0.0 {
        return None;
    }

    let (x_min, x_max) = clip_span(x - half, x + half, frame_width)?;
    let (y_min, y_max) = clip_span(y - half, y + half, frame_height)?;

    Some(CropBox {
        x_min,
        y_min,
        x_max,
        y_max,
    })
}

/// Rounds a span outward to whole pixels and clips it into `[0, limit]`.
fn clip_span(low: f32, high: f32, limit: u32) -> Option<(u32, u32)> {
    let limit_f = limit as f32;
    let low = low.floor().clamp(0.0, limit_f) as u32;
    let high = high.ceil().clamp(0.0, limit_f) as u32;
    (low < high).then_some((low, high))
}
