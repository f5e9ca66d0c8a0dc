// THEORY:
// The `MediaEncoder` is the bridge between in-memory pixels and the two forms the
// outside world receives them in: compressed JPEG files in the output store, and
// base64 text embedded directly in the polling report.

use crate::core_modules::gesture_aggregator::AggregationKey;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageResult, RgbImage};

/// Annotated still image for an image run.
pub const OUTPUT_IMAGE: &str = "output.jpg";
/// Annotated video for a video run.
pub const OUTPUT_VIDEO: &str = "output.mp4";

/// Deterministic artifact name for a gesture crop, e.g. `person0_gesture1.jpg`.
pub fn gesture_artifact_name(key: &AggregationKey) -> String {
    format!("{key}.jpg")
}

/// Compresses an RGB image to JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> ImageResult<Vec<u8>> {
    let mut buffer = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));
    encoder.write_image(image.as_raw(), image.width(), image.height(), ExtendedColorType::Rgb8)?;
    Ok(buffer)
}

/// Standard (padded) base64 text of arbitrary bytes.
pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// JPEG-then-base64, the inline form used in the report.
pub fn encode_inline(image: &RgbImage, quality: u8) -> ImageResult<String> {
    Ok(to_base64(&encode_jpeg(image, quality)?))
}
