// THEORY:
// The pipeline depends on four capabilities it does not implement itself: finding
// people in a frame, recognising a hand gesture in a crop, and decoding/encoding
// video. Each is a trait so the core can be driven by real models in the server
// and by scripted fakes in tests. All frames cross these seams as RGB images.

use crate::core_modules::gesture_aggregator::GestureResult;
use crate::core_modules::keypoint_analyzer::Person;
use crate::error::PipelineResult;
use image::RgbImage;
use std::path::Path;

/// Supplies 17-keypoint poses for every person found in a frame.
pub trait PoseProvider: Send {
    /// People in output order. `Person::index` must equal the position in the
    /// returned vector.
    fn detect(&mut self, frame: &RgbImage) -> PipelineResult<Vec<Person>>;
}

/// Recognises the dominant hand gesture in a crop.
pub trait GestureClassifier: Send {
    /// `Ok(None)` means no hand or no gesture was found.
    fn classify(&mut self, crop: &RgbImage) -> PipelineResult<Option<GestureResult>>;
}

/// A decoded video, yielding frames strictly in decode order.
pub trait VideoSource: Send {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    /// Native frame rate, if the container reports one.
    fn fps(&self) -> Option<f64>;
    /// The next frame, or `Ok(None)` after the last one.
    fn next_frame(&mut self) -> PipelineResult<Option<RgbImage>>;
}

/// An encoder writing frames to a video file.
pub trait VideoSink: Send {
    fn write_frame(&mut self, frame: &RgbImage) -> PipelineResult<()>;
    /// Flushes and closes the file. The file is only complete after this returns.
    fn finish(self: Box<Self>) -> PipelineResult<()>;
}

/// Opens sources and creates sinks.
pub trait VideoBackend: Send + Sync {
    /// Opening must fail with `PipelineError::CorruptMedia` for unreadable input.
    fn open(&self, path: &Path) -> PipelineResult<Box<dyn VideoSource>>;
    fn create_sink(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        fps: f64,
    ) -> PipelineResult<Box<dyn VideoSink>>;
}
