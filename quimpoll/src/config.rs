use serde::{Deserialize, Serialize};

/// Configuration for the GesturePipeline, allowing for tunable behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// A wrist must be detected with a confidence strictly above this value
    /// before it is considered for cropping.
    #[serde(default = "default_gesture_threshold")]
    pub gesture_threshold: f32,
    /// Multiplier applied to the face width to obtain the crop half-extent.
    #[serde(default = "default_crop_scale")]
    pub crop_scale: f32,
    /// JPEG quality (1-100) for inline and on-disk artifacts.
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Frame rate used for the output video when the source does not report one.
    #[serde(default = "default_fps")]
    pub default_fps: f64,
    /// Draw the pose skeleton and hand landmarks onto the artifacts.
    #[serde(default = "default_annotate")]
    pub annotate: bool,
}

fn default_gesture_threshold() -> f32 {
    0.6
}

fn default_crop_scale() -> f32 {
    1.0
}

fn default_jpeg_quality() -> u8 {
    90
}

fn default_fps() -> f64 {
    30.0
}

fn default_annotate() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            gesture_threshold: default_gesture_threshold(),
            crop_scale: default_crop_scale(),
            jpeg_quality: default_jpeg_quality(),
            default_fps: default_fps(),
            annotate: default_annotate(),
        }
    }
}
