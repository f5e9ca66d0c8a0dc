pub mod annotate;
pub mod crop_geometry;
pub mod gesture_aggregator;
pub mod keypoint_analyzer;
pub mod media_encoder;
pub mod output_store;
pub mod poll_data;
pub mod poll_data_store;
pub mod range_streamer;
