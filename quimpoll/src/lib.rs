// THEORY:
// This file is the main entry point for the `quimpoll` library crate.
// It follows the standard Rust convention of using `lib.rs` to define the public
// API that will be exposed to external consumers (like the `quimpoll_server`
// HTTP front end).
//
// The primary goal is to export the `GesturePipeline`, the collaborator traits it
// is driven through, and the stores a server reads from as the high-level
// interface for the entire gesture engine. The geometry and aggregation details
// live in `core_modules` and are only needed by callers that want to test or
// reuse individual stages.

pub mod collaborators;
pub mod config;
pub mod core_modules;
pub mod error;
pub mod pipeline;

pub use collaborators::{GestureClassifier, PoseProvider, VideoBackend, VideoSink, VideoSource};
pub use config::PipelineConfig;
pub use core_modules::output_store::{OutputStore, SharedOutputStore};
pub use core_modules::poll_data::PollData;
pub use core_modules::poll_data_store::PollDataStore;
pub use core_modules::range_streamer::{RangeStreamer, StreamResponse};
pub use error::{PipelineError, PipelineResult, RangeError, StoreError};
pub use pipeline::{GesturePipeline, MediaKind};
