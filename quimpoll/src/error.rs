// THEORY:
// Every failure the pipeline can surface is named here. Only two families are
// visible to a caller as a rejected request: bad input (`PipelineError` input
// variants) and bad byte ranges (`RangeError`). Degenerate crops and classifier
// misses are ordinary branches of the algorithm and never become errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No file was submitted")]
    MissingFile,

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Corrupt or unreadable media: {0}")]
    CorruptMedia(String),

    #[error("Pose provider failed: {0}")]
    Pose(String),

    #[error("Gesture classifier failed: {0}")]
    Classifier(String),

    #[error("Video backend failed: {0}")]
    Video(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// True for failures caused by what the caller submitted, as opposed to
    /// failures of a collaborator or the host.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            PipelineError::MissingFile
                | PipelineError::UnsupportedMediaType(_)
                | PipelineError::CorruptMedia(_)
        )
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("No report is available yet")]
    NotYetAvailable,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("Invalid range header: {0:?}")]
    Malformed(String),

    #[error("Range {start}-{end:?} not satisfiable for resource of {size} bytes")]
    Unsatisfiable {
        start: u64,
        end: Option<u64>,
        size: u64,
    },

    #[error("Video resource not found")]
    NotFound,

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for RangeError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            RangeError::NotFound
        } else {
            RangeError::Io(err.to_string())
        }
    }
}
