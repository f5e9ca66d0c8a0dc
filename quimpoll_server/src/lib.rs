//! HTTP front end for the quimpoll gesture pipeline.
//!
//! Routes:
//! - `PUT /inference` multipart upload (`file` field) that runs the pipeline
//! - `GET /inference` the last published report
//! - `GET /videos` the annotated video, with byte-range support
//! - `GET /healthz` liveness

pub mod bridge;
pub mod ffmpeg;

use anyhow::Context;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use quimpoll::{
    GestureClassifier, GesturePipeline, MediaKind, OutputStore, PipelineConfig, PipelineError,
    PollDataStore, PoseProvider, RangeError, RangeStreamer, SharedOutputStore, StoreError,
    StreamResponse, VideoBackend,
};
use quimpoll::core_modules::range_streamer::unsatisfied_content_range;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

pub use bridge::{SubprocessGestureClassifier, SubprocessPoseProvider};
pub use ffmpeg::FfmpegBackend;

const DEFAULT_CONFIG_FILE: &str = "quimpoll.toml";
const UPLOAD_FIELD: &str = "file";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Directory holding the artifacts of the latest run.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Scratch directory for uploads being processed.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    #[serde(default = "default_report_path")]
    pub report_path: PathBuf,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// argv of the pose helper process.
    #[serde(default = "default_pose_command")]
    pub pose_command: Vec<String>,
    /// argv of the gesture helper process.
    #[serde(default = "default_gesture_command")]
    pub gesture_command: Vec<String>,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

fn default_bind_addr() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_report_path() -> PathBuf {
    PathBuf::from("data/poll_data.json")
}

fn default_max_upload_bytes() -> usize {
    512 * 1024 * 1024
}

fn default_pose_command() -> Vec<String> {
    vec!["python3".into(), "helpers/pose_detect.py".into()]
}

fn default_gesture_command() -> Vec<String> {
    vec!["python3".into(), "helpers/gesture_detect.py".into()]
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_video_codec() -> String {
    "libx264".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            output_dir: default_output_dir(),
            upload_dir: default_upload_dir(),
            report_path: default_report_path(),
            max_upload_bytes: default_max_upload_bytes(),
            pose_command: default_pose_command(),
            gesture_command: default_gesture_command(),
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            video_codec: default_video_codec(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Reads the TOML file named by `QP_CONFIG` (or `quimpoll.toml` if present),
    /// then applies the `QP_*` environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let explicit = std::env::var("QP_CONFIG").ok().map(PathBuf::from);
        let mut cfg = match explicit {
            Some(path) => Self::from_file(&path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        cfg.apply_overrides(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(bind) = lookup("QP_BIND") {
            self.bind_addr = bind;
        }
        if let Some(dir) = lookup("QP_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("QP_REPORT_PATH") {
            self.report_path = PathBuf::from(path);
        }
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<Mutex<GesturePipeline>>,
    store: SharedOutputStore,
    reports: Arc<PollDataStore>,
    upload_dir: Arc<PathBuf>,
    uploads: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(
        cfg: &ServerConfig,
        pose: Box<dyn PoseProvider>,
        classifier: Box<dyn GestureClassifier>,
        video: Arc<dyn VideoBackend>,
    ) -> anyhow::Result<Self> {
        let store = OutputStore::open(&cfg.output_dir)
            .with_context(|| format!("failed to open output dir {}", cfg.output_dir.display()))?
            .shared();
        let reports = Arc::new(PollDataStore::open(&cfg.report_path)?);
        std::fs::create_dir_all(&cfg.upload_dir)
            .with_context(|| {
                format!("failed to create upload dir {}", cfg.upload_dir.display())
            })?;

        let pipeline = GesturePipeline::new(
            cfg.pipeline.clone(),
            pose,
            classifier,
            video,
            store.clone(),
            reports.clone(),
        );

        Ok(Self {
            pipeline: Arc::new(Mutex::new(pipeline)),
            store,
            reports,
            upload_dir: Arc::new(cfg.upload_dir.clone()),
            uploads: Arc::new(AtomicU64::new(0)),
        })
    }
}

/// A rejected request.
#[derive(Debug)]
pub enum ApiError {
    Pipeline(PipelineError),
    Range(RangeError),
    BadRequest(String),
    Internal(String),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError::Pipeline(err)
    }
}

impl From<RangeError> for ApiError {
    fn from(err: RangeError) -> Self {
        ApiError::Range(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Pipeline(err) => {
                let status = match err {
                    PipelineError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
                    PipelineError::MissingFile | PipelineError::CorruptMedia(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    error!(error = %err, "run failed");
                } else {
                    warn!(error = %err, "upload rejected");
                }
                (status, err.to_string()).into_response()
            }
            ApiError::Range(err) => match err {
                RangeError::Malformed(_) => {
                    (StatusCode::BAD_REQUEST, err.to_string()).into_response()
                }
                RangeError::Unsatisfiable { size, .. } => (
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    [(header::CONTENT_RANGE, unsatisfied_content_range(size))],
                    err.to_string(),
                )
                    .into_response(),
                RangeError::NotFound => (StatusCode::NOT_FOUND, err.to_string()).into_response(),
                RangeError::Io(_) => {
                    error!(error = %err, "video read failed");
                    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
                }
            },
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::Internal(msg) => {
                error!(error = %msg, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response()
            }
        }
    }
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/inference", get(get_inference).put(put_inference))
        .route("/videos", get(get_video))
        .route("/healthz", get(|| async { "ok" }))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

async fn put_inference(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<&'static str, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let file_name = field.file_name().map(str::to_string);
        let data = field.bytes().await.map_err(|e| ApiError::BadRequest(e.to_string()))?;
        return process_upload(&state, file_name.as_deref(), data).await;
    }
    Err(PipelineError::MissingFile.into())
}

/// Saves the upload, runs the pipeline on it and answers once the report is published.
pub async fn process_upload(
    state: &AppState,
    file_name: Option<&str>,
    data: Bytes,
) -> Result<&'static str, ApiError> {
    let file_name = file_name
        .filter(|n| !n.is_empty())
        .ok_or(PipelineError::MissingFile)?;
    let extension = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    MediaKind::from_extension(&extension)?;

    let id = state.uploads.fetch_add(1, Ordering::Relaxed);
    let upload_name = format!("upload-{}-{id}.{extension}", std::process::id());
    let upload_path = state.upload_dir.join(upload_name);
    tokio::fs::write(&upload_path, &data)
        .await
        .map_err(|e| ApiError::Internal(format!("failed to save upload: {e}")))?;
    info!(file = file_name, bytes = data.len(), "upload received");

    let pipeline = state.pipeline.clone();
    let input = upload_path.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let mut pipeline = pipeline.lock().unwrap_or_else(|e| e.into_inner());
        pipeline.process(&input, &extension)
    })
    .await;

    if let Err(e) = tokio::fs::remove_file(&upload_path).await {
        warn!(path = %upload_path.display(), error = %e, "failed to remove upload");
    }

    outcome.map_err(|e| ApiError::Internal(format!("pipeline task failed: {e}")))??;
    Ok("200")
}

pub async fn get_inference(State(state): State<AppState>) -> Response {
    match state.reports.read() {
        Ok(report) => Json(report.as_ref()).into_response(),
        Err(StoreError::NotYetAvailable) => {
            (StatusCode::NOT_FOUND, "no report yet").into_response()
        }
        Err(e) => ApiError::Internal(e.to_string()).into_response(),
    }
}

pub async fn get_video(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let range = headers
        .get(header::RANGE)
        .map(|v| {
            v.to_str().map_err(|_| {
                RangeError::Malformed(String::from_utf8_lossy(v.as_bytes()).into_owned())
            })
        })
        .transpose()?;

    // Held until the body is read so a run cannot rewrite the file mid-request.
    let store = state.store.read().await;
    let response = RangeStreamer::new(store.video_path()).serve(range).await?;
    drop(store);

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    let status = match &response {
        StreamResponse::Full { .. } => StatusCode::OK,
        StreamResponse::Partial { range, .. } => {
            let value = HeaderValue::from_str(&range.content_range())
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            headers.insert(header::CONTENT_RANGE, value);
            StatusCode::PARTIAL_CONTENT
        }
    };
    Ok((status, headers, response.into_body()).into_response())
}

/// Starts the helper processes and serves HTTP until the task is dropped.
pub async fn start_server(cfg: ServerConfig) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let pose = SubprocessPoseProvider::spawn(&cfg.pose_command)?;
    let classifier = SubprocessGestureClassifier::spawn(&cfg.gesture_command)?;
    let video = FfmpegBackend::new(&cfg.ffmpeg_path, &cfg.ffprobe_path, &cfg.video_codec);
    let state = AppState::new(&cfg, Box::new(pose), Box::new(classifier), Arc::new(video))?;
    let app = router(state, cfg.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.bind_addr))?;
    info!(
        bind = %cfg.bind_addr,
        output_dir = %cfg.output_dir.display(),
        report = %cfg.report_path.display(),
        "quimpoll server listening"
    );

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "server stopped");
        }
    }))
}
