//! HTTP surface of a worker node.
//!
//! | Method+Path          | Purpose                        |
//! |----------------------|--------------------------------|
//! | `GET /ping`          | liveness, literal `pong`       |
//! | `GET /status`        | execution-slot snapshot        |
//! | `GET /capabilities`  | static capability descriptor   |
//! | `POST /task`         | submit one transcoding task    |
//! | `GET /download`      | fetch a finished output file   |

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ClusterConfig;
use crate::discovery::broadcast_task_complete;
use crate::worker::WorkerError;
use crate::worker::capabilities::Capabilities;
use crate::worker::slot::ExecutionSlot;
use crate::worker::transcode;

pub(crate) struct WorkerContext {
    pub config: ClusterConfig,
    pub slot: Arc<ExecutionSlot>,
    pub capabilities: Capabilities,
    pub discovery_enabled: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TaskRequest {
    #[serde(default)]
    task_id: String,
    video_file: VideoFilePayload,
    ffmpeg_args: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct VideoFilePayload {
    name: String,
    /// Base64 of the entire input file. The wire format is fixed for
    /// compatibility; the decode below streams to disk instead of holding a
    /// second copy in memory.
    data: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct TaskResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl TaskResponse {
    fn success(output_file: String) -> Self {
        Self {
            status: "success",
            output_file: Some(output_file),
            error: None,
        }
    }

    fn fail(error: String) -> Self {
        Self {
            status: "fail",
            output_file: None,
            error: Some(error),
        }
    }

    fn error(error: String) -> Self {
        Self {
            status: "error",
            output_file: None,
            error: Some(error),
        }
    }
}

pub(crate) fn router(ctx: Arc<WorkerContext>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/status", get(status))
        .route("/capabilities", get(capabilities))
        .route("/task", post(submit_task))
        .route("/download", get(download))
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn ping() -> &'static str {
    "pong"
}

async fn status(State(ctx): State<Arc<WorkerContext>>) -> Response {
    Json(ctx.slot.read_status()).into_response()
}

async fn capabilities(State(ctx): State<Arc<WorkerContext>>) -> Response {
    Json(ctx.capabilities.clone()).into_response()
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    file: String,
}

async fn download(
    State(ctx): State<Arc<WorkerContext>>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let Some(name) = sanitize_file_name(&query.file) else {
        return (StatusCode::BAD_REQUEST, "invalid file name").into_response();
    };
    let path = ctx.config.work_dir.join(&name);
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{name}\""),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "File not found").into_response(),
    }
}

async fn submit_task(State(ctx): State<Arc<WorkerContext>>, body: Bytes) -> Response {
    let request: TaskRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(&WorkerError::BadRequest(format!(
                "invalid task payload: {err}"
            )));
        }
    };

    let Some(name) = sanitize_file_name(&request.video_file.name) else {
        return error_response(&WorkerError::BadRequest("invalid video file name".to_string()));
    };

    // The slot is the single-task gate: claim it before any disk work so a
    // concurrent submission is refused immediately.
    if ctx.slot.try_begin_receiving(&name).is_err() {
        return error_response(&WorkerError::Busy);
    }

    info!(
        task_id = %request.task_id,
        file = %name,
        bytes = request.video_file.data.len(),
        "task accepted"
    );

    let ctx_for_task = ctx.clone();
    let outcome =
        tokio::task::spawn_blocking(move || run_task(&ctx_for_task, &request, &name)).await;

    match outcome {
        Ok(Ok(output_file)) => {
            (StatusCode::OK, Json(TaskResponse::success(output_file))).into_response()
        }
        Ok(Err(err)) => error_response(&err),
        Err(err) => {
            warn!(%err, "task execution panicked");
            ctx.slot.mark_error("internal task failure");
            error_response(&WorkerError::Probe("internal task failure".to_string()))
        }
    }
}

/// Blocking task body: stage the input, transcode, settle the slot. On
/// success returns the worker-local output path.
fn run_task(ctx: &WorkerContext, request: &TaskRequest, name: &str) -> Result<String, WorkerError> {
    let input_path = ctx.config.work_dir.join(name);
    let output_path = ctx.config.work_dir.join(format!("output_{name}"));

    // Stream the base64 body straight to disk.
    let decode_result = (|| -> std::io::Result<u64> {
        let mut reader =
            base64::read::DecoderReader::new(Cursor::new(request.video_file.data.as_bytes()), &BASE64);
        let mut file = std::fs::File::create(&input_path)?;
        std::io::copy(&mut reader, &mut file)
    })();

    let staged_bytes = match decode_result {
        Ok(bytes) => bytes,
        Err(err) => {
            ctx.slot.mark_error(format!("input decode failed: {err}"));
            return Err(WorkerError::BadRequest(format!("input decode failed: {err}")));
        }
    };
    info!(file = %name, staged_bytes, "input staged");

    ctx.slot.mark_processing();

    let duration = transcode::probe_duration_seconds(&ctx.config.ffprobe_path, &input_path)
        .map_err(|err| {
            warn!(%err, "duration probe failed; progress disabled for this task");
            err
        })
        .ok()
        .filter(|d| *d > 0.0);

    match transcode::run_ffmpeg(
        &ctx.config.ffmpeg_path,
        &input_path,
        &output_path,
        &request.ffmpeg_args,
        duration,
        &ctx.slot,
    ) {
        Ok(()) => {
            ctx.slot.mark_completed();
            if ctx.discovery_enabled {
                broadcast_task_complete(ctx.config.discovery_port, &request.task_id);
            }
            Ok(output_path.to_string_lossy().into_owned())
        }
        Err(err) => {
            let err = WorkerError::from(err);
            match &err {
                WorkerError::Stopped => ctx.slot.mark_stopped(),
                other => ctx.slot.mark_error(other.to_string()),
            }
            Err(err)
        }
    }
}

/// Lower a worker failure onto the wire. An ffmpeg exit code is a valid
/// task outcome (`status: fail` at 200); the rest are HTTP-level refusals.
fn error_response(err: &WorkerError) -> Response {
    let (code, body) = match err {
        WorkerError::Ffmpeg { .. } => (StatusCode::OK, TaskResponse::fail(err.to_string())),
        WorkerError::Busy => (StatusCode::CONFLICT, TaskResponse::error(err.to_string())),
        WorkerError::BadRequest(_) => {
            (StatusCode::BAD_REQUEST, TaskResponse::error(err.to_string()))
        }
        WorkerError::Stopped => (
            StatusCode::SERVICE_UNAVAILABLE,
            TaskResponse::error(err.to_string()),
        ),
        WorkerError::Probe(_) | WorkerError::Config(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            TaskResponse::error(err.to_string()),
        ),
    };
    (code, Json(body)).into_response()
}

/// Restrict client-supplied names to a bare file name inside the work dir.
fn sanitize_file_name(raw: &str) -> Option<String> {
    let name = Path::new(raw).file_name()?.to_str()?;
    if name.is_empty() || name == ".." {
        return None;
    }
    Some(name.to_string())
}
