//! Thin HTTP surface: uploads, render requests, queue inspection and static
//! files.

use std::path::{Path as FsPath, PathBuf};

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::{QueueError, ValidationError};
use crate::queue::QueueHandle;
use crate::{JobId, JobRequest, RenderJob, Status, VideoType};

const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub queue: QueueHandle,
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Queue(#[from] QueueError),

    #[error("Failed to render video")]
    Render(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Queue(_) => StatusCode::CONFLICT,
            ApiError::Render(_) | ApiError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        let details = match &self {
            ApiError::Render(details) => Some(details.clone()),
            _ => None,
        };
        let body = ErrorBody {
            error: self.to_string(),
            details,
        };
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

pub fn create_router(state: AppState) -> Router {
    let uploads = ServeDir::new(&state.upload_dir);
    let renders = ServeDir::new(&state.output_dir);

    Router::new()
        .route("/health", get(health))
        .route("/upload/:kind", post(upload))
        .route("/render", post(render))
        .route("/jobs", get(list_jobs).post(submit_jobs).delete(clear_jobs))
        .route("/jobs/cancel", post(cancel_job))
        .route("/jobs/:id", get(get_job).delete(remove_job))
        .nest_service("/uploads", uploads)
        .nest_service("/renders", renders)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub url: String,
    pub filename: String,
}

fn valid_kind(kind: &str) -> bool {
    !kind.is_empty()
        && kind
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn extension_of(file_name: Option<&str>) -> String {
    file_name
        .and_then(|name| FsPath::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| "bin".to_string())
}

async fn upload(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadResponse>> {
    if !valid_kind(&kind) {
        return Err(ApiError::BadRequest(format!("Invalid upload type: {}", kind)));
    }

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let extension = extension_of(field.file_name());
        let bytes = field
            .bytes()
            .await
            .map_err(|err| ApiError::BadRequest(err.body_text()))?;

        let dir = state.upload_dir.join(&kind);
        tokio::fs::create_dir_all(&dir).await?;
        let filename = format!("{}.{}", Utc::now().timestamp_millis(), extension);
        tokio::fs::write(dir.join(&filename), &bytes).await?;

        info!(kind = %kind, filename = %filename, size = bytes.len(), "Stored upload");
        return Ok(Json(UploadResponse {
            url: format!("/uploads/{}/{}", kind, filename),
            filename,
        }));
    }

    Err(ApiError::BadRequest("No file uploaded".to_string()))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderResponse {
    pub video_url: String,
}

fn public_url(output: &str) -> String {
    let name = FsPath::new(output)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("/renders/{}", name)
}

/// Queues a single-version job and answers once it has been rendered.
async fn render(
    State(state): State<AppState>,
    payload: Result<Json<JobRequest>, JsonRejection>,
) -> ApiResult<Json<RenderResponse>> {
    let Json(mut request) = payload?;
    request.single_version = true;
    let video_type = request.metadata.video_type;
    let id = state.queue.add(request)?;

    let job = state
        .queue
        .wait_until_settled(id)
        .await
        .ok_or_else(|| ApiError::Render("Job was removed before it finished".to_string()))?;

    match (job.status, job.result.get(&video_type)) {
        (Status::Complete, Some(output)) => Ok(Json(RenderResponse {
            video_url: public_url(output),
        })),
        _ => Err(ApiError::Render(
            job.error.unwrap_or_else(|| "Render produced no output".to_string()),
        )),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    #[serde(flatten)]
    pub job: JobRequest,
    /// With `singleVersion`, one job is queued per listed type.
    #[serde(default)]
    pub video_types: Vec<VideoType>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub ids: Vec<JobId>,
}

async fn submit_jobs(
    State(state): State<AppState>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let Json(submit) = payload?;
    let ids = if submit.job.single_version && !submit.video_types.is_empty() {
        state.queue.submit_variants(submit.job, &submit.video_types)?
    } else {
        vec![state.queue.add(submit.job)?]
    };
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { ids })))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueView {
    pub processing: Option<JobId>,
    pub jobs: Vec<RenderJob>,
}

async fn list_jobs(State(state): State<AppState>) -> Json<QueueView> {
    Json(QueueView {
        processing: state.queue.processing_id(),
        jobs: state.queue.snapshot(),
    })
}

async fn get_job(State(state): State<AppState>, Path(id): Path<JobId>) -> ApiResult<Json<RenderJob>> {
    state
        .queue
        .get(id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("job {}", id)))
}

async fn remove_job(State(state): State<AppState>, Path(id): Path<JobId>) -> ApiResult<StatusCode> {
    state.queue.remove(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_jobs(State(state): State<AppState>) -> Json<serde_json::Value> {
    let removed = state.queue.clear();
    Json(serde_json::json!({ "removed": removed }))
}

async fn cancel_job(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cancelled = state.queue.cancel();
    Json(serde_json::json!({ "cancelled": cancelled }))
}
