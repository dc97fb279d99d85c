//! HTTP surface: a thin axum layer over the gateway and query service.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::{GatewayError, QueryError, QueueError, StorageError};
use crate::events::EventLog;
use crate::gateway::TaskGateway;
use crate::models::{AnalysisMetrics, Task, TaskStatus};
use crate::query::{
    Comparison, QueryService, SimilarityReport, DEFAULT_PAGE_SIZE, DEFAULT_TOP_K,
};
use crate::queue::{JobHandle, JobQueue, JobStatus};
use crate::storage::LocalStorage;

#[derive(Clone)]
pub struct AppState {
    pub gateway: TaskGateway,
    pub query: QueryService,
    pub storage: LocalStorage,
    pub queue: Arc<dyn JobQueue>,
    pub events: EventLog,
    pub max_upload_size: u64,
}

pub fn router(state: AppState) -> Router {
    // Leave headroom for the multipart framing around the file itself
    let body_limit = usize::try_from(state.max_upload_size)
        .unwrap_or(usize::MAX)
        .saturating_add(64 * 1024);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/upload", post(upload_file))
        .route("/api/v1/tasks", get(list_tasks))
        .route("/api/v1/tasks/:id", get(get_task))
        .route("/api/v1/similarity/search/:id", get(search_similar))
        .route("/api/v1/similarity/compare", post(compare_documents))
        .route("/api/v1/jobs/:handle", get(get_job_status))
        .route("/api/events", get(sse_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

// === Errors ===

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::PayloadTooLarge(m) => (StatusCode::PAYLOAD_TOO_LARGE, m),
            ApiError::Internal(m) => {
                tracing::error!(message = %m, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        match e {
            // Do not reveal whether another owner's task exists
            QueryError::NotFound(_) | QueryError::Forbidden(_) => {
                ApiError::NotFound("Task not found or access denied".to_string())
            }
            QueryError::MissingEmbedding(m) => ApiError::BadRequest(m),
            QueryError::Similarity(e) => ApiError::Internal(e.to_string()),
            QueryError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::InvalidInput(m) => ApiError::BadRequest(m),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

fn require_user(user_id: &str) -> Result<&str, ApiError> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(ApiError::BadRequest("user_id is required".to_string()));
    }
    Ok(user_id)
}

// === Response types ===

#[derive(Debug, Serialize)]
pub struct TaskResultView {
    #[serde(flatten)]
    pub metrics: AnalysisMetrics,
    pub has_embedding: bool,
    pub content_preview: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub task_id: String,
    pub filename: String,
    pub file_size: u64,
    pub status: TaskStatus,
    pub job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResultView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        let result = task.result().map(|r| TaskResultView {
            metrics: r.metrics.clone(),
            has_embedding: r.embedding.is_some(),
            content_preview: r.content_preview.clone(),
        });
        let error = task.error().map(str::to_string);
        TaskResponse {
            status: task.status(),
            task_id: task.id,
            filename: task.filename,
            file_size: task.file_size,
            job_id: task.job_id,
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            result,
            error,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub filename: String,
    pub file_size: u64,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskSummary>,
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub message: String,
    pub filename: String,
    pub file_size: u64,
}

// === Handlers ===

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "UP",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    let mut user_id: Option<String> = None;
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        tracing::error!("Failed to read multipart field: {}", e);
        ApiError::BadRequest("malformed multipart body".to_string())
    })? {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "user_id" => {
                let value = field
                    .text()
                    .await
                    .map_err(|_| ApiError::BadRequest("invalid user_id field".to_string()))?;
                user_id = Some(value);
            }
            "file" => {
                let file_name = field.file_name().unwrap_or("").to_string();
                let data = field.bytes().await.map_err(|e| {
                    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
                        ApiError::PayloadTooLarge(format!(
                            "File too large. Maximum size: {} bytes",
                            state.max_upload_size
                        ))
                    } else {
                        tracing::error!("Failed to read file bytes: {}", e);
                        ApiError::BadRequest("failed to read uploaded file".to_string())
                    }
                })?;
                upload = Some((file_name, data.to_vec()));
            }
            _ => {}
        }
    }

    let user_id = user_id.ok_or_else(|| ApiError::BadRequest("user_id is required".to_string()))?;
    let user_id = require_user(&user_id)?;
    let (filename, data) = upload.ok_or_else(|| ApiError::BadRequest("file is required".to_string()))?;

    if filename.trim().is_empty() {
        return Err(ApiError::BadRequest("No filename provided".to_string()));
    }
    let file_size = data.len() as u64;
    if file_size > state.max_upload_size {
        return Err(ApiError::PayloadTooLarge(format!(
            "File too large. Maximum size: {} bytes",
            state.max_upload_size
        )));
    }
    if file_size == 0 {
        return Err(ApiError::BadRequest("Empty file".to_string()));
    }

    let input_ref = state.storage.store(&filename, &data).await?;
    let task_id = state
        .gateway
        .submit(user_id, &filename, file_size, &input_ref)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            task_id,
            status: TaskStatus::Queued,
            message: "File uploaded and queued for processing".to_string(),
            filename,
            file_size,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    pub user_id: String,
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<TaskResponse>, ApiError> {
    let user_id = require_user(&query.user_id)?;
    let task = state.query.get_task(&id, user_id)?;
    Ok(Json(task.into()))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub user_id: String,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<TaskListResponse>, ApiError> {
    let user_id = require_user(&query.user_id)?;
    let page = state.query.list_tasks(
        user_id,
        query.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        query.offset.unwrap_or(0),
    )?;

    let tasks = page
        .tasks
        .into_iter()
        .map(|task| TaskSummary {
            status: task.status(),
            task_id: task.id,
            filename: task.filename,
            file_size: task.file_size,
            created_at: task.created_at,
            completed_at: task.completed_at,
        })
        .collect();

    Ok(Json(TaskListResponse {
        tasks,
        total: page.total,
        limit: page.limit,
        offset: page.offset,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SimilarQuery {
    pub user_id: String,
    pub top_k: Option<usize>,
}

async fn search_similar(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<SimilarQuery>,
) -> Result<Json<SimilarityReport>, ApiError> {
    let user_id = require_user(&query.user_id)?;
    let report = state
        .query
        .find_similar(&id, user_id, query.top_k.unwrap_or(DEFAULT_TOP_K))?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct CompareQuery {
    pub task_id_1: String,
    pub task_id_2: String,
    pub user_id: String,
}

async fn compare_documents(
    State(state): State<AppState>,
    Query(query): Query<CompareQuery>,
) -> Result<Json<Comparison>, ApiError> {
    let user_id = require_user(&query.user_id)?;
    let comparison = state
        .query
        .compare(&query.task_id_1, &query.task_id_2, user_id)?;
    Ok(Json(comparison))
}

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: JobStatus,
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let handle = JobHandle::new(handle);
    let status = state.queue.status(&handle).await?;
    Ok(Json(JobStatusResponse {
        job_id: handle.to_string(),
        status,
    }))
}

async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::info!("New SSE connection established");
    let rx = state.events.subscribe();

    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).map(|msg| match msg {
        Ok(record) => {
            let data = serde_json::to_string(&record).unwrap_or_default();
            Ok(Event::default().event(record.category.clone()).data(data))
        }
        Err(_lag) => {
            tracing::warn!("SSE stream lagged");
            Ok(Event::default().comment("lagged"))
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_and_missing_tasks_look_the_same() {
        let forbidden = ApiError::from(QueryError::Forbidden("t1".into())).into_response();
        let missing = ApiError::from(QueryError::NotFound("t1".into())).into_response();
        assert_eq!(forbidden.status(), StatusCode::NOT_FOUND);
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn error_statuses() {
        let precondition =
            ApiError::from(QueryError::MissingEmbedding("not processed".into())).into_response();
        assert_eq!(precondition.status(), StatusCode::BAD_REQUEST);

        let invalid = ApiError::from(GatewayError::InvalidInput("no file".into())).into_response();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let internal = ApiError::from(QueueError::Poisoned).into_response();
        assert_eq!(internal.status(), StatusCode::INTERNAL_SERVER_ERROR);

        assert!(require_user("  ").is_err());
        assert_eq!(require_user(" alice ").unwrap(), "alice");
    }
}
