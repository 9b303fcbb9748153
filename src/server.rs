//! REST API for batch jobs, the review queue, and item lookup.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::warn;
use uuid::Uuid;

use crate::batch::{BatchOrchestrator, ChunkResult};
use crate::error::{DatabaseError, Error, JobError};
use crate::review::{ReviewDecision, ReviewQueue};
use crate::store::Database;

/// Shared state for all API routes.
#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<dyn Database>,
    pub orchestrator: Arc<BatchOrchestrator>,
    pub reviews: Arc<ReviewQueue>,
}

/// API error wrapper mapping domain errors onto HTTP statuses.
struct ApiError(Error);

impl<E: Into<Error>> From<E> for ApiError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Job(JobError::NotFound { .. })
            | Error::Database(DatabaseError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Error::Job(JobError::AlreadyActive { .. } | JobError::InvalidState { .. }) => {
                StatusCode::CONFLICT
            }
            Error::Job(JobError::InvalidRange(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %self.0, "Request failed");
        }
        (
            status,
            Json(serde_json::json!({"error": self.0.to_string()})),
        )
            .into_response()
    }
}

#[derive(Deserialize)]
struct SubmitRequest {
    start_date: NaiveDate,
    end_date: NaiveDate,
}

/// POST /process-all
///
/// Start a batch job over an inclusive-start, exclusive-end date range.
async fn submit_job(
    State(state): State<ApiState>,
    Json(req): Json<SubmitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .orchestrator
        .submit(req.start_date, req.end_date)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

#[derive(Deserialize)]
struct WorkerRequest {
    job_id: String,
    #[allow(dead_code)]
    task_id: Option<String>,
}

/// POST /batch-worker
///
/// Worker entrypoint: process the next chunk of a job. Dispatched
/// invocations land here; it is safe to call repeatedly.
async fn batch_worker(
    State(state): State<ApiState>,
    Json(req): Json<WorkerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state.orchestrator.advance(&req.job_id).await?;
    let body = match result {
        ChunkResult::Completed => serde_json::json!({"status": "completed"}),
        ChunkResult::ChunkCompleted { range, outcome } => serde_json::json!({
            "status": "chunk_completed",
            "chunk": format!("{} to {}", range.0, range.1),
            "processed": outcome.processed,
            "errors": outcome.errors,
        }),
        ChunkResult::Skipped { reason } => serde_json::json!({"status": "skipped", "reason": reason}),
        ChunkResult::LockBusy => serde_json::json!({"status": "lock_busy"}),
    };
    Ok(Json(body))
}

/// GET /process-status/{job_id}
async fn job_status(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.status(&job_id).await?))
}

/// POST /process-pause/{job_id}
async fn pause_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.pause(&job_id).await?))
}

/// POST /process-continue/{job_id}
async fn continue_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.resume(&job_id).await?))
}

/// GET /reviews
async fn list_reviews(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.reviews.open().await?))
}

/// POST /reviews/{id}/approve
async fn approve_review(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.reviews.resolve(id, ReviewDecision::Approve).await?))
}

#[derive(Deserialize)]
struct CorrectRequest {
    category: String,
}

/// POST /reviews/{id}/correct
async fn correct_review(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CorrectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let decision = ReviewDecision::Correct {
        category: req.category,
    };
    Ok(Json(state.reviews.resolve(id, decision).await?))
}

/// POST /reviews/{id}/deny
async fn deny_review(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.reviews.resolve(id, ReviewDecision::Deny).await?))
}

/// GET /items/{external_id}
async fn get_item(
    State(state): State<ApiState>,
    Path(external_id): Path<String>,
) -> Result<Response, ApiError> {
    match state.db.get_item(&external_id).await? {
        Some(item) => Ok(Json(item).into_response()),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "item not found"})),
        )
            .into_response()),
    }
}

/// GET /healthz
async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// Build the API router.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/process-all", post(submit_job))
        .route("/batch-worker", post(batch_worker))
        .route("/process-status/{job_id}", get(job_status))
        .route("/process-pause/{job_id}", post(pause_job))
        .route("/process-continue/{job_id}", post(continue_job))
        .route("/reviews", get(list_reviews))
        .route("/reviews/{id}/approve", post(approve_review))
        .route("/reviews/{id}/correct", post(correct_review))
        .route("/reviews/{id}/deny", post(deny_review))
        .route("/items/{external_id}", get(get_item))
        .route("/healthz", get(healthz))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
