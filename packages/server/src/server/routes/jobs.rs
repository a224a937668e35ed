//! Research job control endpoints.
//!
//! Thin adapters over `JobOrchestrator`; every failure becomes a JSON body
//! `{error, code, safe_to_retry}` with a status matching the `JobError`.

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::common::{JobId, SubjectId};
use crate::domains::research::{
    JobError, PauseOutcome, ProgressReport, ResearchJob, ResumeOutcome,
};
use crate::server::app::AppState;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug)]
pub struct ApiError(JobError);

impl From<JobError> for ApiError {
    fn from(error: JobError) -> Self {
        Self(error)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    pub safe_to_retry: bool,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            JobError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            JobError::InvalidState { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_state"),
            JobError::UnexpectedPhase { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "unexpected_phase")
            }
            JobError::LockHeld(_) => (StatusCode::CONFLICT, "lock_held"),
            JobError::LockUnavailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "lock_unavailable")
            }
            JobError::CorruptCheckpoint { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "corrupt_checkpoint")
            }
            JobError::NoExecutor(_) => (StatusCode::INTERNAL_SERVER_ERROR, "no_executor"),
            JobError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self.0, code, "job request failed");
        } else {
            tracing::debug!(error = %self.0, code, "job request rejected");
        }

        let body = ErrorBody {
            error: self.0.to_string(),
            code: code.to_string(),
            safe_to_retry: self.0.safe_to_retry(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// =============================================================================
// Handlers
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub reference_id: SubjectId,
    /// Defaults to the configured budget.
    pub time_budget_secs: Option<i64>,
}

/// Create a job and start it right away.
pub async fn create_job_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<ResearchJob>), ApiError> {
    let budget = request
        .time_budget_secs
        .filter(|secs| *secs > 0)
        .map(Duration::seconds);
    let job = state
        .orchestrator
        .create_job(request.reference_id, budget)
        .await?;
    let job = state.orchestrator.start(job.id).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn get_job_handler(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<JobId>,
) -> ApiResult<ResearchJob> {
    Ok(Json(state.orchestrator.get_job(job_id).await?))
}

pub async fn start_job_handler(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<JobId>,
) -> ApiResult<ResearchJob> {
    Ok(Json(state.orchestrator.start(job_id).await?))
}

pub async fn pause_job_handler(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<JobId>,
) -> ApiResult<PauseOutcome> {
    Ok(Json(state.orchestrator.pause(job_id).await?))
}

pub async fn resume_job_handler(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<JobId>,
) -> ApiResult<ResumeOutcome> {
    Ok(Json(state.orchestrator.resume(job_id).await?))
}

/// Start a fresh run for the same subject as a finished job.
pub async fn rescan_job_handler(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<JobId>,
) -> Result<(StatusCode, Json<ResearchJob>), ApiError> {
    let job = state.orchestrator.rescan(job_id).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn job_progress_handler(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<JobId>,
) -> ApiResult<ProgressReport> {
    Ok(Json(state.orchestrator.get_progress(job_id).await?))
}
