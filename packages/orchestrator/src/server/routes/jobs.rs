//! Job submission and inspection endpoints.

use std::sync::Arc;

use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fno_protocol::job::{Action, ErrorKind, JobParameters, JobResultRecord, Provider};

use crate::kernel::evidence::EvidenceView;
use crate::kernel::store::{CallbackStatus, Job, JobStatus, NewJob};
use crate::kernel::OrchestratorDeps;
use crate::server::error::ApiError;
use crate::server::middleware::AuthUser;

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub provider: Provider,
    pub action: Action,
    pub external_id: String,
    pub parameters: JobParameters,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub max_retries: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub id: i64,
    pub status: JobStatus,
    pub created: bool,
}

#[derive(Debug, Serialize)]
pub struct JobErrorView {
    pub kind: ErrorKind,
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CallbackView {
    pub status: CallbackStatus,
    pub attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: i64,
    pub external_id: String,
    pub provider: Provider,
    pub action: Action,
    pub status: JobStatus,
    pub submitted_by: String,
    pub priority: i32,
    pub parameters: JobParameters,
    pub assigned_worker: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResultRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobErrorView>,
    pub callback: CallbackView,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        let error = job.error_kind.map(|kind| JobErrorView {
            kind,
            message: job.error_message.clone(),
        });
        Self {
            id: job.id,
            external_id: job.external_id,
            provider: job.provider,
            action: job.action,
            status: job.status,
            submitted_by: job.submitted_by,
            priority: job.priority,
            parameters: job.parameters.0,
            assigned_worker: job.assigned_worker,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            next_run_at: job.next_run_at,
            result: job.result.map(|r| r.0),
            error,
            callback: CallbackView {
                status: job.callback_status,
                attempts: job.callback_attempts,
                last_attempt_at: job.callback_last_attempt_at,
            },
            created_at: job.created_at,
            updated_at: job.updated_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

/// `POST /jobs`: create a job, idempotent on `(provider, external_id)`.
/// The authenticated caller is recorded as the job's owner.
pub async fn create_job(
    Extension(deps): Extension<Arc<OrchestratorDeps>>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<CreateJobResponse>), ApiError> {
    if request.external_id.trim().is_empty() {
        return Err(ApiError::BadRequest("external_id must not be empty".into()));
    }
    if request.parameters.circuit_number.trim().is_empty() {
        return Err(ApiError::BadRequest("circuit_number must not be empty".into()));
    }
    if let Some(max_retries) = request.max_retries {
        if max_retries < 0 {
            return Err(ApiError::BadRequest("max_retries must not be negative".into()));
        }
    }

    let new = NewJob::builder()
        .external_id(request.external_id)
        .provider(request.provider)
        .action(request.action)
        .parameters(request.parameters)
        .submitted_by(user.username)
        .priority(request.priority.unwrap_or(0))
        .max_retries(request.max_retries.unwrap_or(3))
        .build();

    let outcome = deps.store.create_job(new).await?;
    let created = outcome.is_created();
    let job = outcome.job();
    let status_code = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status_code,
        Json(CreateJobResponse {
            id: job.id,
            status: job.status,
            created,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<JobStatus>,
    pub limit: Option<i64>,
}

/// `GET /jobs`: recent jobs with an optional status filter.
pub async fn list_jobs(
    Extension(deps): Extension<Arc<OrchestratorDeps>>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobView>>, ApiError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let jobs = deps.store.list_jobs(query.status, limit).await?;
    Ok(Json(jobs.into_iter().map(JobView::from).collect()))
}

/// `GET /jobs/{id}`: full job detail.
pub async fn get_job(
    Extension(deps): Extension<Arc<OrchestratorDeps>>,
    Path(id): Path<i64>,
) -> Result<Json<JobView>, ApiError> {
    let job = deps
        .store
        .get_job(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {id} not found")))?;
    Ok(Json(JobView::from(job)))
}

/// Cancellation grant: the submitter owns the job; admins may cancel any.
fn may_cancel(user: &AuthUser, job: &Job) -> bool {
    user.is_admin || job.submitted_by == user.username
}

/// `DELETE /jobs/{id}`: operator cancel. The job becomes
/// `dead/cancelled_by_operator`; a worker-side run that finishes later is
/// discarded.
pub async fn cancel_job(
    Extension(deps): Extension<Arc<OrchestratorDeps>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> Result<Json<JobView>, ApiError> {
    let job = deps
        .store
        .get_job(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {id} not found")))?;
    if !may_cancel(&user, &job) {
        return Err(ApiError::Forbidden(
            "caller must own the job or have admin scope".into(),
        ));
    }
    if job.status.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "job {id} is already terminal ({})",
            job.status.as_str()
        )));
    }

    if !deps.store.cancel_job(id, Utc::now()).await? {
        return Err(ApiError::Conflict(format!(
            "job {id} reached a terminal state concurrently"
        )));
    }

    let job = deps
        .store
        .get_job(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {id} not found")))?;
    Ok(Json(JobView::from(job)))
}

#[derive(Debug, Serialize)]
pub struct ScreenshotsResponse {
    pub job_id: i64,
    pub screenshots: Vec<EvidenceView>,
}

/// `GET /jobs/{id}/screenshots`: stored evidence, base64 at the boundary.
pub async fn job_screenshots(
    Extension(deps): Extension<Arc<OrchestratorDeps>>,
    Path(id): Path<i64>,
) -> Result<Json<ScreenshotsResponse>, ApiError> {
    if deps.store.get_job(id).await?.is_none() {
        return Err(ApiError::NotFound(format!("job {id} not found")));
    }
    let screenshots = deps.evidence.list_encoded(id).await?;
    Ok(Json(ScreenshotsResponse {
        job_id: id,
        screenshots,
    }))
}
