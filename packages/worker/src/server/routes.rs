//! Worker HTTP handlers.

use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use fno_protocol::wire::{ExecuteAccepted, ExecuteRequest, ExecutionStatus};

use crate::runtime::{AcceptError, ExecutionRuntime};

/// `POST /execute`: accept (`202`) or refuse (`503` + `Retry-After`).
pub async fn execute(
    Extension(runtime): Extension<Arc<ExecutionRuntime>>,
    Json(request): Json<ExecuteRequest>,
) -> Response {
    let job_id = request.job_id;
    match runtime.try_accept(request) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(ExecuteAccepted {
                job_id,
                status: ExecutionStatus::Running,
            }),
        )
            .into_response(),
        Err(AcceptError::AtCapacity) => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, "30")],
            Json(serde_json::json!({ "error": "worker at capacity" })),
        )
            .into_response(),
    }
}

/// `GET /status/{job_id}`: status-map entry or `404 not_found`.
pub async fn job_status(
    Extension(runtime): Extension<Arc<ExecutionRuntime>>,
    Path(job_id): Path<i64>,
) -> Response {
    let status = runtime.status(job_id);
    let code = match status.status {
        ExecutionStatus::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::OK,
    };
    (code, Json(status)).into_response()
}

/// `GET /status`: capabilities and load.
pub async fn capabilities(
    Extension(runtime): Extension<Arc<ExecutionRuntime>>,
) -> impl IntoResponse {
    Json(runtime.capabilities())
}

/// `GET /health`: liveness plus load.
pub async fn health(Extension(runtime): Extension<Arc<ExecutionRuntime>>) -> impl IntoResponse {
    Json(runtime.health())
}
