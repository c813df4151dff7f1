//! Liveness endpoint.

use std::sync::Arc;

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::kernel::OrchestratorDeps;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

/// `GET /health`: healthy when the job store answers.
pub async fn health(
    Extension(deps): Extension<Arc<OrchestratorDeps>>,
) -> (StatusCode, Json<HealthResponse>) {
    let healthy = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        deps.store.snapshot_counts(),
    )
    .await
    .map(|r| r.is_ok())
    .unwrap_or(false);

    let (status_code, status) = if healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };

    (
        status_code,
        Json(HealthResponse {
            status: status.to_string(),
            timestamp: Utc::now(),
        }),
    )
}
