//! Read-only metrics endpoint.

use std::sync::Arc;

use axum::extract::Extension;
use axum::Json;
use serde::Serialize;

use crate::kernel::metrics::{MetricsAverages, MetricsSample};
use crate::kernel::registry::WorkerView;
use crate::kernel::OrchestratorDeps;
use crate::server::error::ApiError;

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub current: Option<MetricsSample>,
    pub averages: MetricsAverages,
    pub history: Vec<MetricsSample>,
    pub workers: Vec<WorkerView>,
}

/// `GET /metrics`: current counts, ring-buffer history, and worker state.
pub async fn metrics(
    Extension(deps): Extension<Arc<OrchestratorDeps>>,
) -> Result<Json<MetricsResponse>, ApiError> {
    Ok(Json(MetricsResponse {
        current: deps.metrics.current().await,
        averages: deps.metrics.averages().await,
        history: deps.metrics.history().await,
        workers: deps.registry.views().await,
    }))
}
