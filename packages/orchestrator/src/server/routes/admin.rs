//! Operational endpoints: on-demand passes and scheduler control.

use std::sync::Arc;

use axum::extract::Extension;
use axum::Json;
use serde::Serialize;
use serde_json::json;

use crate::kernel::scheduler::{TaskStatus, QUEUE_POLL, STALE_RECOVERY};
use crate::kernel::OrchestratorDeps;
use crate::server::error::ApiError;

/// `POST /process`: run a dispatch pass now.
pub async fn process_now(
    Extension(deps): Extension<Arc<OrchestratorDeps>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    deps.scheduler.trigger(QUEUE_POLL).await?;
    Ok(Json(json!({ "triggered": QUEUE_POLL })))
}

/// `POST /recover`: run stale-job recovery now.
pub async fn recover_now(
    Extension(deps): Extension<Arc<OrchestratorDeps>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    deps.scheduler.trigger(STALE_RECOVERY).await?;
    Ok(Json(json!({ "triggered": STALE_RECOVERY })))
}

/// `POST /scheduler/reset`: reinitialize every scheduler task loop.
pub async fn scheduler_reset(
    Extension(deps): Extension<Arc<OrchestratorDeps>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    deps.scheduler.reset().await?;
    Ok(Json(json!({ "reset": true })))
}

#[derive(Debug, Serialize)]
pub struct SchedulerStatusResponse {
    pub running: bool,
    pub tasks: Vec<TaskStatus>,
}

/// `GET /scheduler`: task list with next-run times.
pub async fn scheduler_status(
    Extension(deps): Extension<Arc<OrchestratorDeps>>,
) -> Json<SchedulerStatusResponse> {
    Json(SchedulerStatusResponse {
        running: deps.scheduler.is_running().await,
        tasks: deps.scheduler.statuses().await,
    })
}
