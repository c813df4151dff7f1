//! Status poller: drives running jobs to completion by asking their workers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use fno_protocol::wire::ExecutionStatus;

use crate::kernel::outcome::{Applied, OutcomeApplier};
use crate::kernel::registry::WorkerRegistry;
use crate::kernel::store::JobStore;
use crate::kernel::worker_client::WorkerApi;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PollSummary {
    pub polled: usize,
    pub completed: usize,
    pub failed: usize,
    pub errors: usize,
}

pub struct StatusPoller {
    store: Arc<dyn JobStore>,
    registry: Arc<WorkerRegistry>,
    worker_api: Arc<dyn WorkerApi>,
    applier: Arc<OutcomeApplier>,
    lost_threshold: Duration,
}

impl StatusPoller {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<WorkerRegistry>,
        worker_api: Arc<dyn WorkerApi>,
        applier: Arc<OutcomeApplier>,
        lost_threshold: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            worker_api,
            applier,
            lost_threshold,
        }
    }

    /// Poll every running job's worker once.
    pub async fn run_pass(&self) -> Result<PollSummary> {
        let mut summary = PollSummary::default();

        for job in self.store.list_running().await? {
            let Some(worker) = job.assigned_worker.clone() else {
                // Running without a worker violates the state invariant;
                // stale recovery will pick it up.
                warn!(job_id = job.id, "running job has no assigned worker");
                continue;
            };
            summary.polled += 1;

            match self.worker_api.job_status(&worker, job.id).await {
                Ok(status) => {
                    self.registry.record_poll_result(&worker, true).await;

                    if status.status == ExecutionStatus::NotFound {
                        // Suspected lost. The stale-recovery task owns the
                        // transition once the job crosses the threshold.
                        let age = job
                            .started_at
                            .map(|at| Utc::now() - at)
                            .unwrap_or_else(chrono::Duration::zero);
                        if age.to_std().unwrap_or_default() > self.lost_threshold {
                            warn!(
                                job_id = job.id,
                                worker = %worker,
                                "running job unknown to its worker past the lost threshold"
                            );
                        }
                        continue;
                    }

                    match self.applier.apply_status(&job, &status, Utc::now()).await? {
                        Applied::Completed => summary.completed += 1,
                        Applied::FailedRequeued | Applied::FailedDead => summary.failed += 1,
                        Applied::Nothing => {}
                    }
                }
                Err(e) => {
                    // A single transport error never mutates job state.
                    debug!(job_id = job.id, worker = %worker, error = %e, "status poll failed");
                    self.registry.record_poll_result(&worker, false).await;
                    summary.errors += 1;
                }
            }
        }

        Ok(summary)
    }
}
