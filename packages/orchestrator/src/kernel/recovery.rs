//! Stale-job recovery and the failed-job sweep.
//!
//! A worker process that dies leaves its jobs in `running` forever from the
//! orchestrator's view. The recovery pass gives each such job one last
//! status probe; anything still unresolved is failed with `lost_heartbeat`
//! and handed to the retry policy. The failed sweep is a safety net that
//! resolves any job stuck in the transient `failed` state before the next
//! dispatch pass.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use fno_protocol::wire::ExecutionStatus;

use crate::kernel::outcome::{Applied, OutcomeApplier};
use crate::kernel::store::JobStore;
use crate::kernel::worker_client::WorkerApi;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RecoverySummary {
    pub examined: usize,
    pub recovered: usize,
    pub resolved_by_probe: usize,
}

pub struct RecoveryEngine {
    store: Arc<dyn JobStore>,
    worker_api: Arc<dyn WorkerApi>,
    applier: Arc<OutcomeApplier>,
    stale_threshold: Duration,
}

impl RecoveryEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        worker_api: Arc<dyn WorkerApi>,
        applier: Arc<OutcomeApplier>,
        stale_threshold: Duration,
    ) -> Self {
        Self {
            store,
            worker_api,
            applier,
            stale_threshold,
        }
    }

    /// Recover jobs stuck in `running` past the stale threshold.
    pub async fn recover_stale(&self) -> Result<RecoverySummary> {
        let mut summary = RecoverySummary::default();
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(self.stale_threshold)?;

        for job in self.store.list_stale(cutoff).await? {
            summary.examined += 1;

            // One last chance: the worker may still have the result.
            if let Some(worker) = &job.assigned_worker {
                if let Ok(status) = self.worker_api.job_status(worker, job.id).await {
                    if status.status.is_terminal() {
                        let applied =
                            self.applier.apply_status(&job, &status, Utc::now()).await?;
                        if applied != Applied::Nothing {
                            info!(job_id = job.id, "stale job resolved by final probe");
                            summary.resolved_by_probe += 1;
                            continue;
                        }
                    }
                }
            }

            warn!(
                job_id = job.id,
                worker = job.assigned_worker.as_deref().unwrap_or("<none>"),
                started_at = ?job.started_at,
                "recovering stale job"
            );
            if self.applier.fail_lost(&job, Utc::now()).await? != Applied::Nothing {
                summary.recovered += 1;
            }
        }

        if summary.examined > 0 {
            info!(
                examined = summary.examined,
                recovered = summary.recovered,
                resolved = summary.resolved_by_probe,
                "stale recovery pass finished"
            );
        }
        Ok(summary)
    }

    /// Resolve any job lingering in `failed` into `pending` or `dead`.
    pub async fn sweep_failed(&self) -> Result<usize> {
        let mut resolved = 0;
        for job in self.store.list_failed().await? {
            if self.applier.resolve_failed(job.id, Utc::now()).await? != Applied::Nothing {
                resolved += 1;
            }
        }
        Ok(resolved)
    }
}
