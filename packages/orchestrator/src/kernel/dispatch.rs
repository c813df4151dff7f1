//! Queue dispatcher: turns eligible pending jobs into running jobs on
//! healthy workers.
//!
//! One pass walks the round-robin candidate list, claiming one job per
//! worker per round until there is nothing eligible or no capacity left.
//! Claiming is an atomic `pending → dispatching` CAS in the store, so
//! overlapping passes can never hand the same job to two workers. A
//! refused or failed dispatch releases the job back to `pending` with a
//! short ready-time backoff and never touches `retry_count`; dispatch
//! problems are infrastructure, not job failures.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use fno_protocol::wire::ExecuteRequest;

use crate::kernel::registry::WorkerRegistry;
use crate::kernel::store::{Job, JobStore};
use crate::kernel::worker_client::{DispatchReply, WorkerApi};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DispatchSummary {
    pub dispatched: usize,
    pub released: usize,
}

pub struct QueueDispatcher {
    store: Arc<dyn JobStore>,
    registry: Arc<WorkerRegistry>,
    worker_api: Arc<dyn WorkerApi>,
    dispatch_backoff: Duration,
}

impl QueueDispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<WorkerRegistry>,
        worker_api: Arc<dyn WorkerApi>,
        dispatch_backoff: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            worker_api,
            dispatch_backoff,
        }
    }

    /// One dispatch pass.
    pub async fn run_pass(&self) -> Result<DispatchSummary> {
        let mut summary = DispatchSummary::default();

        loop {
            let targets = self.registry.dispatch_candidates().await;
            if targets.is_empty() {
                debug!("no dispatch candidates with spare capacity");
                break;
            }

            let mut progressed = false;
            for target in targets {
                let now = Utc::now();
                let Some(job) = self
                    .store
                    .claim_next_ready(now, &target.providers)
                    .await?
                else {
                    continue;
                };

                if self.dispatch_one(&job, &target.endpoint).await? {
                    progressed = true;
                    summary.dispatched += 1;
                } else {
                    summary.released += 1;
                }
            }

            if !progressed {
                break;
            }
        }

        if summary.dispatched > 0 || summary.released > 0 {
            info!(
                dispatched = summary.dispatched,
                released = summary.released,
                "dispatch pass finished"
            );
        }
        Ok(summary)
    }

    /// Dispatch one claimed job; returns true when the worker accepted it.
    async fn dispatch_one(&self, job: &Job, endpoint: &str) -> Result<bool> {
        let request = ExecuteRequest {
            job_id: job.id,
            provider: job.provider,
            action: job.action,
            parameters: job.parameters.0.clone(),
        };

        match self.worker_api.dispatch(endpoint, &request).await {
            Ok(DispatchReply::Accepted) => {
                let now = Utc::now();
                if self.store.mark_running(job.id, endpoint, now).await? {
                    self.registry.record_dispatch_success(endpoint).await;
                    debug!(job_id = job.id, worker = %endpoint, "job dispatched");
                    Ok(true)
                } else {
                    // The job left `dispatching` underneath us (operator
                    // cancel); the worker-side run will be discarded when
                    // it reports back.
                    warn!(job_id = job.id, "dispatched job no longer dispatching");
                    Ok(false)
                }
            }
            Ok(DispatchReply::Refused { retry_after_secs }) => {
                let backoff = retry_after_secs
                    .map(Duration::from_secs)
                    .unwrap_or(self.dispatch_backoff);
                self.release(job, backoff).await?;
                debug!(job_id = job.id, worker = %endpoint, "worker refused dispatch");
                Ok(false)
            }
            Err(e) => {
                warn!(job_id = job.id, worker = %endpoint, error = %e, "dispatch failed");
                self.registry.record_dispatch_failure(endpoint).await;
                self.release(job, self.dispatch_backoff).await?;
                Ok(false)
            }
        }
    }

    async fn release(&self, job: &Job, backoff: Duration) -> Result<()> {
        let next_run_at = Utc::now() + chrono::Duration::from_std(backoff)?;
        self.store.release_dispatch(job.id, next_run_at).await?;
        Ok(())
    }
}
