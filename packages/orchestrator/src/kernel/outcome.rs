//! Applies worker-reported terminal statuses to the job store.
//!
//! Shared by the status poller and stale recovery so both drive the same
//! transitions: completion persists the result and evidence, failure is
//! resolved through the retry policy into `pending` or `dead`. Every
//! transition is a CAS, so a late or duplicate report is a no-op.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use fno_protocol::job::{AutomationError, ErrorKind};
use fno_protocol::wire::{ExecutionStatus, StatusResponse};

use crate::kernel::evidence::EvidenceStore;
use crate::kernel::registry::WorkerRegistry;
use crate::kernel::retry::{RetryDecision, RetryPolicy};
use crate::kernel::store::{Job, JobStore};

/// What applying a status report did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Nothing,
    Completed,
    FailedRequeued,
    FailedDead,
}

pub struct OutcomeApplier {
    store: Arc<dyn JobStore>,
    registry: Arc<WorkerRegistry>,
    evidence: Arc<EvidenceStore>,
    policy: RetryPolicy,
}

impl OutcomeApplier {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<WorkerRegistry>,
        evidence: Arc<EvidenceStore>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            registry,
            evidence,
            policy,
        }
    }

    /// Apply a worker status report to a job believed to be running.
    pub async fn apply_status(
        &self,
        job: &Job,
        status: &StatusResponse,
        now: DateTime<Utc>,
    ) -> Result<Applied> {
        match status.status {
            ExecutionStatus::Running | ExecutionStatus::NotFound => Ok(Applied::Nothing),
            ExecutionStatus::Completed => {
                let outcome = status.result.clone().unwrap_or_default();
                let record = outcome.to_record();
                if !self.store.record_completed(job.id, &record, now).await? {
                    // Lost the CAS: duplicate poll or the job was cancelled.
                    debug!(job_id = job.id, "discarding late completion report");
                    return Ok(Applied::Nothing);
                }
                info!(job_id = job.id, external_id = %job.external_id, "job completed");
                if let Err(e) = self.evidence.store_captures(job.id, &outcome.evidence).await {
                    warn!(job_id = job.id, error = %e, "failed to persist evidence");
                }
                self.release_worker_slot(job).await;
                Ok(Applied::Completed)
            }
            ExecutionStatus::Failed => {
                let error = status.error.clone().unwrap_or_else(|| {
                    AutomationError::new(
                        ErrorKind::SystemError,
                        "worker reported failure without detail",
                    )
                });
                if !self
                    .store
                    .record_failed(job.id, error.kind, &error.message, now)
                    .await?
                {
                    debug!(job_id = job.id, "discarding late failure report");
                    return Ok(Applied::Nothing);
                }
                self.release_worker_slot(job).await;
                self.resolve_failed(job.id, now).await
            }
        }
    }

    /// Mark a running job failed on the orchestrator's own authority
    /// (lost heartbeat) and resolve it through the retry policy.
    pub async fn fail_lost(&self, job: &Job, now: DateTime<Utc>) -> Result<Applied> {
        if !self
            .store
            .record_failed(
                job.id,
                ErrorKind::LostHeartbeat,
                "worker no longer reports this job",
                now,
            )
            .await?
        {
            return Ok(Applied::Nothing);
        }
        self.release_worker_slot(job).await;
        self.resolve_failed(job.id, now).await
    }

    /// Resolve a job sitting in `failed` into `pending` or `dead`.
    pub async fn resolve_failed(&self, job_id: i64, now: DateTime<Utc>) -> Result<Applied> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Ok(Applied::Nothing);
        };
        let Some(kind) = job.error_kind else {
            // Shouldn't happen: failed without a recorded kind. Be terminal.
            warn!(job_id, "failed job has no error kind; dead-lettering");
            self.store.mark_dead(job_id, now).await?;
            return Ok(Applied::FailedDead);
        };

        match self.policy.decide(kind, job.retry_count, job.max_retries) {
            RetryDecision::Retry(delay) => {
                let next_run_at = now + chrono::Duration::from_std(delay)?;
                if self.store.schedule_retry(job_id, next_run_at).await? {
                    info!(
                        job_id,
                        retry = job.retry_count + 1,
                        next_run_at = %next_run_at,
                        error_kind = %kind,
                        "job requeued for retry"
                    );
                    Ok(Applied::FailedRequeued)
                } else {
                    Ok(Applied::Nothing)
                }
            }
            RetryDecision::Dead => {
                if self.store.mark_dead(job_id, now).await? {
                    warn!(job_id, error_kind = %kind, "job dead-lettered");
                    Ok(Applied::FailedDead)
                } else {
                    Ok(Applied::Nothing)
                }
            }
        }
    }

    async fn release_worker_slot(&self, job: &Job) {
        if let Some(worker) = &job.assigned_worker {
            self.registry.note_job_finished(worker).await;
        }
    }
}
