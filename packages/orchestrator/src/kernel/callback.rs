//! Callback reporter: delivers terminal job outcomes upstream.
//!
//! Delivery retries are independent of the job retry policy: a bounded
//! exponential backoff on the callback attempt counter, after which the
//! callback is marked failed and surfaced in metrics while the job itself
//! stays terminal. The `delivered` mark is a CAS from `pending`, so a
//! callback is delivered at most once.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

use fno_protocol::backoff::Backoff;
use fno_protocol::callback::{CallbackBody, TerminalOutcome};
use fno_protocol::job::ErrorKind;

use crate::kernel::store::{Job, JobStatus, JobStore};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FlushSummary {
    pub delivered: usize,
    pub retried: usize,
    pub abandoned: usize,
}

/// Build the upstream body for a terminal job.
pub fn build_callback_body(job: &Job, evidence_limit: usize) -> Result<CallbackBody> {
    let empty = serde_json::Map::new();
    let details = job
        .result
        .as_ref()
        .map(|r| &r.0.details)
        .unwrap_or(&empty);

    let outcome = match job.status {
        JobStatus::Completed => TerminalOutcome::Completed { details },
        JobStatus::Dead => TerminalOutcome::Failed {
            kind: job.error_kind.unwrap_or(ErrorKind::SystemError),
        },
        other => anyhow::bail!("job {} is not terminal (status {other:?})", job.id),
    };

    Ok(CallbackBody::assemble(
        &job.external_id,
        job.provider,
        job.action,
        &outcome,
        details,
        job.completed_at.unwrap_or_else(Utc::now),
        evidence_limit,
    ))
}

pub struct CallbackReporter {
    store: Arc<dyn JobStore>,
    client: Client,
    upstream_url: String,
    max_attempts: i32,
    delivery_backoff: Backoff,
    evidence_limit: usize,
    batch_size: i64,
}

impl CallbackReporter {
    pub fn new(
        store: Arc<dyn JobStore>,
        upstream_url: String,
        http_timeout: Duration,
        max_attempts: i32,
        evidence_limit: usize,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(http_timeout)
            .build()
            .context("failed to build callback HTTP client")?;
        Ok(Self {
            store,
            client,
            upstream_url,
            max_attempts: max_attempts.max(1),
            delivery_backoff: Backoff::default(),
            evidence_limit,
            batch_size: 100,
        })
    }

    /// Deliver every due pending callback once.
    pub async fn flush(&self) -> Result<FlushSummary> {
        let mut summary = FlushSummary::default();
        let now = Utc::now();

        for job in self.store.list_callback_pending(self.batch_size).await? {
            if !self.due(&job, now) {
                continue;
            }

            let body = match build_callback_body(&job, self.evidence_limit) {
                Ok(body) => body,
                Err(e) => {
                    warn!(job_id = job.id, error = %e, "cannot build callback body");
                    self.store.mark_callback_failed(job.id).await?;
                    summary.abandoned += 1;
                    continue;
                }
            };

            let attempts = self.store.record_callback_attempt(job.id, now).await?;
            if self.deliver(&body).await {
                if self.store.mark_callback_delivered(job.id).await? {
                    info!(
                        job_id = job.id,
                        external_id = %job.external_id,
                        status = %body.status,
                        "callback delivered"
                    );
                    summary.delivered += 1;
                }
            } else if attempts >= self.max_attempts {
                warn!(
                    job_id = job.id,
                    attempts, "callback abandoned after max delivery attempts"
                );
                self.store.mark_callback_failed(job.id).await?;
                summary.abandoned += 1;
            } else {
                debug!(job_id = job.id, attempts, "callback delivery failed; will retry");
                summary.retried += 1;
            }
        }

        Ok(summary)
    }

    /// Delivery backoff gate: attempt N may run once
    /// `last_attempt + backoff(N)` has passed.
    fn due(&self, job: &Job, now: DateTime<Utc>) -> bool {
        if job.callback_attempts == 0 {
            return true;
        }
        let Some(last) = job.callback_last_attempt_at else {
            return true;
        };
        let delay = self
            .delivery_backoff
            .raw_delay(job.callback_attempts as u32);
        match chrono::Duration::from_std(delay) {
            Ok(delay) => last + delay <= now,
            Err(_) => true,
        }
    }

    async fn deliver(&self, body: &CallbackBody) -> bool {
        match self
            .client
            .post(&self.upstream_url)
            .json(body)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                debug!(status = %response.status(), "upstream rejected callback");
                false
            }
            Err(e) => {
                debug!(error = %e, "callback transport error");
                false
            }
        }
    }
}
