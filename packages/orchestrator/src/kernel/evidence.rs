//! Evidence store: screenshots and structured artifacts captured by workers.
//!
//! Payloads are raw bytes in the database; base64 exists only at the HTTP
//! boundaries (worker wire format in, screenshot endpoint out).

use std::sync::Arc;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use fno_protocol::job::EvidenceCapture;

use crate::kernel::store::{JobStore, NewEvidence};

/// Evidence record shaped for the HTTP boundary (payload re-encoded).
#[derive(Debug, Clone, Serialize)]
pub struct EvidenceView {
    pub name: String,
    pub mime_type: String,
    pub captured_at: DateTime<Utc>,
    pub size_bytes: usize,
    pub data: String,
}

pub struct EvidenceStore {
    store: Arc<dyn JobStore>,
    retention: Duration,
}

impl EvidenceStore {
    pub fn new(store: Arc<dyn JobStore>, retention_days: i64) -> Self {
        Self {
            store,
            retention: Duration::days(retention_days.max(1)),
        }
    }

    /// Decode and persist captures reported by a worker. A capture with an
    /// undecodable payload is skipped; the rest still land.
    pub async fn store_captures(
        &self,
        job_id: i64,
        captures: &[EvidenceCapture],
    ) -> Result<usize> {
        let mut stored = 0;
        for capture in captures {
            let payload = match BASE64.decode(&capture.data) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(
                        job_id,
                        name = %capture.name,
                        error = %e,
                        "skipping evidence with invalid base64 payload"
                    );
                    continue;
                }
            };
            self.store
                .append_evidence(
                    job_id,
                    NewEvidence {
                        name: capture.name.clone(),
                        mime_type: capture.mime_type.clone(),
                        captured_at: capture.captured_at,
                        payload,
                    },
                )
                .await?;
            stored += 1;
        }
        Ok(stored)
    }

    /// Evidence for a job, re-encoded for the screenshot endpoint.
    pub async fn list_encoded(&self, job_id: i64) -> Result<Vec<EvidenceView>> {
        let records = self.store.list_evidence(job_id).await?;
        Ok(records
            .into_iter()
            .map(|r| EvidenceView {
                name: r.name,
                mime_type: r.mime_type,
                captured_at: r.captured_at,
                size_bytes: r.payload.len(),
                data: BASE64.encode(&r.payload),
            })
            .collect())
    }

    /// Drop evidence past the retention window.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - self.retention;
        let purged = self.store.purge_evidence_older_than(cutoff).await?;
        if purged > 0 {
            info!(purged, cutoff = %cutoff, "evicted expired evidence");
        }
        Ok(purged)
    }
}
