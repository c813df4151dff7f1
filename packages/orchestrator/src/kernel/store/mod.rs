//! Job store: the single coordination point for all job state.
//!
//! Every state transition is a compare-and-set on the `status` column, so
//! concurrent dispatcher, poller, and recovery passes can never double-apply
//! a transition. The [`JobStore`] trait abstracts the storage so components
//! can be exercised against the in-memory implementation in tests.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use typed_builder::TypedBuilder;

use fno_protocol::job::{Action, ErrorKind, JobParameters, JobResultRecord, Provider};

use crate::kernel::metrics::MetricsSample;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

// ============================================================================
// Enums
// ============================================================================

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default,
)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Dispatching,
    Running,
    Completed,
    Failed,
    Dead,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Dead)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Dispatching => "dispatching",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default,
)]
#[sqlx(type_name = "callback_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    #[default]
    Pending,
    Delivered,
    Failed,
}

// ============================================================================
// Job model
// ============================================================================

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub external_id: String,
    pub provider: Provider,
    pub action: Action,
    pub parameters: Json<JobParameters>,
    /// Username of the authenticated submitter; owns the job for cancel.
    pub submitted_by: String,
    pub priority: i32,
    pub status: JobStatus,
    pub assigned_worker: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_run_at: Option<DateTime<Utc>>,
    pub result: Option<Json<JobResultRecord>>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub callback_status: CallbackStatus,
    pub callback_attempts: i32,
    pub callback_last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A pending job whose ready time has arrived is eligible for dispatch.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_run_at.map_or(true, |at| at <= now)
    }
}

/// Request to create a job, idempotent on `(provider, external_id)`.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewJob {
    pub external_id: String,
    pub provider: Provider,
    pub action: Action,
    pub parameters: JobParameters,
    #[builder(default)]
    pub submitted_by: String,
    #[builder(default = 0)]
    pub priority: i32,
    #[builder(default = 3)]
    pub max_retries: i32,
}

/// Result of a create that handles idempotent resubmission.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(Job),
    Existing(Job),
}

impl CreateOutcome {
    pub fn job(&self) -> &Job {
        match self {
            CreateOutcome::Created(job) | CreateOutcome::Existing(job) => job,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

/// One audit row per state transition.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TransitionRow {
    pub job_id: i64,
    pub from_status: JobStatus,
    pub to_status: JobStatus,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

/// Counts by state for the metrics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct StatusCounts {
    pub pending: i64,
    pub dispatching: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead: i64,
    pub callbacks_failed: i64,
}

/// A stored evidence artifact (raw bytes, not base64).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EvidenceRecord {
    pub id: i64,
    pub job_id: i64,
    pub name: String,
    pub mime_type: String,
    pub captured_at: DateTime<Utc>,
    pub payload: Vec<u8>,
    pub path: Option<String>,
}

/// Evidence artifact about to be persisted.
#[derive(Debug, Clone)]
pub struct NewEvidence {
    pub name: String,
    pub mime_type: String,
    pub captured_at: DateTime<Utc>,
    pub payload: Vec<u8>,
}

/// Latest observed state of a worker, persisted for operators.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub endpoint: String,
    pub capacity: i32,
    pub current_load: i32,
    pub health: String,
    pub providers: Vec<String>,
    pub last_probe_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Store trait
// ============================================================================

/// Durable job, evidence, and metrics storage.
///
/// Mutating methods that encode a state transition return `Ok(false)` when
/// the compare-and-set lost (the job was not in the expected prior state);
/// callers treat that as "someone else already resolved this" and move on.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job, or return the existing one for `(provider, external_id)`.
    async fn create_job(&self, new: NewJob) -> anyhow::Result<CreateOutcome>;

    async fn get_job(&self, id: i64) -> anyhow::Result<Option<Job>>;

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: i64,
    ) -> anyhow::Result<Vec<Job>>;

    /// Atomically claim the highest-priority eligible job for one of the
    /// given providers, transitioning it `pending → dispatching`.
    async fn claim_next_ready(
        &self,
        now: DateTime<Utc>,
        providers: &[Provider],
    ) -> anyhow::Result<Option<Job>>;

    /// `dispatching → running` with the assigned worker recorded.
    async fn mark_running(
        &self,
        id: i64,
        worker: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// `dispatching → pending` after a refused or failed dispatch. Does not
    /// touch `retry_count`.
    async fn release_dispatch(
        &self,
        id: i64,
        next_run_at: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// `running → completed` with the result payload.
    async fn record_completed(
        &self,
        id: i64,
        record: &JobResultRecord,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// `running → failed` with the error recorded.
    async fn record_failed(
        &self,
        id: i64,
        kind: ErrorKind,
        message: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    async fn list_failed(&self) -> anyhow::Result<Vec<Job>>;

    /// `failed → pending` with `retry_count` incremented and a ready time.
    async fn schedule_retry(
        &self,
        id: i64,
        next_run_at: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// `failed → dead`, keeping the recorded error as the terminal one.
    async fn mark_dead(&self, id: i64, now: DateTime<Utc>) -> anyhow::Result<bool>;

    /// Operator cancel: any non-terminal state `→ dead` with
    /// `cancelled_by_operator`. A worker completing the job later loses the
    /// CAS and its result is discarded.
    async fn cancel_job(&self, id: i64, now: DateTime<Utc>) -> anyhow::Result<bool>;

    async fn list_running(&self) -> anyhow::Result<Vec<Job>>;

    /// Running jobs whose `started_at` is older than `cutoff`.
    async fn list_stale(&self, cutoff: DateTime<Utc>) -> anyhow::Result<Vec<Job>>;

    async fn snapshot_counts(&self) -> anyhow::Result<StatusCounts>;

    async fn history(&self, job_id: i64) -> anyhow::Result<Vec<TransitionRow>>;

    /// Terminal jobs whose callback has not been delivered or abandoned.
    async fn list_callback_pending(&self, limit: i64) -> anyhow::Result<Vec<Job>>;

    /// Bump the attempt counter; returns the new attempt count.
    async fn record_callback_attempt(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<i32>;

    /// At-most-once: only a `pending` callback can become `delivered`.
    async fn mark_callback_delivered(&self, id: i64) -> anyhow::Result<bool>;

    async fn mark_callback_failed(&self, id: i64) -> anyhow::Result<bool>;

    async fn append_evidence(&self, job_id: i64, evidence: NewEvidence) -> anyhow::Result<()>;

    async fn list_evidence(&self, job_id: i64) -> anyhow::Result<Vec<EvidenceRecord>>;

    async fn purge_evidence_older_than(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64>;

    async fn insert_metrics_sample(&self, sample: &MetricsSample) -> anyhow::Result<()>;

    async fn upsert_worker(&self, snapshot: &WorkerSnapshot) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Dead.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn eligibility_boundary_is_inclusive() {
        let now = Utc::now();
        let mut job = memory::tests_support::sample_job(1, now);
        job.status = JobStatus::Pending;

        job.next_run_at = Some(now);
        assert!(job.is_eligible(now));

        job.next_run_at = Some(now + chrono::Duration::milliseconds(1));
        assert!(!job.is_eligible(now));

        job.next_run_at = None;
        assert!(job.is_eligible(now));
    }

    #[test]
    fn create_outcome_exposes_job_either_way() {
        let now = Utc::now();
        let job = memory::tests_support::sample_job(7, now);
        assert!(CreateOutcome::Created(job.clone()).is_created());
        assert!(!CreateOutcome::Existing(job.clone()).is_created());
        assert_eq!(CreateOutcome::Existing(job).job().id, 7);
    }
}
