//! PostgreSQL-backed job store.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` so concurrent dispatch passes
//! never hand the same job to two workers; every other transition is a
//! compare-and-set on `status`. Each applied transition writes a
//! `job_history` audit row in the same transaction.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};

use fno_protocol::job::{ErrorKind, JobResultRecord, Provider};

use super::{
    CreateOutcome, EvidenceRecord, Job, JobStatus, JobStore, NewEvidence, NewJob, StatusCounts,
    TransitionRow, WorkerSnapshot,
};
use crate::kernel::metrics::MetricsSample;

const JOB_COLUMNS: &str = "id, external_id, provider, action, parameters, submitted_by, \
     priority, status, assigned_worker, retry_count, max_retries, next_run_at, result, \
     error_kind, error_message, callback_status, callback_attempts, callback_last_attempt_at, \
     created_at, updated_at, started_at, completed_at";

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn find_by_external(
        &self,
        provider: Provider,
        external_id: &str,
    ) -> Result<Option<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE provider = $1 AND external_id = $2 LIMIT 1"
        );
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(provider)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }
}

async fn record_history(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
    from: JobStatus,
    to: JobStatus,
    actor: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO job_history (job_id, from_status, to_status, actor) VALUES ($1, $2, $3, $4)",
    )
    .bind(job_id)
    .bind(from)
    .bind(to)
    .bind(actor)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_job(&self, new: NewJob) -> Result<CreateOutcome> {
        if let Some(existing) = self.find_by_external(new.provider, &new.external_id).await? {
            return Ok(CreateOutcome::Existing(existing));
        }

        let sql = format!(
            "INSERT INTO jobs (external_id, provider, action, parameters, submitted_by, \
             priority, max_retries) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (provider, external_id) DO NOTHING \
             RETURNING {JOB_COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, Job>(&sql)
            .bind(&new.external_id)
            .bind(new.provider)
            .bind(new.action)
            .bind(Json(&new.parameters))
            .bind(&new.submitted_by)
            .bind(new.priority)
            .bind(new.max_retries)
            .fetch_optional(&self.pool)
            .await?;

        match inserted {
            Some(job) => Ok(CreateOutcome::Created(job)),
            // Lost the race to a concurrent submit with the same identity.
            None => {
                let existing = self
                    .find_by_external(new.provider, &new.external_id)
                    .await?
                    .context("job vanished between conflicting insert and fetch")?;
                Ok(CreateOutcome::Existing(existing))
            }
        }
    }

    async fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        let jobs = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE status = $1 \
                     ORDER BY created_at DESC LIMIT $2"
                );
                sqlx::query_as::<_, Job>(&sql)
                    .bind(status)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC LIMIT $1"
                );
                sqlx::query_as::<_, Job>(&sql)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(jobs)
    }

    async fn claim_next_ready(
        &self,
        now: DateTime<Utc>,
        providers: &[Provider],
    ) -> Result<Option<Job>> {
        if providers.is_empty() {
            return Ok(None);
        }
        let provider_names: Vec<String> =
            providers.iter().map(|p| p.as_str().to_string()).collect();

        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "WITH next_job AS ( \
                 SELECT id FROM jobs \
                 WHERE status = 'pending' \
                   AND (next_run_at IS NULL OR next_run_at <= $1) \
                   AND provider::text = ANY($2) \
                 ORDER BY priority DESC, created_at ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE jobs SET status = 'dispatching', updated_at = NOW() \
             WHERE id IN (SELECT id FROM next_job) \
             RETURNING {JOB_COLUMNS}"
        );
        let claimed = sqlx::query_as::<_, Job>(&sql)
            .bind(now)
            .bind(&provider_names)
            .fetch_optional(&mut *tx)
            .await?;

        match claimed {
            Some(job) => {
                record_history(
                    &mut tx,
                    job.id,
                    JobStatus::Pending,
                    JobStatus::Dispatching,
                    "dispatcher",
                )
                .await?;
                tx.commit().await?;
                Ok(Some(job))
            }
            None => {
                tx.rollback().await?;
                Ok(None)
            }
        }
    }

    async fn mark_running(&self, id: i64, worker: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "UPDATE jobs SET status = 'running', assigned_worker = $2, started_at = $3, \
             updated_at = NOW() WHERE id = $1 AND status = 'dispatching'",
        )
        .bind(id)
        .bind(worker)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows == 1 {
            record_history(&mut tx, id, JobStatus::Dispatching, JobStatus::Running, "dispatcher")
                .await?;
            tx.commit().await?;
            Ok(true)
        } else {
            tx.rollback().await?;
            Ok(false)
        }
    }

    async fn release_dispatch(&self, id: i64, next_run_at: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "UPDATE jobs SET status = 'pending', assigned_worker = NULL, next_run_at = $2, \
             updated_at = NOW() WHERE id = $1 AND status = 'dispatching'",
        )
        .bind(id)
        .bind(next_run_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows == 1 {
            record_history(&mut tx, id, JobStatus::Dispatching, JobStatus::Pending, "dispatcher")
                .await?;
            tx.commit().await?;
            Ok(true)
        } else {
            tx.rollback().await?;
            Ok(false)
        }
    }

    async fn record_completed(
        &self,
        id: i64,
        record: &JobResultRecord,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "UPDATE jobs SET status = 'completed', result = $2, completed_at = $3, \
             updated_at = NOW() WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(Json(record))
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows == 1 {
            record_history(&mut tx, id, JobStatus::Running, JobStatus::Completed, "poller")
                .await?;
            tx.commit().await?;
            Ok(true)
        } else {
            tx.rollback().await?;
            Ok(false)
        }
    }

    async fn record_failed(
        &self,
        id: i64,
        kind: ErrorKind,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "UPDATE jobs SET status = 'failed', error_kind = $2, error_message = $3, \
             completed_at = $4, updated_at = NOW() WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(kind)
        .bind(message)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows == 1 {
            record_history(&mut tx, id, JobStatus::Running, JobStatus::Failed, "poller").await?;
            tx.commit().await?;
            Ok(true)
        } else {
            tx.rollback().await?;
            Ok(false)
        }
    }

    async fn list_failed(&self) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'failed' ORDER BY updated_at ASC"
        );
        let jobs = sqlx::query_as::<_, Job>(&sql).fetch_all(&self.pool).await?;
        Ok(jobs)
    }

    async fn schedule_retry(&self, id: i64, next_run_at: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "UPDATE jobs SET status = 'pending', retry_count = retry_count + 1, \
             next_run_at = $2, assigned_worker = NULL, started_at = NULL, completed_at = NULL, \
             result = NULL, error_kind = NULL, error_message = NULL, updated_at = NOW() \
             WHERE id = $1 AND status = 'failed'",
        )
        .bind(id)
        .bind(next_run_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows == 1 {
            record_history(&mut tx, id, JobStatus::Failed, JobStatus::Pending, "retry-engine")
                .await?;
            tx.commit().await?;
            Ok(true)
        } else {
            tx.rollback().await?;
            Ok(false)
        }
    }

    async fn mark_dead(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "UPDATE jobs SET status = 'dead', completed_at = COALESCE(completed_at, $2), \
             updated_at = NOW() WHERE id = $1 AND status = 'failed'",
        )
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows == 1 {
            record_history(&mut tx, id, JobStatus::Failed, JobStatus::Dead, "retry-engine")
                .await?;
            tx.commit().await?;
            Ok(true)
        } else {
            tx.rollback().await?;
            Ok(false)
        }
    }

    async fn cancel_job(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let from_status = sqlx::query_scalar::<_, JobStatus>(
            "WITH target AS ( \
                 SELECT id, status FROM jobs \
                 WHERE id = $1 AND status NOT IN ('completed', 'dead') \
                 FOR UPDATE \
             ) \
             UPDATE jobs SET status = 'dead', error_kind = 'cancelled_by_operator', \
                 error_message = 'cancelled by operator', \
                 completed_at = COALESCE(jobs.completed_at, $2), updated_at = NOW() \
             FROM target WHERE jobs.id = target.id \
             RETURNING target.status",
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        match from_status {
            Some(from) => {
                record_history(&mut tx, id, from, JobStatus::Dead, "operator").await?;
                tx.commit().await?;
                Ok(true)
            }
            None => {
                tx.rollback().await?;
                Ok(false)
            }
        }
    }

    async fn list_running(&self) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'running' ORDER BY started_at ASC"
        );
        let jobs = sqlx::query_as::<_, Job>(&sql).fetch_all(&self.pool).await?;
        Ok(jobs)
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status = 'running' AND started_at < $1 ORDER BY started_at ASC"
        );
        let jobs = sqlx::query_as::<_, Job>(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    async fn snapshot_counts(&self) -> Result<StatusCounts> {
        let counts = sqlx::query_as::<_, StatusCounts>(
            "SELECT \
                 COUNT(*) FILTER (WHERE status = 'pending') AS pending, \
                 COUNT(*) FILTER (WHERE status = 'dispatching') AS dispatching, \
                 COUNT(*) FILTER (WHERE status = 'running') AS running, \
                 COUNT(*) FILTER (WHERE status = 'completed') AS completed, \
                 COUNT(*) FILTER (WHERE status = 'failed') AS failed, \
                 COUNT(*) FILTER (WHERE status = 'dead') AS dead, \
                 COUNT(*) FILTER (WHERE callback_status = 'failed') AS callbacks_failed \
             FROM jobs",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(counts)
    }

    async fn history(&self, job_id: i64) -> Result<Vec<TransitionRow>> {
        let rows = sqlx::query_as::<_, TransitionRow>(
            "SELECT job_id, from_status, to_status, actor, created_at \
             FROM job_history WHERE job_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_callback_pending(&self, limit: i64) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status IN ('completed', 'dead') AND callback_status = 'pending' \
             ORDER BY completed_at ASC LIMIT $1"
        );
        let jobs = sqlx::query_as::<_, Job>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    async fn record_callback_attempt(&self, id: i64, now: DateTime<Utc>) -> Result<i32> {
        let attempts = sqlx::query_scalar::<_, i32>(
            "UPDATE jobs SET callback_attempts = callback_attempts + 1, \
             callback_last_attempt_at = $2, updated_at = NOW() \
             WHERE id = $1 RETURNING callback_attempts",
        )
        .bind(id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(attempts)
    }

    async fn mark_callback_delivered(&self, id: i64) -> Result<bool> {
        let rows = sqlx::query(
            "UPDATE jobs SET callback_status = 'delivered', updated_at = NOW() \
             WHERE id = $1 AND callback_status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    async fn mark_callback_failed(&self, id: i64) -> Result<bool> {
        let rows = sqlx::query(
            "UPDATE jobs SET callback_status = 'failed', updated_at = NOW() \
             WHERE id = $1 AND callback_status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    async fn append_evidence(&self, job_id: i64, evidence: NewEvidence) -> Result<()> {
        sqlx::query(
            "INSERT INTO evidence (job_id, name, mime_type, captured_at, payload) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(job_id)
        .bind(&evidence.name)
        .bind(&evidence.mime_type)
        .bind(evidence.captured_at)
        .bind(&evidence.payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_evidence(&self, job_id: i64) -> Result<Vec<EvidenceRecord>> {
        let records = sqlx::query_as::<_, EvidenceRecord>(
            "SELECT id, job_id, name, mime_type, captured_at, payload, path \
             FROM evidence WHERE job_id = $1 ORDER BY captured_at ASC, id ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn purge_evidence_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let rows = sqlx::query("DELETE FROM evidence WHERE captured_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows)
    }

    async fn insert_metrics_sample(&self, sample: &MetricsSample) -> Result<()> {
        sqlx::query(
            "INSERT INTO metrics_samples (sampled_at, pending_count, running_count, \
             completed_count, failed_count, dead_count, callbacks_failed_count, worker_health) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(sample.sampled_at)
        .bind(sample.pending)
        .bind(sample.running)
        .bind(sample.completed)
        .bind(sample.failed)
        .bind(sample.dead)
        .bind(sample.callbacks_failed)
        .bind(Json(&sample.workers))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_worker(&self, snapshot: &WorkerSnapshot) -> Result<()> {
        sqlx::query(
            "INSERT INTO workers (endpoint, capacity, current_load, health, providers, last_probe_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (endpoint) DO UPDATE SET \
                 capacity = EXCLUDED.capacity, \
                 current_load = EXCLUDED.current_load, \
                 health = EXCLUDED.health, \
                 providers = EXCLUDED.providers, \
                 last_probe_at = EXCLUDED.last_probe_at",
        )
        .bind(&snapshot.endpoint)
        .bind(snapshot.capacity)
        .bind(snapshot.current_load)
        .bind(&snapshot.health)
        .bind(&snapshot.providers)
        .bind(snapshot.last_probe_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
