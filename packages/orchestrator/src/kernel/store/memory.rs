//! In-memory job store for tests.
//!
//! Implements the same compare-and-set transition semantics as the
//! Postgres store so dispatcher, poller, recovery, and callback logic can
//! be exercised without a database. Not used in production.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;

use fno_protocol::job::{ErrorKind, JobResultRecord, Provider};

use super::{
    CallbackStatus, CreateOutcome, EvidenceRecord, Job, JobStatus, JobStore, NewEvidence, NewJob,
    StatusCounts, TransitionRow, WorkerSnapshot,
};
use crate::kernel::metrics::MetricsSample;

#[derive(Default)]
struct Inner {
    jobs: HashMap<i64, Job>,
    next_job_id: i64,
    history: Vec<TransitionRow>,
    evidence: HashMap<i64, Vec<EvidenceRecord>>,
    next_evidence_id: i64,
    samples: Vec<MetricsSample>,
    workers: HashMap<String, WorkerSnapshot>,
}

#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All persisted metrics samples, for assertions.
    pub fn samples(&self) -> Vec<MetricsSample> {
        self.inner.lock().expect("store lock").samples.clone()
    }

    /// All persisted worker snapshots, for assertions.
    pub fn worker_rows(&self) -> Vec<WorkerSnapshot> {
        let inner = self.inner.lock().expect("store lock");
        inner.workers.values().cloned().collect()
    }

    fn transition(
        inner: &mut Inner,
        job_id: i64,
        from: JobStatus,
        to: JobStatus,
        actor: &str,
        now: DateTime<Utc>,
    ) {
        inner.history.push(TransitionRow {
            job_id,
            from_status: from,
            to_status: to,
            actor: actor.to_string(),
            created_at: now,
        });
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, new: NewJob) -> Result<CreateOutcome> {
        let mut inner = self.inner.lock().expect("store lock");

        let existing = inner
            .jobs
            .values()
            .find(|j| j.provider == new.provider && j.external_id == new.external_id)
            .cloned();
        if let Some(job) = existing {
            return Ok(CreateOutcome::Existing(job));
        }

        inner.next_job_id += 1;
        let now = Utc::now();
        let job = Job {
            id: inner.next_job_id,
            external_id: new.external_id,
            provider: new.provider,
            action: new.action,
            parameters: Json(new.parameters),
            submitted_by: new.submitted_by,
            priority: new.priority,
            status: JobStatus::Pending,
            assigned_worker: None,
            retry_count: 0,
            max_retries: new.max_retries,
            next_run_at: None,
            result: None,
            error_kind: None,
            error_message: None,
            callback_status: CallbackStatus::Pending,
            callback_attempts: 0,
            callback_last_attempt_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        inner.jobs.insert(job.id, job.clone());
        Ok(CreateOutcome::Created(job))
    }

    async fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner.jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        let inner = self.inner.lock().expect("store lock");
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn claim_next_ready(
        &self,
        now: DateTime<Utc>,
        providers: &[Provider],
    ) -> Result<Option<Job>> {
        let mut inner = self.inner.lock().expect("store lock");

        let mut candidates: Vec<(i32, DateTime<Utc>, i64)> = inner
            .jobs
            .values()
            .filter(|j| j.is_eligible(now) && providers.contains(&j.provider))
            .map(|j| (j.priority, j.created_at, j.id))
            .collect();
        // Highest priority first, oldest first within a priority.
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let Some((_, _, id)) = candidates.first().copied() else {
            return Ok(None);
        };

        let job = inner.jobs.get_mut(&id).context("claimed job vanished")?;
        job.status = JobStatus::Dispatching;
        job.updated_at = now;
        let claimed = job.clone();
        Self::transition(
            &mut inner,
            id,
            JobStatus::Pending,
            JobStatus::Dispatching,
            "dispatcher",
            now,
        );
        Ok(Some(claimed))
    }

    async fn mark_running(&self, id: i64, worker: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock().expect("store lock");
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Dispatching {
            return Ok(false);
        }
        job.status = JobStatus::Running;
        job.assigned_worker = Some(worker.to_string());
        job.started_at = Some(now);
        job.updated_at = now;
        Self::transition(
            &mut inner,
            id,
            JobStatus::Dispatching,
            JobStatus::Running,
            "dispatcher",
            now,
        );
        Ok(true)
    }

    async fn release_dispatch(&self, id: i64, next_run_at: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock().expect("store lock");
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Dispatching {
            return Ok(false);
        }
        job.status = JobStatus::Pending;
        job.assigned_worker = None;
        job.next_run_at = Some(next_run_at);
        job.updated_at = Utc::now();
        Self::transition(
            &mut inner,
            id,
            JobStatus::Dispatching,
            JobStatus::Pending,
            "dispatcher",
            Utc::now(),
        );
        Ok(true)
    }

    async fn record_completed(
        &self,
        id: i64,
        record: &JobResultRecord,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().expect("store lock");
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        job.status = JobStatus::Completed;
        job.result = Some(Json(record.clone()));
        job.completed_at = Some(now);
        job.updated_at = now;
        Self::transition(
            &mut inner,
            id,
            JobStatus::Running,
            JobStatus::Completed,
            "poller",
            now,
        );
        Ok(true)
    }

    async fn record_failed(
        &self,
        id: i64,
        kind: ErrorKind,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().expect("store lock");
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        job.status = JobStatus::Failed;
        job.error_kind = Some(kind);
        job.error_message = Some(message.to_string());
        job.completed_at = Some(now);
        job.updated_at = now;
        Self::transition(
            &mut inner,
            id,
            JobStatus::Running,
            JobStatus::Failed,
            "poller",
            now,
        );
        Ok(true)
    }

    async fn list_failed(&self) -> Result<Vec<Job>> {
        let inner = self.inner.lock().expect("store lock");
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Failed)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.updated_at);
        Ok(jobs)
    }

    async fn schedule_retry(&self, id: i64, next_run_at: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock().expect("store lock");
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Failed {
            return Ok(false);
        }
        job.status = JobStatus::Pending;
        job.retry_count += 1;
        job.next_run_at = Some(next_run_at);
        job.assigned_worker = None;
        job.started_at = None;
        job.completed_at = None;
        job.result = None;
        job.error_kind = None;
        job.error_message = None;
        job.updated_at = Utc::now();
        Self::transition(
            &mut inner,
            id,
            JobStatus::Failed,
            JobStatus::Pending,
            "retry-engine",
            Utc::now(),
        );
        Ok(true)
    }

    async fn mark_dead(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock().expect("store lock");
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Failed {
            return Ok(false);
        }
        job.status = JobStatus::Dead;
        if job.completed_at.is_none() {
            job.completed_at = Some(now);
        }
        job.updated_at = now;
        Self::transition(
            &mut inner,
            id,
            JobStatus::Failed,
            JobStatus::Dead,
            "retry-engine",
            now,
        );
        Ok(true)
    }

    async fn cancel_job(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock().expect("store lock");
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status.is_terminal() {
            return Ok(false);
        }
        let from = job.status;
        job.status = JobStatus::Dead;
        job.error_kind = Some(ErrorKind::CancelledByOperator);
        job.error_message = Some("cancelled by operator".to_string());
        if job.completed_at.is_none() {
            job.completed_at = Some(now);
        }
        job.updated_at = now;
        Self::transition(&mut inner, id, from, JobStatus::Dead, "operator", now);
        Ok(true)
    }

    async fn list_running(&self) -> Result<Vec<Job>> {
        let inner = self.inner.lock().expect("store lock");
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.started_at);
        Ok(jobs)
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let inner = self.inner.lock().expect("store lock");
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Running && j.started_at.map_or(false, |at| at < cutoff)
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.started_at);
        Ok(jobs)
    }

    async fn snapshot_counts(&self) -> Result<StatusCounts> {
        let inner = self.inner.lock().expect("store lock");
        let mut counts = StatusCounts::default();
        for job in inner.jobs.values() {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Dispatching => counts.dispatching += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Dead => counts.dead += 1,
            }
            if job.callback_status == CallbackStatus::Failed {
                counts.callbacks_failed += 1;
            }
        }
        Ok(counts)
    }

    async fn history(&self, job_id: i64) -> Result<Vec<TransitionRow>> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .history
            .iter()
            .filter(|row| row.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn list_callback_pending(&self, limit: i64) -> Result<Vec<Job>> {
        let inner = self.inner.lock().expect("store lock");
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status.is_terminal() && j.callback_status == CallbackStatus::Pending)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.completed_at);
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn record_callback_attempt(&self, id: i64, now: DateTime<Utc>) -> Result<i32> {
        let mut inner = self.inner.lock().expect("store lock");
        let job = inner.jobs.get_mut(&id).context("job not found")?;
        job.callback_attempts += 1;
        job.callback_last_attempt_at = Some(now);
        Ok(job.callback_attempts)
    }

    async fn mark_callback_delivered(&self, id: i64) -> Result<bool> {
        let mut inner = self.inner.lock().expect("store lock");
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.callback_status != CallbackStatus::Pending {
            return Ok(false);
        }
        job.callback_status = CallbackStatus::Delivered;
        Ok(true)
    }

    async fn mark_callback_failed(&self, id: i64) -> Result<bool> {
        let mut inner = self.inner.lock().expect("store lock");
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.callback_status != CallbackStatus::Pending {
            return Ok(false);
        }
        job.callback_status = CallbackStatus::Failed;
        Ok(true)
    }

    async fn append_evidence(&self, job_id: i64, evidence: NewEvidence) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock");
        inner.next_evidence_id += 1;
        let record = EvidenceRecord {
            id: inner.next_evidence_id,
            job_id,
            name: evidence.name,
            mime_type: evidence.mime_type,
            captured_at: evidence.captured_at,
            payload: evidence.payload,
            path: None,
        };
        inner.evidence.entry(job_id).or_default().push(record);
        Ok(())
    }

    async fn list_evidence(&self, job_id: i64) -> Result<Vec<EvidenceRecord>> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner.evidence.get(&job_id).cloned().unwrap_or_default())
    }

    async fn purge_evidence_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().expect("store lock");
        let mut purged = 0;
        for records in inner.evidence.values_mut() {
            let before = records.len();
            records.retain(|r| r.captured_at >= cutoff);
            purged += (before - records.len()) as u64;
        }
        Ok(purged)
    }

    async fn insert_metrics_sample(&self, sample: &MetricsSample) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock");
        inner.samples.push(sample.clone());
        Ok(())
    }

    async fn upsert_worker(&self, snapshot: &WorkerSnapshot) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock");
        inner
            .workers
            .insert(snapshot.endpoint.clone(), snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
pub mod tests_support {
    use super::*;
    use fno_protocol::job::{Action, JobParameters};

    pub fn sample_job(id: i64, now: DateTime<Utc>) -> Job {
        Job {
            id,
            external_id: format!("EXT-{id}"),
            provider: Provider::Mfn,
            action: Action::Validation,
            parameters: Json(JobParameters::new("FTTX047648")),
            submitted_by: "ops".to_string(),
            priority: 0,
            status: JobStatus::Pending,
            assigned_worker: None,
            retry_count: 0,
            max_retries: 3,
            next_run_at: None,
            result: None,
            error_kind: None,
            error_message: None,
            callback_status: CallbackStatus::Pending,
            callback_attempts: 0,
            callback_last_attempt_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fno_protocol::job::{Action, JobParameters};

    fn new_job(external_id: &str, provider: Provider) -> NewJob {
        NewJob::builder()
            .external_id(external_id)
            .provider(provider)
            .action(Action::Validation)
            .parameters(JobParameters::new("FTTX047648"))
            .build()
    }

    #[tokio::test]
    async fn submission_is_idempotent_on_provider_and_external_id() {
        let store = MemoryJobStore::new();
        let first = store.create_job(new_job("X", Provider::Osn)).await.unwrap();
        let second = store.create_job(new_job("X", Provider::Osn)).await.unwrap();

        assert!(first.is_created());
        assert!(!second.is_created());
        assert_eq!(first.job().id, second.job().id);
    }

    #[tokio::test]
    async fn same_external_id_on_another_provider_is_a_new_job() {
        let store = MemoryJobStore::new();
        let first = store.create_job(new_job("X", Provider::Osn)).await.unwrap();
        let second = store.create_job(new_job("X", Provider::Mfn)).await.unwrap();
        assert_ne!(first.job().id, second.job().id);
    }

    #[tokio::test]
    async fn claim_respects_priority_then_age() {
        let store = MemoryJobStore::new();
        let low = store.create_job(new_job("low", Provider::Mfn)).await.unwrap();
        let mut high = new_job("high", Provider::Mfn);
        high.priority = 10;
        let high = store.create_job(high).await.unwrap();

        let claimed = store
            .claim_next_ready(Utc::now(), &[Provider::Mfn])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, high.job().id);

        let claimed = store
            .claim_next_ready(Utc::now(), &[Provider::Mfn])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, low.job().id);
    }

    #[tokio::test]
    async fn claim_filters_by_provider() {
        let store = MemoryJobStore::new();
        store.create_job(new_job("X", Provider::Osn)).await.unwrap();

        let claimed = store
            .claim_next_ready(Utc::now(), &[Provider::Mfn])
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn duplicate_completion_is_a_no_op() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job("X", Provider::Mfn)).await.unwrap();
        let id = job.job().id;
        let now = Utc::now();

        store.claim_next_ready(now, &[Provider::Mfn]).await.unwrap();
        store.mark_running(id, "http://w1", now).await.unwrap();

        let record = JobResultRecord::default();
        assert!(store.record_completed(id, &record, now).await.unwrap());
        assert!(!store.record_completed(id, &record, now).await.unwrap());
    }

    #[tokio::test]
    async fn terminal_jobs_never_leave_their_state() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job("X", Provider::Mfn)).await.unwrap();
        let id = job.job().id;
        let now = Utc::now();

        store.claim_next_ready(now, &[Provider::Mfn]).await.unwrap();
        store.mark_running(id, "http://w1", now).await.unwrap();
        store
            .record_completed(id, &JobResultRecord::default(), now)
            .await
            .unwrap();

        assert!(!store.cancel_job(id, now).await.unwrap());
        assert!(!store.schedule_retry(id, now).await.unwrap());
        assert!(!store.record_failed(id, ErrorKind::NetworkError, "late", now).await.unwrap());
        assert_eq!(
            store.get_job(id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn cancelled_running_job_discards_late_completion() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job("X", Provider::Mfn)).await.unwrap();
        let id = job.job().id;
        let now = Utc::now();

        store.claim_next_ready(now, &[Provider::Mfn]).await.unwrap();
        store.mark_running(id, "http://w1", now).await.unwrap();
        assert!(store.cancel_job(id, now).await.unwrap());

        // The worker finishes later; its result must be discarded.
        assert!(!store
            .record_completed(id, &JobResultRecord::default(), now)
            .await
            .unwrap());
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Dead);
        assert_eq!(job.error_kind, Some(ErrorKind::CancelledByOperator));
    }

    #[tokio::test]
    async fn callback_delivery_is_at_most_once() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job("X", Provider::Mfn)).await.unwrap();
        let id = job.job().id;
        let now = Utc::now();

        store.claim_next_ready(now, &[Provider::Mfn]).await.unwrap();
        store.mark_running(id, "http://w1", now).await.unwrap();
        store
            .record_completed(id, &JobResultRecord::default(), now)
            .await
            .unwrap();

        assert!(store.mark_callback_delivered(id).await.unwrap());
        assert!(!store.mark_callback_delivered(id).await.unwrap());
        assert!(!store.mark_callback_failed(id).await.unwrap());
        assert!(store.list_callback_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_listing_uses_a_strict_cutoff() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job("X", Provider::Mfn)).await.unwrap();
        let id = job.job().id;
        let started = Utc::now();

        store.claim_next_ready(started, &[Provider::Mfn]).await.unwrap();
        store.mark_running(id, "http://w1", started).await.unwrap();

        // started_at == cutoff is not yet stale.
        assert!(store.list_stale(started).await.unwrap().is_empty());
        let later = started + chrono::Duration::milliseconds(1);
        assert_eq!(store.list_stale(later).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn evidence_purge_removes_only_expired_records() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let old = NewEvidence {
            name: "old.png".into(),
            mime_type: "image/png".into(),
            captured_at: now - chrono::Duration::days(40),
            payload: vec![1],
        };
        let fresh = NewEvidence {
            name: "fresh.png".into(),
            mime_type: "image/png".into(),
            captured_at: now,
            payload: vec![2],
        };
        store.append_evidence(1, old).await.unwrap();
        store.append_evidence(1, fresh).await.unwrap();

        let purged = store
            .purge_evidence_older_than(now - chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        let remaining = store.list_evidence(1).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "fresh.png");
    }
}
