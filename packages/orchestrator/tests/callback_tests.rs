//! Callback payload mapping and delivery bookkeeping.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};

use fno_protocol::job::{Action, ErrorKind, JobParameters, JobResultRecord, Provider};

use orchestrator_core::kernel::callback::{build_callback_body, CallbackReporter};
use orchestrator_core::kernel::store::{
    CallbackStatus, JobStore, MemoryJobStore, NewJob,
};

use common::submit_job;

// Nothing listens here; deliveries fail fast with connection refused.
const DEAD_UPSTREAM: &str = "http://127.0.0.1:9";

async fn terminal_completed_job(
    store: &MemoryJobStore,
    external_id: &str,
    provider: Provider,
    action: Action,
    details: Map<String, Value>,
) -> i64 {
    let new = NewJob::builder()
        .external_id(external_id)
        .provider(provider)
        .action(action)
        .parameters(JobParameters::new("FTTX047648"))
        .build();
    let id = store.create_job(new).await.unwrap().job().id;
    let now = Utc::now();
    store.claim_next_ready(now, &[provider]).await.unwrap();
    store.mark_running(id, "http://w1", now).await.unwrap();
    let record = JobResultRecord {
        message: Some("done".into()),
        details,
        evidence: Vec::new(),
    };
    store.record_completed(id, &record, now).await.unwrap();
    id
}

async fn terminal_dead_job(
    store: &MemoryJobStore,
    external_id: &str,
    provider: Provider,
    kind: ErrorKind,
) -> i64 {
    let id = submit_job(store, external_id, provider, 0).await;
    let now = Utc::now();
    store.claim_next_ready(now, &[provider]).await.unwrap();
    store.mark_running(id, "http://w1", now).await.unwrap();
    store.record_failed(id, kind, "portal said no", now).await.unwrap();
    store.mark_dead(id, now).await.unwrap();
    id
}

#[tokio::test]
async fn happy_path_validation_callback_body() {
    let store = MemoryJobStore::new();
    let mut details = Map::new();
    details.insert("evidence_found".into(), Value::Bool(true));
    let id = terminal_completed_job(
        &store,
        "OSN_VAL_001",
        Provider::Mfn,
        Action::Validation,
        details,
    )
    .await;

    let job = store.get_job(id).await.unwrap().unwrap();
    let body = build_callback_body(&job, 1024 * 1024).unwrap();

    assert_eq!(body.job_id, "OSN_VAL_001");
    assert_eq!(body.fno, "MFN");
    assert_eq!(body.status, "Bitstream Validated");

    let evi: BTreeMap<String, String> = serde_json::from_str(&body.job_evi).unwrap();
    assert_eq!(evi.get("evidence_found").unwrap(), "true");
}

#[tokio::test]
async fn auth_error_callback_carries_the_error_kind() {
    let store = MemoryJobStore::new();
    let id =
        terminal_dead_job(&store, "OSN_VAL_003", Provider::Osn, ErrorKind::AuthError).await;

    let job = store.get_job(id).await.unwrap().unwrap();
    let body = build_callback_body(&job, 1024 * 1024).unwrap();

    assert_eq!(body.status, "Bitstream Validation Auth Error");
    assert_eq!(body.fno, "OSN");
    let evi: BTreeMap<String, String> = serde_json::from_str(&body.job_evi).unwrap();
    assert_eq!(evi.get("error_kind").unwrap(), "auth_error");
}

#[tokio::test]
async fn pending_cease_detail_maps_to_cancellation_pending() {
    let store = MemoryJobStore::new();
    let mut details = Map::new();
    details.insert("pending_cease".into(), Value::Bool(true));
    let id = terminal_completed_job(
        &store,
        "CXL-1",
        Provider::Octotel,
        Action::Cancellation,
        details,
    )
    .await;

    let job = store.get_job(id).await.unwrap().unwrap();
    let body = build_callback_body(&job, 1024 * 1024).unwrap();
    assert_eq!(body.status, "Bitstream Cancellation Pending");
}

#[tokio::test]
async fn building_a_body_for_a_non_terminal_job_is_an_error() {
    let store = MemoryJobStore::new();
    let id = submit_job(&store, "X", Provider::Mfn, 0).await;
    let job = store.get_job(id).await.unwrap().unwrap();
    assert!(build_callback_body(&job, 1024 * 1024).is_err());
}

#[tokio::test]
async fn failed_delivery_counts_attempts_and_keeps_the_callback_pending() {
    let store = Arc::new(MemoryJobStore::new());
    let id = terminal_completed_job(
        &store,
        "X",
        Provider::Mfn,
        Action::Validation,
        Map::new(),
    )
    .await;

    let reporter = CallbackReporter::new(
        store.clone() as Arc<dyn JobStore>,
        DEAD_UPSTREAM.to_string(),
        Duration::from_secs(1),
        5,
        1024 * 1024,
    )
    .unwrap();

    let summary = reporter.flush().await.unwrap();
    assert_eq!(summary.delivered, 0);
    assert_eq!(summary.retried, 1);

    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.callback_status, CallbackStatus::Pending);
    assert_eq!(job.callback_attempts, 1);
    assert!(job.callback_last_attempt_at.is_some());
}

#[tokio::test]
async fn delivery_is_abandoned_after_max_attempts() {
    let store = Arc::new(MemoryJobStore::new());
    let id = terminal_completed_job(
        &store,
        "X",
        Provider::Mfn,
        Action::Validation,
        Map::new(),
    )
    .await;

    let reporter = CallbackReporter::new(
        store.clone() as Arc<dyn JobStore>,
        DEAD_UPSTREAM.to_string(),
        Duration::from_secs(1),
        1,
        1024 * 1024,
    )
    .unwrap();

    let summary = reporter.flush().await.unwrap();
    assert_eq!(summary.abandoned, 1);

    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.callback_status, CallbackStatus::Failed);

    // Abandoned callbacks never come back into the pending list.
    let summary = reporter.flush().await.unwrap();
    assert_eq!(summary.abandoned, 0);
    assert_eq!(summary.retried, 0);
    assert_eq!(store.get_job(id).await.unwrap().unwrap().callback_attempts, 1);
}

#[tokio::test]
async fn retry_waits_out_the_delivery_backoff() {
    let store = Arc::new(MemoryJobStore::new());
    let id = terminal_completed_job(
        &store,
        "X",
        Provider::Mfn,
        Action::Validation,
        Map::new(),
    )
    .await;

    let reporter = CallbackReporter::new(
        store.clone() as Arc<dyn JobStore>,
        DEAD_UPSTREAM.to_string(),
        Duration::from_secs(1),
        5,
        1024 * 1024,
    )
    .unwrap();

    reporter.flush().await.unwrap();
    assert_eq!(store.get_job(id).await.unwrap().unwrap().callback_attempts, 1);

    // Immediately after a failed attempt the callback is not yet due.
    let summary = reporter.flush().await.unwrap();
    assert_eq!(summary.retried, 0);
    assert_eq!(store.get_job(id).await.unwrap().unwrap().callback_attempts, 1);
}

#[tokio::test]
async fn only_one_callback_for_an_idempotent_resubmission() {
    let store = Arc::new(MemoryJobStore::new());
    let id = terminal_completed_job(
        &store,
        "SAME",
        Provider::Osn,
        Action::Validation,
        Map::new(),
    )
    .await;

    // Resubmitting after completion returns the same job, not a new one.
    let resubmit = NewJob::builder()
        .external_id("SAME")
        .provider(Provider::Osn)
        .action(Action::Validation)
        .parameters(JobParameters::new("FTTX047648"))
        .build();
    let outcome = store.create_job(resubmit).await.unwrap();
    assert!(!outcome.is_created());
    assert_eq!(outcome.job().id, id);

    // Exactly one pending callback exists for it.
    assert_eq!(store.list_callback_pending(10).await.unwrap().len(), 1);
    store.mark_callback_delivered(id).await.unwrap();
    assert!(store.list_callback_pending(10).await.unwrap().is_empty());
}
