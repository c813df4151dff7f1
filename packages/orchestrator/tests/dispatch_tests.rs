//! Dispatcher behavior against the in-memory store and a scripted worker.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use fno_protocol::job::Provider;
use orchestrator_core::kernel::dispatch::QueueDispatcher;
use orchestrator_core::kernel::store::{JobStatus, JobStore, MemoryJobStore};

use common::{online_registry, submit_job, DispatchScript, ScriptedWorkerApi};

const BACKOFF: Duration = Duration::from_secs(60);

fn dispatcher(
    store: &Arc<MemoryJobStore>,
    registry: &Arc<orchestrator_core::kernel::registry::WorkerRegistry>,
    api: &Arc<ScriptedWorkerApi>,
) -> QueueDispatcher {
    QueueDispatcher::new(
        store.clone() as Arc<dyn JobStore>,
        registry.clone(),
        api.clone(),
        BACKOFF,
    )
}

#[tokio::test]
async fn eligible_job_is_dispatched_and_marked_running() {
    let store = Arc::new(MemoryJobStore::new());
    let registry = online_registry(&[("http://w1", 2)], &[Provider::Mfn]).await;
    let api = ScriptedWorkerApi::new();

    let id = submit_job(store.as_ref(), "VAL-1", Provider::Mfn, 0).await;

    let summary = dispatcher(&store, &registry, &api).run_pass().await.unwrap();
    assert_eq!(summary.dispatched, 1);

    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.assigned_worker.as_deref(), Some("http://w1"));
    assert!(job.started_at.is_some());
}

#[tokio::test]
async fn one_job_is_never_dispatched_to_two_workers() {
    let store = Arc::new(MemoryJobStore::new());
    let registry =
        online_registry(&[("http://w1", 2), ("http://w2", 2)], &[Provider::Mfn]).await;
    let api = ScriptedWorkerApi::new();

    submit_job(store.as_ref(), "ONLY", Provider::Mfn, 0).await;

    dispatcher(&store, &registry, &api).run_pass().await.unwrap();
    assert_eq!(api.dispatch_count(), 1);
}

#[tokio::test]
async fn higher_priority_jobs_dispatch_first_then_fifo() {
    let store = Arc::new(MemoryJobStore::new());
    let registry = online_registry(&[("http://w1", 10)], &[Provider::Mfn]).await;
    let api = ScriptedWorkerApi::new();

    let old_low = submit_job(store.as_ref(), "LOW-OLD", Provider::Mfn, 0).await;
    let new_low = submit_job(store.as_ref(), "LOW-NEW", Provider::Mfn, 0).await;
    let high = submit_job(store.as_ref(), "HIGH", Provider::Mfn, 10).await;

    dispatcher(&store, &registry, &api).run_pass().await.unwrap();

    assert_eq!(api.dispatched_job_ids(), vec![high, old_low, new_low]);
}

#[tokio::test]
async fn provider_filter_keeps_jobs_off_wrong_workers() {
    let store = Arc::new(MemoryJobStore::new());
    let registry = online_registry(&[("http://w1", 2)], &[Provider::Octotel]).await;
    let api = ScriptedWorkerApi::new();

    let id = submit_job(store.as_ref(), "X", Provider::Mfn, 0).await;

    let summary = dispatcher(&store, &registry, &api).run_pass().await.unwrap();
    assert_eq!(summary.dispatched, 0);
    assert_eq!(
        store.get_job(id).await.unwrap().unwrap().status,
        JobStatus::Pending
    );
}

#[tokio::test]
async fn waiting_job_is_not_eligible_until_its_ready_time() {
    let store = Arc::new(MemoryJobStore::new());
    let registry = online_registry(&[("http://w1", 2)], &[Provider::Mfn]).await;
    let api = ScriptedWorkerApi::new();

    let id = submit_job(store.as_ref(), "X", Provider::Mfn, 0).await;
    // Push the ready time into the future by failing a dispatch.
    api.script_dispatch("http://w1", vec![DispatchScript::Refuse]);
    dispatcher(&store, &registry, &api).run_pass().await.unwrap();

    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.next_run_at.unwrap() > Utc::now());

    // Second pass: still waiting, nothing dispatched.
    dispatcher(&store, &registry, &api).run_pass().await.unwrap();
    assert_eq!(api.dispatch_count(), 0);
}

#[tokio::test]
async fn refusal_does_not_touch_retry_count() {
    let store = Arc::new(MemoryJobStore::new());
    let registry = online_registry(&[("http://w1", 2)], &[Provider::Mfn]).await;
    let api = ScriptedWorkerApi::new();
    api.script_dispatch("http://w1", vec![DispatchScript::Refuse]);

    let id = submit_job(store.as_ref(), "X", Provider::Mfn, 0).await;
    let summary = dispatcher(&store, &registry, &api).run_pass().await.unwrap();

    assert_eq!(summary.dispatched, 0);
    assert_eq!(summary.released, 1);
    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 0);
}

#[tokio::test]
async fn transport_errors_degrade_the_worker_after_the_threshold() {
    let store = Arc::new(MemoryJobStore::new());
    let registry = online_registry(&[("http://w1", 10)], &[Provider::Mfn]).await;
    let api = ScriptedWorkerApi::new();
    api.script_dispatch(
        "http://w1",
        vec![
            DispatchScript::TransportError,
            DispatchScript::TransportError,
            DispatchScript::TransportError,
        ],
    );

    for i in 0..3 {
        submit_job(store.as_ref(), &format!("J{i}"), Provider::Mfn, 0).await;
    }

    let d = dispatcher(&store, &registry, &api);
    // Each failed dispatch backs the job off, so each pass attempts one job
    // per candidate round; three passes exhaust the failure threshold.
    d.run_pass().await.unwrap();
    d.run_pass().await.unwrap();
    d.run_pass().await.unwrap();

    assert!(registry.dispatch_candidates().await.is_empty());
}

#[tokio::test]
async fn worker_capacity_bounds_concurrent_dispatches() {
    let store = Arc::new(MemoryJobStore::new());
    let registry = online_registry(&[("http://w1", 2)], &[Provider::Mfn]).await;
    let api = ScriptedWorkerApi::new();

    for i in 0..3 {
        submit_job(store.as_ref(), &format!("J{i}"), Provider::Mfn, 0).await;
    }

    let summary = dispatcher(&store, &registry, &api).run_pass().await.unwrap();
    assert_eq!(summary.dispatched, 2);
    assert_eq!(
        store.snapshot_counts().await.unwrap().pending,
        1,
        "third job must wait for a free slot"
    );
}

#[tokio::test]
async fn overlapping_passes_agree_on_a_single_dispatch_per_job() {
    let store = Arc::new(MemoryJobStore::new());
    let registry =
        online_registry(&[("http://w1", 5), ("http://w2", 5)], &[Provider::Mfn]).await;
    let api = ScriptedWorkerApi::new();

    for i in 0..8 {
        submit_job(store.as_ref(), &format!("J{i}"), Provider::Mfn, 0).await;
    }

    let d1 = dispatcher(&store, &registry, &api);
    let d2 = dispatcher(&store, &registry, &api);
    let (r1, r2) = tokio::join!(d1.run_pass(), d2.run_pass());
    r1.unwrap();
    r2.unwrap();

    let mut ids = api.dispatched_job_ids();
    ids.sort_unstable();
    let before = ids.len();
    ids.dedup();
    assert_eq!(before, ids.len(), "a job was dispatched twice");
}
