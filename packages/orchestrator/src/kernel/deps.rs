//! Central dependency container and component wiring.
//!
//! The scheduler owns the periodic work; HTTP handlers get read access to
//! the same components through this container. Nothing here holds a lock
//! across component boundaries.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::kernel::callback::CallbackReporter;
use crate::kernel::dispatch::QueueDispatcher;
use crate::kernel::evidence::EvidenceStore;
use crate::kernel::metrics::{MetricsCollector, MetricsSample};
use crate::kernel::outcome::OutcomeApplier;
use crate::kernel::poller::StatusPoller;
use crate::kernel::recovery::RecoveryEngine;
use crate::kernel::registry::WorkerRegistry;
use crate::kernel::retry::RetryPolicy;
use crate::kernel::scheduler::{
    Scheduler, CALLBACK_FLUSH, EVIDENCE_EVICTION, METRICS_SNAPSHOT, QUEUE_POLL, STALE_RECOVERY,
    STATUS_POLL, WORKER_HEALTH,
};
use crate::kernel::store::JobStore;
use crate::kernel::worker_client::WorkerApi;
use crate::server::auth::JwtService;

pub struct OrchestratorDeps {
    pub store: Arc<dyn JobStore>,
    pub registry: Arc<WorkerRegistry>,
    pub dispatcher: Arc<QueueDispatcher>,
    pub poller: Arc<StatusPoller>,
    pub recovery: Arc<RecoveryEngine>,
    pub reporter: Arc<CallbackReporter>,
    pub metrics: Arc<MetricsCollector>,
    pub evidence: Arc<EvidenceStore>,
    pub scheduler: Arc<Scheduler>,
    pub jwt: Arc<JwtService>,
    pub admin_username: String,
    pub admin_password: String,
}

/// Wire every orchestrator component and register the scheduler tasks.
pub fn build_deps(
    config: &Config,
    store: Arc<dyn JobStore>,
    worker_api: Arc<dyn WorkerApi>,
    shutdown: CancellationToken,
) -> Result<Arc<OrchestratorDeps>> {
    let registry = Arc::new(WorkerRegistry::new(
        &config.worker_endpoints,
        config.worker_failure_threshold,
    ));
    let evidence = Arc::new(EvidenceStore::new(
        store.clone(),
        config.evidence_retention_days,
    ));
    let applier = Arc::new(OutcomeApplier::new(
        store.clone(),
        registry.clone(),
        evidence.clone(),
        RetryPolicy::default(),
    ));
    let dispatcher = Arc::new(QueueDispatcher::new(
        store.clone(),
        registry.clone(),
        worker_api.clone(),
        config.dispatch_backoff,
    ));
    let poller = Arc::new(StatusPoller::new(
        store.clone(),
        registry.clone(),
        worker_api.clone(),
        applier.clone(),
        config.lost_threshold,
    ));
    let recovery = Arc::new(RecoveryEngine::new(
        store.clone(),
        worker_api.clone(),
        applier.clone(),
        config.stale_threshold,
    ));
    let reporter = Arc::new(CallbackReporter::new(
        store.clone(),
        config.upstream_callback_url.clone(),
        config.http_timeout,
        config.callback_max_attempts,
        config.evidence_body_limit,
    )?);
    let metrics = Arc::new(MetricsCollector::default());
    let jwt = Arc::new(JwtService::new(
        &config.jwt_secret,
        config.jwt_issuer.clone(),
        config.token_ttl_secs,
    ));

    let mut scheduler = Scheduler::new(shutdown);

    {
        // Resolve lingering failed jobs first so a retry scheduled in this
        // pass can be dispatched in the same pass once its time comes.
        let recovery = recovery.clone();
        let dispatcher = dispatcher.clone();
        scheduler.add_interval_task(QUEUE_POLL, config.poll_interval, move || {
            let recovery = recovery.clone();
            let dispatcher = dispatcher.clone();
            async move {
                recovery.sweep_failed().await?;
                dispatcher.run_pass().await?;
                Ok(())
            }
        });
    }

    {
        let poller = poller.clone();
        scheduler.add_interval_task(STATUS_POLL, config.status_poll_interval, move || {
            let poller = poller.clone();
            async move {
                poller.run_pass().await?;
                Ok(())
            }
        });
    }

    {
        let recovery = recovery.clone();
        scheduler.add_interval_task(STALE_RECOVERY, config.recover_interval, move || {
            let recovery = recovery.clone();
            async move {
                recovery.recover_stale().await?;
                Ok(())
            }
        });
    }

    {
        let store = store.clone();
        let registry = registry.clone();
        let metrics = metrics.clone();
        scheduler.add_interval_task(METRICS_SNAPSHOT, config.metrics_interval, move || {
            let store = store.clone();
            let registry = registry.clone();
            let metrics = metrics.clone();
            async move { collect_sample(&*store, &registry, &metrics).await }
        });
    }

    {
        let registry = registry.clone();
        let worker_api = worker_api.clone();
        let store = store.clone();
        scheduler.add_interval_task(WORKER_HEALTH, config.health_probe_interval, move || {
            let registry = registry.clone();
            let worker_api = worker_api.clone();
            let store = store.clone();
            async move { probe_workers(&registry, &*worker_api, &*store).await }
        });
    }

    {
        let reporter = reporter.clone();
        scheduler.add_interval_task(CALLBACK_FLUSH, config.callback_flush_interval, move || {
            let reporter = reporter.clone();
            async move {
                reporter.flush().await?;
                Ok(())
            }
        });
    }

    {
        let evidence = evidence.clone();
        scheduler.add_cron_task(EVIDENCE_EVICTION, &config.eviction_cron, move || {
            let evidence = evidence.clone();
            async move {
                evidence.purge_expired(Utc::now()).await?;
                Ok(())
            }
        });
    }

    Ok(Arc::new(OrchestratorDeps {
        store,
        registry,
        dispatcher,
        poller,
        recovery,
        reporter,
        metrics,
        evidence,
        scheduler: Arc::new(scheduler),
        jwt,
        admin_username: config.admin_username.clone(),
        admin_password: config.admin_password.clone(),
    }))
}

/// Take one metrics snapshot: ring buffer plus the durable samples table.
pub async fn collect_sample(
    store: &dyn JobStore,
    registry: &WorkerRegistry,
    metrics: &MetricsCollector,
) -> Result<()> {
    let counts = store.snapshot_counts().await?;
    let sample = MetricsSample {
        sampled_at: Utc::now(),
        pending: counts.pending,
        dispatching: counts.dispatching,
        running: counts.running,
        completed: counts.completed,
        failed: counts.failed,
        dead: counts.dead,
        callbacks_failed: counts.callbacks_failed,
        workers: registry.health_map().await,
    };
    store.insert_metrics_sample(&sample).await?;
    metrics.record(sample).await;
    Ok(())
}

/// Probe every configured worker and persist the observed state.
pub async fn probe_workers(
    registry: &WorkerRegistry,
    worker_api: &dyn WorkerApi,
    store: &dyn JobStore,
) -> Result<()> {
    let now = Utc::now();
    for view in registry.views().await {
        let health = worker_api.health(&view.endpoint).await.ok();
        let capabilities = worker_api.capabilities(&view.endpoint).await.ok();
        registry
            .apply_probe(&view.endpoint, now, health.as_ref(), capabilities.as_ref())
            .await;
    }
    for snapshot in registry.snapshots().await {
        store.upsert_worker(&snapshot).await?;
    }
    Ok(())
}
