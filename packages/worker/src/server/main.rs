// Worker entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use worker_core::automation::{AutomationRegistry, MockAutomation};
use worker_core::config::Config;
use worker_core::runtime::{ExecutionRuntime, RuntimeConfig};
use worker_core::server::build_app;

use fno_protocol::job::Action;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,worker_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let worker_id = format!("worker-{}", Uuid::new_v4());
    tracing::info!(worker_id = %worker_id, "Starting RPA worker");

    let config = Config::from_env().context("Failed to load configuration")?;

    let mut registry = AutomationRegistry::new();
    // Real portal automations register here from their own crates. The
    // mock serves smoke environments where no portal is reachable.
    for provider in &config.mock_providers {
        registry.register(
            *provider,
            Action::Validation,
            Arc::new(MockAutomation::succeeding()),
        );
        registry.register(
            *provider,
            Action::Cancellation,
            Arc::new(MockAutomation::succeeding()),
        );
    }
    if registry.providers().is_empty() {
        tracing::warn!("no automations registered; this worker will advertise no providers");
    } else {
        tracing::info!(providers = ?registry.providers(), "registered automations");
    }

    let runtime = ExecutionRuntime::new(
        Arc::new(registry),
        RuntimeConfig {
            max_concurrent: config.max_concurrent,
            job_timeout: config.job_timeout,
            result_ttl: config.result_ttl,
        },
    );

    // Evict finished status-map entries past their TTL.
    {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let evicted = runtime.sweep_expired(chrono::Utc::now());
                if evicted > 0 {
                    tracing::debug!(evicted, "evicted expired job results");
                }
            }
        });
    }

    let app = build_app(runtime, config.allowed_ips.clone());
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting worker server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received shutdown signal");
    })
    .await
    .context("Server error")?;

    Ok(())
}
