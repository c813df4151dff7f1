// Orchestrator entry point.
//
// Exit codes: 0 clean shutdown, 1 startup failure, 2 configuration error.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use orchestrator_core::config::Config;
use orchestrator_core::kernel::store::{JobStore, PgJobStore};
use orchestrator_core::kernel::worker_client::{HttpWorkerClient, WorkerApi};
use orchestrator_core::kernel::build_deps;
use orchestrator_core::server::build_app;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,orchestrator_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting RPA orchestrator");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "configuration error");
            return ExitCode::from(2);
        }
    };

    match run(config).await {
        Ok(()) => {
            tracing::info!("orchestrator stopped cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "startup failure");
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> Result<()> {
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool));
    let worker_api: Arc<dyn WorkerApi> = Arc::new(
        HttpWorkerClient::new(config.http_timeout).context("Failed to build worker client")?,
    );

    let shutdown = CancellationToken::new();
    let deps = build_deps(&config, store, worker_api, shutdown.clone())
        .context("Failed to wire orchestrator components")?;

    deps.scheduler
        .start()
        .await
        .context("Failed to start scheduler")?;

    let app = build_app(deps.clone());
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received shutdown signal");
        })
        .await
        .context("Server error")?;

    // Drain: stop the task loops, give in-flight runs their grace period,
    // then push out any callbacks that are ready. Jobs left in `running`
    // are recovered by the next instance's stale sweep.
    shutdown.cancel();
    deps.scheduler.shutdown(config.shutdown_grace).await;
    if let Err(e) = deps.reporter.flush().await {
        tracing::warn!(error = %e, "final callback flush failed");
    }

    Ok(())
}
