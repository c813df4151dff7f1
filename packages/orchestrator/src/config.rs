use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use std::env;

/// One configured worker endpoint with its concurrency capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEndpoint {
    pub endpoint: String,
    pub capacity: u32,
}

/// Orchestrator configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,

    /// Upstream enterprise endpoint receiving terminal job callbacks.
    pub upstream_callback_url: String,

    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub token_ttl_secs: u64,
    pub admin_username: String,
    pub admin_password: String,

    /// Static worker pool: `http://host:port=capacity,...`
    pub worker_endpoints: Vec<WorkerEndpoint>,

    pub poll_interval: Duration,
    pub status_poll_interval: Duration,
    pub recover_interval: Duration,
    pub metrics_interval: Duration,
    pub health_probe_interval: Duration,
    pub callback_flush_interval: Duration,
    /// Six-field cron expression for the daily evidence sweep.
    pub eviction_cron: String,

    pub stale_threshold: Duration,
    pub lost_threshold: Duration,
    pub dispatch_backoff: Duration,
    pub worker_failure_threshold: u32,
    pub http_timeout: Duration,
    pub callback_max_attempts: i32,
    pub evidence_retention_days: i64,
    pub evidence_body_limit: usize,
    pub shutdown_grace: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: parsed_or("PORT", 8080)?,
            upstream_callback_url: env::var("UPSTREAM_CALLBACK_URL")
                .context("UPSTREAM_CALLBACK_URL must be set")?,
            jwt_secret: env::var("JWT_SECRET").context("JWT_SECRET must be set")?,
            jwt_issuer: env::var("JWT_ISSUER").unwrap_or_else(|_| "rpa-orchestrator".to_string()),
            token_ttl_secs: parsed_or("TOKEN_TTL_SECS", 3600)?,
            admin_username: env::var("ADMIN_USERNAME").context("ADMIN_USERNAME must be set")?,
            admin_password: env::var("ADMIN_PASSWORD").context("ADMIN_PASSWORD must be set")?,
            worker_endpoints: parse_worker_endpoints(
                &env::var("WORKER_ENDPOINTS").unwrap_or_default(),
            )?,
            poll_interval: secs_or("POLL_INTERVAL_SECS", 30)?,
            status_poll_interval: secs_or("STATUS_POLL_INTERVAL_SECS", 30)?,
            recover_interval: secs_or("RECOVER_INTERVAL_SECS", 600)?,
            metrics_interval: secs_or("METRICS_INTERVAL_SECS", 300)?,
            health_probe_interval: secs_or("HEALTH_PROBE_INTERVAL_SECS", 60)?,
            callback_flush_interval: secs_or("CALLBACK_FLUSH_INTERVAL_SECS", 30)?,
            eviction_cron: env::var("EVIDENCE_EVICTION_CRON")
                .unwrap_or_else(|_| "0 0 2 * * *".to_string()),
            stale_threshold: secs_or("STALE_THRESHOLD_SECS", 1800)?,
            lost_threshold: secs_or("LOST_THRESHOLD_SECS", 1800)?,
            dispatch_backoff: secs_or("DISPATCH_BACKOFF_SECS", 60)?,
            worker_failure_threshold: parsed_or("WORKER_FAILURE_THRESHOLD", 3)?,
            http_timeout: secs_or("HTTP_TIMEOUT_SECS", 30)?,
            callback_max_attempts: parsed_or("CALLBACK_MAX_ATTEMPTS", 5)?,
            evidence_retention_days: parsed_or("EVIDENCE_RETENTION_DAYS", 30)?,
            evidence_body_limit: parsed_or("EVIDENCE_BODY_LIMIT_BYTES", 1024 * 1024)?,
            shutdown_grace: secs_or("SHUTDOWN_GRACE_SECS", 30)?,
        })
    }
}

fn parsed_or<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{name} must be a valid value, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn secs_or(name: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_secs(parsed_or(name, default)?))
}

/// Parse `http://host:port=capacity,http://host:port` (capacity defaults
/// to 5 when omitted).
pub fn parse_worker_endpoints(raw: &str) -> Result<Vec<WorkerEndpoint>> {
    let mut endpoints = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (endpoint, capacity) = match entry.rsplit_once('=') {
            Some((url, cap)) => {
                let capacity: u32 = cap
                    .parse()
                    .with_context(|| format!("invalid worker capacity in {entry:?}"))?;
                (url.trim().to_string(), capacity)
            }
            None => (entry.to_string(), 5),
        };
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            bail!("worker endpoint must be an http(s) URL: {endpoint:?}");
        }
        if capacity == 0 {
            bail!("worker capacity must be at least 1: {entry:?}");
        }
        endpoints.push(WorkerEndpoint { endpoint, capacity });
    }
    Ok(endpoints)
}
