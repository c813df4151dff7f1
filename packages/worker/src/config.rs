use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

use fno_protocol::job::Provider;

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Max concurrent automations.
    pub max_concurrent: u32,
    /// Wall-clock budget per automation.
    pub job_timeout: Duration,
    /// How long a finished status-map entry stays readable.
    pub result_ttl: Duration,
    /// Orchestrator addresses allowed to call this worker. Empty list
    /// disables the check (development).
    pub allowed_ips: Vec<IpAddr>,
    /// Providers to serve with the built-in mock automation. Intended for
    /// smoke environments; production deployments register real portal
    /// automations instead.
    pub mock_providers: Vec<Provider>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            port: parsed_or("WORKER_PORT", 8081)?,
            max_concurrent: parsed_or("WORKER_MAX_CONCURRENT", 5)?,
            job_timeout: Duration::from_secs(parsed_or("WORKER_JOB_TIMEOUT_SECS", 900)?),
            result_ttl: Duration::from_secs(parsed_or("WORKER_RESULT_TTL_SECS", 600)?),
            allowed_ips: parse_allowed_ips(&env::var("WORKER_ALLOWED_IPS").unwrap_or_default())?,
            mock_providers: parse_providers(
                &env::var("WORKER_MOCK_PROVIDERS").unwrap_or_default(),
            )?,
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

pub fn parse_allowed_ips(raw: &str) -> Result<Vec<IpAddr>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .with_context(|| format!("invalid IP in WORKER_ALLOWED_IPS: {s:?}"))
        })
        .collect()
}

pub fn parse_providers(raw: &str) -> Result<Vec<Provider>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .with_context(|| format!("invalid provider in WORKER_MOCK_PROVIDERS: {s:?}"))
        })
        .collect()
}
