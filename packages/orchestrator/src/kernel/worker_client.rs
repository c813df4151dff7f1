//! HTTP client for the worker API.
//!
//! The [`WorkerApi`] trait keeps the dispatcher and poller testable against
//! scripted workers; [`HttpWorkerClient`] is the production implementation.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use fno_protocol::wire::{ExecuteRequest, StatusResponse, WorkerCapabilities, WorkerHealth};

/// Outcome of a dispatch attempt that reached the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchReply {
    Accepted,
    /// Worker refused with `503`; backpressure, not a failure.
    Refused { retry_after_secs: Option<u64> },
}

#[async_trait]
pub trait WorkerApi: Send + Sync {
    /// `POST {endpoint}/execute`. Transport and non-503 errors come back as
    /// `Err`; those count toward the worker's failure threshold.
    async fn dispatch(&self, endpoint: &str, request: &ExecuteRequest) -> Result<DispatchReply>;

    /// `GET {endpoint}/status/{job_id}`. A 404 maps to
    /// [`StatusResponse::not_found`].
    async fn job_status(&self, endpoint: &str, job_id: i64) -> Result<StatusResponse>;

    /// `GET {endpoint}/health`.
    async fn health(&self, endpoint: &str) -> Result<WorkerHealth>;

    /// `GET {endpoint}/status`.
    async fn capabilities(&self, endpoint: &str) -> Result<WorkerCapabilities>;
}

pub struct HttpWorkerClient {
    client: Client,
}

impl HttpWorkerClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build worker HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WorkerApi for HttpWorkerClient {
    async fn dispatch(&self, endpoint: &str, request: &ExecuteRequest) -> Result<DispatchReply> {
        let url = format!("{}/execute", endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .with_context(|| format!("dispatch to {url} failed"))?;

        let status = response.status();
        if status.is_success() {
            return Ok(DispatchReply::Accepted);
        }
        if status == StatusCode::SERVICE_UNAVAILABLE {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Ok(DispatchReply::Refused { retry_after_secs });
        }
        anyhow::bail!("worker {endpoint} rejected dispatch with {status}")
    }

    async fn job_status(&self, endpoint: &str, job_id: i64) -> Result<StatusResponse> {
        let url = format!("{}/status/{job_id}", endpoint.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("status poll of {url} failed"))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(StatusResponse::not_found());
        }
        let response = response
            .error_for_status()
            .with_context(|| format!("status poll of {url} returned an error"))?;
        let body = response
            .json::<StatusResponse>()
            .await
            .with_context(|| format!("invalid status body from {url}"))?;
        Ok(body)
    }

    async fn health(&self, endpoint: &str) -> Result<WorkerHealth> {
        let url = format!("{}/health", endpoint.trim_end_matches('/'));
        let body = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("health probe of {url} failed"))?
            .json::<WorkerHealth>()
            .await
            .with_context(|| format!("invalid health body from {url}"))?;
        Ok(body)
    }

    async fn capabilities(&self, endpoint: &str) -> Result<WorkerCapabilities> {
        let url = format!("{}/status", endpoint.trim_end_matches('/'));
        let body = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("capability probe of {url} failed"))?
            .json::<WorkerCapabilities>()
            .await
            .with_context(|| format!("invalid capability body from {url}"))?;
        Ok(body)
    }
}
