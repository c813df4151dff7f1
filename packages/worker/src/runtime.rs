//! Execution runtime: concurrent job acceptance with a capacity cap and a
//! per-job status map.
//!
//! Accepting a job never blocks the HTTP handler: admission records the job
//! as running, bumps the load counter, and spawns the execution task.
//! Admission happens under the status-map lock so the capacity check and
//! the insert are atomic; the counter comes down after execution terminates
//! on any path, including panic and timeout, so capacity cannot leak.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use fno_protocol::job::{AutomationError, AutomationOutcome, ErrorKind};
use fno_protocol::wire::{
    ExecuteRequest, ExecutionStatus, StatusResponse, WorkerCapabilities, WorkerHealth,
};

use crate::automation::AutomationRegistry;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub max_concurrent: u32,
    pub job_timeout: Duration,
    pub result_ttl: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            job_timeout: Duration::from_secs(900),
            result_ttl: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
struct ExecutionRecord {
    status: ExecutionStatus,
    result: Option<AutomationOutcome>,
    error: Option<AutomationError>,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    fn to_response(&self) -> StatusResponse {
        StatusResponse {
            status: self.status,
            result: self.result.clone(),
            error: self.error.clone(),
            start_time: Some(self.start_time),
            end_time: self.end_time,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    #[error("worker at capacity")]
    AtCapacity,
}

pub struct ExecutionRuntime {
    registry: Arc<AutomationRegistry>,
    jobs: Mutex<HashMap<i64, ExecutionRecord>>,
    active: AtomicU32,
    config: RuntimeConfig,
}

impl ExecutionRuntime {
    pub fn new(registry: Arc<AutomationRegistry>, config: RuntimeConfig) -> Arc<Self> {
        Arc::new(Self {
            registry,
            jobs: Mutex::new(HashMap::new()),
            active: AtomicU32::new(0),
            config,
        })
    }

    /// Accept a dispatch or refuse it at capacity. On acceptance the job is
    /// visible as `running` in the status map before this returns, and the
    /// execution proceeds on its own task.
    pub fn try_accept(self: &Arc<Self>, request: ExecuteRequest) -> Result<(), AcceptError> {
        {
            let mut jobs = self.jobs.lock().expect("status map lock");

            // A re-dispatch of a job already running here is acknowledged,
            // not executed twice.
            if let Some(existing) = jobs.get(&request.job_id) {
                if existing.status == ExecutionStatus::Running {
                    return Ok(());
                }
            }

            if self.active.load(Ordering::SeqCst) >= self.config.max_concurrent {
                return Err(AcceptError::AtCapacity);
            }

            jobs.insert(
                request.job_id,
                ExecutionRecord {
                    status: ExecutionStatus::Running,
                    result: None,
                    error: None,
                    start_time: Utc::now(),
                    end_time: None,
                },
            );
            self.active.fetch_add(1, Ordering::SeqCst);
        }

        info!(
            job_id = request.job_id,
            provider = %request.provider,
            action = %request.action,
            "accepted job"
        );

        let runtime = self.clone();
        tokio::spawn(async move {
            runtime.run_job(request).await;
        });
        Ok(())
    }

    async fn run_job(self: Arc<Self>, request: ExecuteRequest) {
        let job_id = request.job_id;
        let outcome = self.execute(&request).await;
        let now = Utc::now();

        {
            let mut jobs = self.jobs.lock().expect("status map lock");
            if let Some(record) = jobs.get_mut(&job_id) {
                record.end_time = Some(now);
                match outcome {
                    Ok(result) => {
                        record.status = ExecutionStatus::Completed;
                        record.result = Some(result);
                    }
                    Err(error) => {
                        warn!(job_id, kind = %error.kind, error = %error.message, "job failed");
                        record.status = ExecutionStatus::Failed;
                        record.error = Some(error);
                    }
                }
            }
        }

        // Terminated on some path above; the slot is free either way.
        self.active.fetch_sub(1, Ordering::SeqCst);
        info!(job_id, "job finished");
    }

    async fn execute(
        &self,
        request: &ExecuteRequest,
    ) -> Result<AutomationOutcome, AutomationError> {
        let Some(automation) = self.registry.get(request.provider, request.action) else {
            return Err(AutomationError::new(
                ErrorKind::ValidationError,
                format!(
                    "no automation registered for {} {}",
                    request.provider, request.action
                ),
            ));
        };

        let parameters = request.parameters.clone();
        let mut handle = tokio::spawn(async move { automation.run(&parameters).await });

        match tokio::time::timeout(self.config.job_timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                if join_error.is_panic() {
                    Err(AutomationError::new(
                        ErrorKind::SystemError,
                        "automation panicked",
                    ))
                } else {
                    Err(AutomationError::new(
                        ErrorKind::SystemError,
                        "automation task aborted",
                    ))
                }
            }
            Err(_elapsed) => {
                // Kill the browser session; the budget is spent.
                handle.abort();
                Err(AutomationError::new(
                    ErrorKind::TimeoutError,
                    format!(
                        "automation exceeded its {}s budget",
                        self.config.job_timeout.as_secs()
                    ),
                ))
            }
        }
    }

    /// Status-map lookup for the poller.
    pub fn status(&self, job_id: i64) -> StatusResponse {
        let jobs = self.jobs.lock().expect("status map lock");
        jobs.get(&job_id)
            .map(|record| record.to_response())
            .unwrap_or_else(StatusResponse::not_found)
    }

    /// Evict finished entries older than the result TTL. Returns the number
    /// of evicted entries.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let ttl = match chrono::Duration::from_std(self.config.result_ttl) {
            Ok(ttl) => ttl,
            Err(_) => return 0,
        };
        let mut jobs = self.jobs.lock().expect("status map lock");
        let before = jobs.len();
        jobs.retain(|_, record| match record.end_time {
            Some(end) => end + ttl > now,
            None => true,
        });
        before - jobs.len()
    }

    pub fn active_jobs(&self) -> u32 {
        self.active.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> u32 {
        self.config.max_concurrent
    }

    pub fn result_ttl(&self) -> Duration {
        self.config.result_ttl
    }

    pub fn health(&self) -> WorkerHealth {
        WorkerHealth {
            status: "online".to_string(),
            active_jobs: self.active_jobs(),
            capacity: self.capacity(),
            timestamp: Utc::now(),
        }
    }

    pub fn capabilities(&self) -> WorkerCapabilities {
        WorkerCapabilities {
            automations: self.registry.keys(),
            providers: self.registry.providers(),
            active_jobs: self.active_jobs(),
            capacity: self.capacity(),
        }
    }
}
