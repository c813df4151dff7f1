//! Worker pool registry: configured endpoints, observed health, and load.
//!
//! The registry is the in-memory view the dispatcher selects workers from.
//! Health and capabilities come from the periodic probe; load is tracked
//! optimistically on dispatch and reconciled from health probes so a slow
//! poll cycle cannot over-commit a worker.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use fno_protocol::job::Provider;
use fno_protocol::wire::{WorkerCapabilities, WorkerHealth};

use crate::config::WorkerEndpoint;
use crate::kernel::store::WorkerSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealthState {
    Online,
    Degraded,
    Offline,
}

impl WorkerHealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerHealthState::Online => "online",
            WorkerHealthState::Degraded => "degraded",
            WorkerHealthState::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone)]
struct WorkerState {
    endpoint: String,
    capacity: u32,
    current_load: u32,
    health: WorkerHealthState,
    providers: Vec<Provider>,
    last_probe_at: Option<DateTime<Utc>>,
    consecutive_dispatch_failures: u32,
    consecutive_poll_failures: u32,
    total_dispatch_failures: u64,
}

/// A worker the dispatcher may hand a job to.
#[derive(Debug, Clone)]
pub struct DispatchTarget {
    pub endpoint: String,
    pub providers: Vec<Provider>,
}

/// Read-only view of one worker for metrics and persistence.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerView {
    pub endpoint: String,
    pub capacity: u32,
    pub current_load: u32,
    pub health: WorkerHealthState,
    pub providers: Vec<Provider>,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub total_dispatch_failures: u64,
}

pub struct WorkerRegistry {
    workers: RwLock<Vec<WorkerState>>,
    cursor: AtomicUsize,
    failure_threshold: u32,
}

impl WorkerRegistry {
    pub fn new(endpoints: &[WorkerEndpoint], failure_threshold: u32) -> Self {
        let workers = endpoints
            .iter()
            .map(|e| WorkerState {
                endpoint: e.endpoint.clone(),
                capacity: e.capacity,
                current_load: 0,
                // Workers start offline until the first probe confirms them.
                health: WorkerHealthState::Offline,
                providers: Vec::new(),
                last_probe_at: None,
                consecutive_dispatch_failures: 0,
                consecutive_poll_failures: 0,
                total_dispatch_failures: 0,
            })
            .collect();
        Self {
            workers: RwLock::new(workers),
            cursor: AtomicUsize::new(0),
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Online workers with spare capacity, rotated so repeated passes spread
    /// load round-robin. The rotation is stable across invocations.
    pub async fn dispatch_candidates(&self) -> Vec<DispatchTarget> {
        let workers = self.workers.read().await;
        let eligible: Vec<&WorkerState> = workers
            .iter()
            .filter(|w| {
                w.health == WorkerHealthState::Online
                    && w.current_load < w.capacity
                    && !w.providers.is_empty()
            })
            .collect();

        if eligible.is_empty() {
            return Vec::new();
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % eligible.len();
        (0..eligible.len())
            .map(|i| {
                let w = eligible[(start + i) % eligible.len()];
                DispatchTarget {
                    endpoint: w.endpoint.clone(),
                    providers: w.providers.clone(),
                }
            })
            .collect()
    }

    pub async fn record_dispatch_success(&self, endpoint: &str) {
        let mut workers = self.workers.write().await;
        if let Some(w) = workers.iter_mut().find(|w| w.endpoint == endpoint) {
            w.consecutive_dispatch_failures = 0;
            w.current_load += 1;
        }
    }

    /// Count a dispatch transport failure; after the configured threshold
    /// the worker is marked degraded and drops out of candidate selection.
    pub async fn record_dispatch_failure(&self, endpoint: &str) {
        let mut workers = self.workers.write().await;
        if let Some(w) = workers.iter_mut().find(|w| w.endpoint == endpoint) {
            w.consecutive_dispatch_failures += 1;
            w.total_dispatch_failures += 1;
            if w.consecutive_dispatch_failures >= self.failure_threshold
                && w.health == WorkerHealthState::Online
            {
                warn!(
                    endpoint = %endpoint,
                    failures = w.consecutive_dispatch_failures,
                    "worker degraded after consecutive dispatch failures"
                );
                w.health = WorkerHealthState::Degraded;
            }
        }
    }

    pub async fn record_poll_result(&self, endpoint: &str, ok: bool) {
        let mut workers = self.workers.write().await;
        if let Some(w) = workers.iter_mut().find(|w| w.endpoint == endpoint) {
            if ok {
                w.consecutive_poll_failures = 0;
            } else {
                w.consecutive_poll_failures += 1;
                if w.consecutive_poll_failures >= self.failure_threshold
                    && w.health == WorkerHealthState::Online
                {
                    warn!(
                        endpoint = %endpoint,
                        failures = w.consecutive_poll_failures,
                        "worker degraded after consecutive status-poll failures"
                    );
                    w.health = WorkerHealthState::Degraded;
                }
            }
        }
    }

    /// A job on this worker reached a terminal state; free a slot.
    pub async fn note_job_finished(&self, endpoint: &str) {
        let mut workers = self.workers.write().await;
        if let Some(w) = workers.iter_mut().find(|w| w.endpoint == endpoint) {
            w.current_load = w.current_load.saturating_sub(1);
        }
    }

    /// Apply the result of a health + capability probe.
    pub async fn apply_probe(
        &self,
        endpoint: &str,
        now: DateTime<Utc>,
        health: Option<&WorkerHealth>,
        capabilities: Option<&WorkerCapabilities>,
    ) {
        let mut workers = self.workers.write().await;
        let Some(w) = workers.iter_mut().find(|w| w.endpoint == endpoint) else {
            return;
        };
        w.last_probe_at = Some(now);

        match health {
            Some(health) => {
                let was = w.health;
                w.health = WorkerHealthState::Online;
                w.current_load = health.active_jobs;
                w.capacity = health.capacity;
                w.consecutive_dispatch_failures = 0;
                w.consecutive_poll_failures = 0;
                if was != WorkerHealthState::Online {
                    info!(endpoint = %endpoint, "worker back online");
                }
            }
            None => {
                if w.health != WorkerHealthState::Offline {
                    warn!(endpoint = %endpoint, "worker offline: health probe failed");
                }
                w.health = WorkerHealthState::Offline;
            }
        }

        if let Some(caps) = capabilities {
            w.providers = caps.providers.clone();
        }
    }

    pub async fn views(&self) -> Vec<WorkerView> {
        let workers = self.workers.read().await;
        workers
            .iter()
            .map(|w| WorkerView {
                endpoint: w.endpoint.clone(),
                capacity: w.capacity,
                current_load: w.current_load,
                health: w.health,
                providers: w.providers.clone(),
                last_probe_at: w.last_probe_at,
                total_dispatch_failures: w.total_dispatch_failures,
            })
            .collect()
    }

    /// endpoint → health string, for metrics samples.
    pub async fn health_map(&self) -> BTreeMap<String, String> {
        let workers = self.workers.read().await;
        workers
            .iter()
            .map(|w| (w.endpoint.clone(), w.health.as_str().to_string()))
            .collect()
    }

    /// Snapshots for the `workers` table.
    pub async fn snapshots(&self) -> Vec<WorkerSnapshot> {
        let workers = self.workers.read().await;
        workers
            .iter()
            .map(|w| WorkerSnapshot {
                endpoint: w.endpoint.clone(),
                capacity: w.capacity as i32,
                current_load: w.current_load as i32,
                health: w.health.as_str().to_string(),
                providers: w.providers.iter().map(|p| p.as_str().to_string()).collect(),
                last_probe_at: w.last_probe_at,
            })
            .collect()
    }

    #[cfg(test)]
    pub async fn force_online(&self, endpoint: &str, providers: Vec<Provider>) {
        let mut workers = self.workers.write().await;
        if let Some(w) = workers.iter_mut().find(|w| w.endpoint == endpoint) {
            w.health = WorkerHealthState::Online;
            w.providers = providers;
        }
    }
}
