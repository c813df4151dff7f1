//! Rolling metrics: a bounded ring of periodic snapshots plus a current view.
//!
//! Samples are produced by the scheduler's metrics task; HTTP handlers only
//! ever read. At the default five-minute cadence the 288-slot ring holds a
//! day of history.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

/// Default ring capacity: 24h of 5-minute samples.
pub const DEFAULT_RING_CAPACITY: usize = 288;

/// One periodic snapshot of queue depth and worker health.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSample {
    pub sampled_at: DateTime<Utc>,
    pub pending: i64,
    pub dispatching: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead: i64,
    pub callbacks_failed: i64,
    /// endpoint → health string.
    pub workers: BTreeMap<String, String>,
}

/// Averages over the retained window.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricsAverages {
    pub pending: f64,
    pub running: f64,
    pub samples: usize,
}

pub struct MetricsCollector {
    ring: RwLock<VecDeque<MetricsSample>>,
    capacity: usize,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

impl MetricsCollector {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub async fn record(&self, sample: MetricsSample) {
        let mut ring = self.ring.write().await;
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(sample);
    }

    pub async fn current(&self) -> Option<MetricsSample> {
        self.ring.read().await.back().cloned()
    }

    pub async fn history(&self) -> Vec<MetricsSample> {
        self.ring.read().await.iter().cloned().collect()
    }

    pub async fn averages(&self) -> MetricsAverages {
        let ring = self.ring.read().await;
        let samples = ring.len();
        if samples == 0 {
            return MetricsAverages {
                pending: 0.0,
                running: 0.0,
                samples: 0,
            };
        }
        let (pending_sum, running_sum) = ring
            .iter()
            .fold((0i64, 0i64), |(p, r), s| (p + s.pending, r + s.running));
        MetricsAverages {
            pending: pending_sum as f64 / samples as f64,
            running: running_sum as f64 / samples as f64,
            samples,
        }
    }
}
