//! Orchestrator kernel: scheduling engine, worker pool, and persistence.
//!
//! ```text
//! Scheduler
//!     ├─► QueueDispatcher ──► WorkerApi (POST /execute)
//!     ├─► StatusPoller ─────► WorkerApi (GET /status/{id}) ─► OutcomeApplier
//!     ├─► RecoveryEngine ───► stale probe + lost-heartbeat fail
//!     ├─► CallbackReporter ─► upstream POST
//!     ├─► probe_workers ────► WorkerRegistry health
//!     └─► collect_sample ───► MetricsCollector ring
//!
//! JobStore is the single coordination point; every transition is a CAS.
//! ```

pub mod callback;
pub mod deps;
pub mod dispatch;
pub mod evidence;
pub mod metrics;
pub mod outcome;
pub mod poller;
pub mod recovery;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod worker_client;

pub use deps::{build_deps, OrchestratorDeps};
