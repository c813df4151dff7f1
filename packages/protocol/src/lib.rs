//! Shared types for the fibre RPA control plane.
//!
//! This crate defines everything the orchestrator and the workers must agree
//! on without either depending on the other:
//!
//! - [`job`] - providers, actions, error kinds, job parameters and results
//! - [`wire`] - the orchestrator↔worker HTTP protocol bodies
//! - [`callback`] - the upstream callback payload and the business-status
//!   mapping table
//! - [`backoff`] - the retry backoff calculator
//!
//! The crate is pure types and pure functions; all I/O lives in the
//! orchestrator and worker packages.

pub mod backoff;
pub mod callback;
pub mod job;
pub mod wire;

pub use backoff::Backoff;
pub use callback::{business_status, BusinessStatus, CallbackBody, TerminalOutcome};
pub use job::{
    Action, AutomationError, AutomationOutcome, ErrorKind, EvidenceCapture, JobParameters,
    JobResultRecord, Provider,
};
pub use wire::{
    ExecuteAccepted, ExecuteRequest, ExecutionStatus, StatusResponse, WorkerCapabilities,
    WorkerHealth,
};
