//! Worker runtime for the fibre RPA control plane.
//!
//! Accepts dispatches from the orchestrator, runs portal automations up to
//! a configured concurrency cap, tracks per-job status, and serves results
//! back over HTTP until their TTL expires.

pub mod automation;
pub mod config;
pub mod runtime;
pub mod server;

pub use config::Config;
