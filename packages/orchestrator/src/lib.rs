//! Orchestrator for the fibre RPA control plane.
//!
//! Dispatches browser-automation jobs to a pool of remote workers, tracks
//! their lifecycle through a CAS-based state machine, retries failures,
//! collects evidence, and reports terminal outcomes upstream.

pub mod config;
pub mod kernel;
pub mod server;

pub use config::Config;
