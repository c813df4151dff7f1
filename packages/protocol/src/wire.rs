//! Orchestrator↔worker HTTP protocol bodies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{Action, AutomationError, AutomationOutcome, JobParameters, Provider};

/// Body of `POST /execute` on a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub job_id: i64,
    pub provider: Provider,
    pub action: Action,
    pub parameters: JobParameters,
}

/// `202 Accepted` body for a dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteAccepted {
    pub job_id: i64,
    pub status: ExecutionStatus,
}

/// Worker-side view of a job's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    NotFound,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

/// Body of `GET /status/{job_id}` on a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AutomationOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AutomationError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl StatusResponse {
    pub fn not_found() -> Self {
        Self {
            status: ExecutionStatus::NotFound,
            result: None,
            error: None,
            start_time: None,
            end_time: None,
        }
    }
}

/// Body of `GET /health` on a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub status: String,
    pub active_jobs: u32,
    pub capacity: u32,
    pub timestamp: DateTime<Utc>,
}

/// One `(provider, action)` pair a worker can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomationKey {
    pub provider: Provider,
    pub action: Action,
}

/// Body of `GET /status` on a worker: capabilities plus load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    pub automations: Vec<AutomationKey>,
    pub providers: Vec<Provider>,
    pub active_jobs: u32,
    pub capacity: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_request_serializes_with_lowercase_enums() {
        let req = ExecuteRequest {
            job_id: 42,
            provider: Provider::Mfn,
            action: Action::Validation,
            parameters: JobParameters::new("FTTX047648"),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["provider"], "mfn");
        assert_eq!(json["action"], "validation");
        assert_eq!(json["parameters"]["circuit_number"], "FTTX047648");
    }

    #[test]
    fn status_response_omits_absent_fields() {
        let json = serde_json::to_value(StatusResponse::not_found()).unwrap();
        assert_eq!(json["status"], "not_found");
        assert!(json.get("result").is_none());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::NotFound.is_terminal());
    }
}
