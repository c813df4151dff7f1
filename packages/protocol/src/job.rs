//! Job domain types: providers, actions, error kinds, parameters, results.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fibre network operator whose portal an automation drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(
    feature = "postgres",
    derive(sqlx::Type),
    sqlx(type_name = "provider", rename_all = "lowercase")
)]
pub enum Provider {
    Mfn,
    Osn,
    Octotel,
    Evotel,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::Mfn,
        Provider::Osn,
        Provider::Octotel,
        Provider::Evotel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Mfn => "mfn",
            Provider::Osn => "osn",
            Provider::Octotel => "octotel",
            Provider::Evotel => "evotel",
        }
    }

    /// Upstream FNO code used in callback payloads.
    pub fn fno_code(&self) -> &'static str {
        match self {
            Provider::Mfn => "MFN",
            Provider::Osn => "OSN",
            Provider::Octotel => "OCTOTEL",
            Provider::Evotel => "EVOTEL",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mfn" => Ok(Provider::Mfn),
            "osn" => Ok(Provider::Osn),
            "octotel" => Ok(Provider::Octotel),
            "evotel" => Ok(Provider::Evotel),
            _ => Err(UnknownVariant {
                kind: "provider",
                value: s.to_string(),
            }),
        }
    }
}

/// What the automation is asked to do against the portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(
    feature = "postgres",
    derive(sqlx::Type),
    sqlx(type_name = "action", rename_all = "lowercase")
)]
pub enum Action {
    Validation,
    Cancellation,
}

impl Action {
    pub const ALL: [Action; 2] = [Action::Validation, Action::Cancellation];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Validation => "validation",
            Action::Cancellation => "cancellation",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "validation" => Ok(Action::Validation),
            "cancellation" => Ok(Action::Cancellation),
            _ => Err(UnknownVariant {
                kind: "action",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Terminal failure classification.
///
/// Every failed automation run carries exactly one of these; the retry
/// engine keys its decision off [`ErrorKind::is_retryable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(
    feature = "postgres",
    derive(sqlx::Type),
    sqlx(type_name = "error_kind", rename_all = "snake_case")
)]
pub enum ErrorKind {
    /// Malformed parameters.
    ValidationError,
    /// Portal login failure; needs operator intervention.
    AuthError,
    /// Business outcome, not infrastructure.
    NotFound,
    /// Portal returned an error page.
    PortalError,
    /// Transport failure between worker and portal.
    NetworkError,
    /// Automation exceeded its wall-clock budget.
    TimeoutError,
    /// Driver crash, OOM, unexpected panic.
    SystemError,
    /// Orchestrator could not confirm the worker still has the job.
    LostHeartbeat,
    /// Explicit cancel via the admin API.
    CancelledByOperator,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::PortalError
                | ErrorKind::NetworkError
                | ErrorKind::TimeoutError
                | ErrorKind::SystemError
                | ErrorKind::LostHeartbeat
        )
    }

    /// Kind-specific ceiling on retries, where one applies.
    ///
    /// Timeouts get at most two retries: a job that burns its full
    /// wall-clock budget twice is unlikely to finish on a third pass.
    pub fn retry_cap(&self) -> Option<i32> {
        match self {
            ErrorKind::TimeoutError => Some(2),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::PortalError => "portal_error",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::TimeoutError => "timeout_error",
            ErrorKind::SystemError => "system_error",
            ErrorKind::LostHeartbeat => "lost_heartbeat",
            ErrorKind::CancelledByOperator => "cancelled_by_operator",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters handed to an automation.
///
/// `circuit_number` is required for every provider; the rest are optional
/// and provider-specific. Unknown fields from upstream are preserved in
/// `extra` so automations can read provider-only keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobParameters {
    pub circuit_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobParameters {
    pub fn new(circuit_number: impl Into<String>) -> Self {
        Self {
            circuit_number: circuit_number.into(),
            ..Default::default()
        }
    }
}

/// A screenshot or other artifact captured during an automation run.
///
/// `data` is base64 on the wire; the orchestrator decodes it to raw bytes
/// before persisting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceCapture {
    pub name: String,
    pub mime_type: String,
    pub captured_at: DateTime<Utc>,
    pub data: String,
}

/// Successful automation result returned by a worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutomationOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<EvidenceCapture>,
}

impl AutomationOutcome {
    /// The portion of the outcome persisted on the job row. Evidence
    /// payloads are stored separately; only their names are referenced.
    pub fn to_record(&self) -> JobResultRecord {
        JobResultRecord {
            message: self.message.clone(),
            details: self.details.clone(),
            evidence: self.evidence.iter().map(|e| e.name.clone()).collect(),
        }
    }
}

/// Failed automation result returned by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct AutomationError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AutomationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Result payload persisted on a completed job row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResultRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<String>,
}
