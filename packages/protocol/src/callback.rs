//! Upstream callback payload and the business-status mapping table.
//!
//! The upstream ingest endpoint consumes a flat JSON body whose `STATUS`
//! field comes from a closed set of business strings and whose `JOB_EVI`
//! field is a JSON-encoded *string* (the consumer unwraps it). Timestamps
//! are rendered in South African local time.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Africa::Johannesburg;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::job::{Action, ErrorKind, Provider};

/// Upstream timestamp format, rendered in Africa/Johannesburg.
pub const STATUS_DT_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// Default ceiling on the serialized `JOB_EVI` string.
pub const DEFAULT_EVIDENCE_LIMIT: usize = 1024 * 1024;

/// Wire body POSTed to the upstream ingest endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackBody {
    #[serde(rename = "JOB_ID")]
    pub job_id: String,
    #[serde(rename = "FNO")]
    pub fno: String,
    #[serde(rename = "STATUS")]
    pub status: String,
    #[serde(rename = "STATUS_DT")]
    pub status_dt: String,
    #[serde(rename = "JOB_EVI")]
    pub job_evi: String,
}

/// Closed set of business statuses the upstream system accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusinessStatus {
    Validated,
    NotFound,
    CancellationPending,
    AlreadyCancelled,
    DeleteReleased,
    ValidationError,
    ValidationAuthError,
    CancellationError,
    CancellationAuthError,
}

impl BusinessStatus {
    pub const ALL: [BusinessStatus; 9] = [
        BusinessStatus::Validated,
        BusinessStatus::NotFound,
        BusinessStatus::CancellationPending,
        BusinessStatus::AlreadyCancelled,
        BusinessStatus::DeleteReleased,
        BusinessStatus::ValidationError,
        BusinessStatus::ValidationAuthError,
        BusinessStatus::CancellationError,
        BusinessStatus::CancellationAuthError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BusinessStatus::Validated => "Bitstream Validated",
            BusinessStatus::NotFound => "Bitstream Not Found",
            BusinessStatus::CancellationPending => "Bitstream Cancellation Pending",
            BusinessStatus::AlreadyCancelled => "Bitstream Already Cancelled",
            BusinessStatus::DeleteReleased => "Bitstream Delete Released",
            BusinessStatus::ValidationError => "Bitstream Validation Error",
            BusinessStatus::ValidationAuthError => "Bitstream Validation Auth Error",
            BusinessStatus::CancellationError => "Bitstream Cancellation Error",
            BusinessStatus::CancellationAuthError => "Bitstream Cancellation Auth Error",
        }
    }
}

impl fmt::Display for BusinessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BusinessStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BusinessStatus::ALL
            .into_iter()
            .find(|b| b.as_str() == s)
            .ok_or_else(|| format!("unknown business status: {s}"))
    }
}

/// Terminal job view fed into the mapping table.
#[derive(Debug, Clone)]
pub enum TerminalOutcome<'a> {
    Completed { details: &'a Map<String, Value> },
    Failed { kind: ErrorKind },
}

/// Map a terminal job outcome to its upstream business status.
///
/// A lookup by `(action, outcome class)` with two conditional overrides on
/// cancellation success: a cease still pending on the portal side, and a
/// cease the portal had already implemented.
pub fn business_status(action: Action, outcome: &TerminalOutcome<'_>) -> BusinessStatus {
    match (action, outcome) {
        (Action::Validation, TerminalOutcome::Completed { .. }) => BusinessStatus::Validated,
        (Action::Cancellation, TerminalOutcome::Completed { details }) => {
            if truthy(details, "pending_cease") {
                BusinessStatus::CancellationPending
            } else if truthy(details, "already_cancelled") {
                BusinessStatus::AlreadyCancelled
            } else {
                BusinessStatus::DeleteReleased
            }
        }
        (_, TerminalOutcome::Failed { kind: ErrorKind::NotFound }) => BusinessStatus::NotFound,
        (Action::Validation, TerminalOutcome::Failed { kind: ErrorKind::AuthError }) => {
            BusinessStatus::ValidationAuthError
        }
        (Action::Cancellation, TerminalOutcome::Failed { kind: ErrorKind::AuthError }) => {
            BusinessStatus::CancellationAuthError
        }
        (Action::Validation, TerminalOutcome::Failed { .. }) => BusinessStatus::ValidationError,
        (Action::Cancellation, TerminalOutcome::Failed { .. }) => BusinessStatus::CancellationError,
    }
}

fn truthy(details: &Map<String, Value>, key: &str) -> bool {
    match details.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Flatten an evidence map to string values.
///
/// Booleans and numbers are stringified, null and empty values are
/// omitted, and nested structures are serialized in place.
pub fn flatten_evidence(details: &Map<String, Value>) -> BTreeMap<String, String> {
    let mut flat = BTreeMap::new();
    for (key, value) in details {
        let rendered = match value {
            Value::Null => continue,
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => {
                if s.is_empty() {
                    continue;
                }
                s.clone()
            }
            Value::Array(a) => {
                if a.is_empty() {
                    continue;
                }
                serde_json::to_string(a).unwrap_or_default()
            }
            Value::Object(o) => {
                if o.is_empty() {
                    continue;
                }
                serde_json::to_string(o).unwrap_or_default()
            }
        };
        flat.insert(key.clone(), rendered);
    }
    flat
}

/// Serialize a flattened evidence map to the `JOB_EVI` string, truncating
/// the largest values until the result fits within `limit` bytes. When
/// anything is cut, a `truncated=true` marker is added.
pub fn encode_evidence(evidence: &BTreeMap<String, String>, limit: usize) -> String {
    let mut working = evidence.clone();

    loop {
        let encoded = serde_json::to_string(&working).unwrap_or_else(|_| "{}".to_string());
        if encoded.len() <= limit {
            return encoded;
        }

        working.insert("truncated".to_string(), "true".to_string());

        let longest = working
            .iter()
            .filter(|(k, _)| k.as_str() != "truncated")
            .max_by_key(|(_, v)| v.len())
            .map(|(k, _)| k.clone());

        match longest {
            Some(key) => {
                let value = working.get_mut(&key).expect("key taken from the same map");
                if value.len() <= 16 {
                    // Every remaining value is tiny; drop entries instead.
                    working.remove(&key);
                } else {
                    let keep = value.len() / 2;
                    let mut cut = value.chars().take(keep).collect::<String>();
                    cut.push('…');
                    *value = cut;
                }
            }
            None => {
                // Nothing left to shrink.
                return serde_json::to_string(&working).unwrap_or_else(|_| "{}".to_string());
            }
        }
    }
}

/// Render an upstream timestamp in South African local time.
pub fn format_status_dt(at: DateTime<Utc>) -> String {
    at.with_timezone(&Johannesburg)
        .format(STATUS_DT_FORMAT)
        .to_string()
}

impl CallbackBody {
    /// Assemble a callback body for a terminal job.
    pub fn assemble(
        external_id: &str,
        provider: Provider,
        action: Action,
        outcome: &TerminalOutcome<'_>,
        details: &Map<String, Value>,
        completed_at: DateTime<Utc>,
        evidence_limit: usize,
    ) -> Self {
        let status = business_status(action, outcome);

        let mut flat = flatten_evidence(details);
        if let TerminalOutcome::Failed { kind } = outcome {
            // Preserve the raw kind for diagnostics even though STATUS is
            // a business string.
            flat.insert("error_kind".to_string(), kind.as_str().to_string());
        }

        Self {
            job_id: external_id.to_string(),
            fno: provider.fno_code().to_string(),
            status: status.as_str().to_string(),
            status_dt: format_status_dt(completed_at),
            job_evi: encode_evidence(&flat, evidence_limit),
        }
    }
}
