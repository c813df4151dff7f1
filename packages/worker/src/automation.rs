//! Automation registry.
//!
//! An automation is an opaque `(provider, action) → result` function that
//! drives a portal in a browser session. The registry maps capability keys
//! to implementations at startup; the runtime never switches on provider
//! strings. Real portal automations live in their own crates and register
//! themselves here; [`MockAutomation`] covers tests and smoke environments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use fno_protocol::job::{
    Action, AutomationError, AutomationOutcome, ErrorKind, JobParameters, Provider,
};
use fno_protocol::wire::AutomationKey;

pub type AutomationResult = Result<AutomationOutcome, AutomationError>;

/// One portal automation. Implementations own their browser session and
/// must map every internal failure to an [`AutomationError`]; raw errors
/// never cross this boundary.
#[async_trait]
pub trait Automation: Send + Sync {
    async fn run(&self, parameters: &JobParameters) -> AutomationResult;
}

/// Maps `(provider, action)` to automation implementations.
#[derive(Default)]
pub struct AutomationRegistry {
    automations: HashMap<(Provider, Action), Arc<dyn Automation>>,
}

impl AutomationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        provider: Provider,
        action: Action,
        automation: Arc<dyn Automation>,
    ) {
        self.automations.insert((provider, action), automation);
    }

    pub fn get(&self, provider: Provider, action: Action) -> Option<Arc<dyn Automation>> {
        self.automations.get(&(provider, action)).cloned()
    }

    pub fn is_registered(&self, provider: Provider, action: Action) -> bool {
        self.automations.contains_key(&(provider, action))
    }

    /// Advertised capability keys, stable order.
    pub fn keys(&self) -> Vec<AutomationKey> {
        let mut keys: Vec<AutomationKey> = self
            .automations
            .keys()
            .map(|(provider, action)| AutomationKey {
                provider: *provider,
                action: *action,
            })
            .collect();
        keys.sort_by_key(|k| (k.provider.as_str(), k.action.as_str()));
        keys
    }

    /// Distinct providers this worker can serve.
    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self
            .automations
            .keys()
            .map(|(provider, _)| *provider)
            .collect();
        providers.sort_by_key(|p| p.as_str());
        providers.dedup();
        providers
    }
}

// ============================================================================
// Mock automation
// ============================================================================

enum MockBehaviour {
    Fixed(AutomationResult),
    /// Pops results in order; repeats the last one when drained.
    Sequence(Mutex<Vec<AutomationResult>>),
}

/// Scripted automation for tests and smoke environments.
pub struct MockAutomation {
    behaviour: MockBehaviour,
    delay: Option<Duration>,
}

impl MockAutomation {
    /// Succeeds with an `evidence_found=true` detail map.
    pub fn succeeding() -> Self {
        let mut details = Map::new();
        details.insert("evidence_found".to_string(), Value::Bool(true));
        Self::with_outcome(AutomationOutcome {
            message: Some("mock automation succeeded".to_string()),
            details,
            evidence: Vec::new(),
        })
    }

    pub fn with_outcome(outcome: AutomationOutcome) -> Self {
        Self {
            behaviour: MockBehaviour::Fixed(Ok(outcome)),
            delay: None,
        }
    }

    pub fn failing(kind: ErrorKind, message: &str) -> Self {
        Self {
            behaviour: MockBehaviour::Fixed(Err(AutomationError::new(kind, message))),
            delay: None,
        }
    }

    /// Returns the given results in order, repeating the final one.
    pub fn sequence(results: Vec<AutomationResult>) -> Self {
        Self {
            behaviour: MockBehaviour::Sequence(Mutex::new(results)),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl Automation for MockAutomation {
    async fn run(&self, _parameters: &JobParameters) -> AutomationResult {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.behaviour {
            MockBehaviour::Fixed(result) => result.clone(),
            MockBehaviour::Sequence(results) => {
                let mut results = results.lock().expect("mock sequence lock");
                if results.len() > 1 {
                    results.remove(0)
                } else {
                    results
                        .first()
                        .cloned()
                        .unwrap_or_else(|| {
                            Err(AutomationError::new(
                                ErrorKind::SystemError,
                                "mock sequence exhausted",
                            ))
                        })
                }
            }
        }
    }
}
