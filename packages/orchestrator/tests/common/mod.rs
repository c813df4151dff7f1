//! Shared fixtures: an in-memory store plus a scripted worker API.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use fno_protocol::job::{Action, JobParameters, Provider};
use fno_protocol::wire::{
    ExecuteRequest, StatusResponse, WorkerCapabilities, WorkerHealth,
};

use orchestrator_core::config::WorkerEndpoint;
use orchestrator_core::kernel::registry::WorkerRegistry;
use orchestrator_core::kernel::store::{JobStore, NewJob};
use orchestrator_core::kernel::worker_client::{DispatchReply, WorkerApi};

/// Scripted reply for one dispatch attempt.
#[derive(Debug, Clone, Copy)]
pub enum DispatchScript {
    Accept,
    Refuse,
    TransportError,
}

/// Worker API double: replies follow per-endpoint scripts (defaulting to
/// accept) and per-job status sequences (repeating the last entry).
#[derive(Default)]
pub struct ScriptedWorkerApi {
    dispatch_scripts: Mutex<HashMap<String, VecDeque<DispatchScript>>>,
    pub dispatched: Mutex<Vec<(String, ExecuteRequest)>>,
    statuses: Mutex<HashMap<i64, VecDeque<StatusResponse>>>,
}

impl ScriptedWorkerApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_dispatch(&self, endpoint: &str, replies: Vec<DispatchScript>) {
        self.dispatch_scripts
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), replies.into());
    }

    pub fn script_status(&self, job_id: i64, responses: Vec<StatusResponse>) {
        self.statuses
            .lock()
            .unwrap()
            .insert(job_id, responses.into());
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatched.lock().unwrap().len()
    }

    pub fn dispatched_job_ids(&self) -> Vec<i64> {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .map(|(_, req)| req.job_id)
            .collect()
    }
}

#[async_trait]
impl WorkerApi for ScriptedWorkerApi {
    async fn dispatch(
        &self,
        endpoint: &str,
        request: &ExecuteRequest,
    ) -> anyhow::Result<DispatchReply> {
        let script = self
            .dispatch_scripts
            .lock()
            .unwrap()
            .get_mut(endpoint)
            .and_then(|q| q.pop_front())
            .unwrap_or(DispatchScript::Accept);

        match script {
            DispatchScript::Accept => {
                self.dispatched
                    .lock()
                    .unwrap()
                    .push((endpoint.to_string(), request.clone()));
                Ok(DispatchReply::Accepted)
            }
            DispatchScript::Refuse => Ok(DispatchReply::Refused {
                retry_after_secs: Some(30),
            }),
            DispatchScript::TransportError => anyhow::bail!("connection refused"),
        }
    }

    async fn job_status(&self, _endpoint: &str, job_id: i64) -> anyhow::Result<StatusResponse> {
        let mut statuses = self.statuses.lock().unwrap();
        match statuses.get_mut(&job_id) {
            Some(queue) => {
                if queue.len() > 1 {
                    Ok(queue.pop_front().expect("non-empty queue"))
                } else {
                    queue
                        .front()
                        .cloned()
                        .ok_or_else(|| anyhow::anyhow!("no status scripted"))
                }
            }
            None => Ok(StatusResponse::not_found()),
        }
    }

    async fn health(&self, _endpoint: &str) -> anyhow::Result<WorkerHealth> {
        Ok(WorkerHealth {
            status: "online".to_string(),
            active_jobs: 0,
            capacity: 5,
            timestamp: Utc::now(),
        })
    }

    async fn capabilities(&self, _endpoint: &str) -> anyhow::Result<WorkerCapabilities> {
        Ok(WorkerCapabilities {
            automations: Vec::new(),
            providers: vec![Provider::Mfn, Provider::Osn],
            active_jobs: 0,
            capacity: 5,
        })
    }
}

/// Registry with every endpoint probed online for the given providers.
pub async fn online_registry(
    endpoints: &[(&str, u32)],
    providers: &[Provider],
) -> Arc<WorkerRegistry> {
    let configured: Vec<WorkerEndpoint> = endpoints
        .iter()
        .map(|(endpoint, capacity)| WorkerEndpoint {
            endpoint: endpoint.to_string(),
            capacity: *capacity,
        })
        .collect();
    let registry = Arc::new(WorkerRegistry::new(&configured, 3));

    let now = Utc::now();
    for (endpoint, capacity) in endpoints {
        registry
            .apply_probe(
                endpoint,
                now,
                Some(&WorkerHealth {
                    status: "online".to_string(),
                    active_jobs: 0,
                    capacity: *capacity,
                    timestamp: now,
                }),
                Some(&WorkerCapabilities {
                    automations: Vec::new(),
                    providers: providers.to_vec(),
                    active_jobs: 0,
                    capacity: *capacity,
                }),
            )
            .await;
    }
    registry
}

/// Create a pending validation job and return its id.
pub async fn submit_job(
    store: &dyn JobStore,
    external_id: &str,
    provider: Provider,
    priority: i32,
) -> i64 {
    let new = NewJob::builder()
        .external_id(external_id)
        .provider(provider)
        .action(Action::Validation)
        .parameters(JobParameters::new("FTTX047648"))
        .priority(priority)
        .build();
    store.create_job(new).await.unwrap().job().id
}
