//! Execution runtime behavior: capacity, status tracking, failure mapping.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use fno_protocol::job::{Action, ErrorKind, JobParameters, Provider};
use fno_protocol::wire::{ExecuteRequest, ExecutionStatus, StatusResponse};

use worker_core::automation::{
    Automation, AutomationRegistry, AutomationResult, MockAutomation,
};
use worker_core::runtime::{AcceptError, ExecutionRuntime, RuntimeConfig};

struct PanickingAutomation;

#[async_trait]
impl Automation for PanickingAutomation {
    async fn run(&self, _parameters: &JobParameters) -> AutomationResult {
        panic!("driver crashed");
    }
}

fn request(job_id: i64, provider: Provider) -> ExecuteRequest {
    ExecuteRequest {
        job_id,
        provider,
        action: Action::Validation,
        parameters: JobParameters::new("FTTX047648"),
    }
}

fn runtime_with(
    registry: AutomationRegistry,
    max_concurrent: u32,
    job_timeout: Duration,
) -> Arc<ExecutionRuntime> {
    ExecutionRuntime::new(
        Arc::new(registry),
        RuntimeConfig {
            max_concurrent,
            job_timeout,
            result_ttl: Duration::from_secs(600),
        },
    )
}

/// Poll the status map until the job leaves `running`.
async fn wait_for_terminal(runtime: &ExecutionRuntime, job_id: i64) -> StatusResponse {
    for _ in 0..200 {
        let status = runtime.status(job_id);
        if status.status != ExecutionStatus::Running {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {job_id} never left running");
}

#[tokio::test]
async fn accepted_job_runs_to_completion() {
    let mut registry = AutomationRegistry::new();
    registry.register(
        Provider::Mfn,
        Action::Validation,
        Arc::new(MockAutomation::succeeding()),
    );
    let runtime = runtime_with(registry, 2, Duration::from_secs(5));

    runtime.try_accept(request(1, Provider::Mfn)).unwrap();

    // Visible as running (or already finished) immediately after accept.
    assert_ne!(runtime.status(1).status, ExecutionStatus::NotFound);

    let status = wait_for_terminal(&runtime, 1).await;
    assert_eq!(status.status, ExecutionStatus::Completed);
    let result = status.result.unwrap();
    assert_eq!(
        result.details.get("evidence_found"),
        Some(&serde_json::Value::Bool(true))
    );
    assert!(status.start_time.is_some());
    assert!(status.end_time.is_some());
    assert_eq!(runtime.active_jobs(), 0);
}

#[tokio::test]
async fn third_dispatch_is_refused_at_capacity_two() {
    let mut registry = AutomationRegistry::new();
    registry.register(
        Provider::Mfn,
        Action::Validation,
        Arc::new(MockAutomation::succeeding().with_delay(Duration::from_millis(200))),
    );
    let runtime = runtime_with(registry, 2, Duration::from_secs(5));

    runtime.try_accept(request(1, Provider::Mfn)).unwrap();
    runtime.try_accept(request(2, Provider::Mfn)).unwrap();
    assert!(matches!(
        runtime.try_accept(request(3, Provider::Mfn)),
        Err(AcceptError::AtCapacity)
    ));
    assert_eq!(runtime.active_jobs(), 2);

    // Once a slot frees up the worker accepts again.
    wait_for_terminal(&runtime, 1).await;
    runtime.try_accept(request(3, Provider::Mfn)).unwrap();
}

#[tokio::test]
async fn duplicate_dispatch_of_a_running_job_is_acknowledged_once() {
    let mut registry = AutomationRegistry::new();
    registry.register(
        Provider::Mfn,
        Action::Validation,
        Arc::new(MockAutomation::succeeding().with_delay(Duration::from_millis(200))),
    );
    let runtime = runtime_with(registry, 2, Duration::from_secs(5));

    runtime.try_accept(request(1, Provider::Mfn)).unwrap();
    runtime.try_accept(request(1, Provider::Mfn)).unwrap();
    assert_eq!(runtime.active_jobs(), 1);
}

#[tokio::test]
async fn automation_failure_keeps_its_error_kind() {
    let mut registry = AutomationRegistry::new();
    registry.register(
        Provider::Osn,
        Action::Validation,
        Arc::new(MockAutomation::failing(
            ErrorKind::PortalError,
            "portal returned an error page",
        )),
    );
    let runtime = runtime_with(registry, 2, Duration::from_secs(5));

    runtime.try_accept(request(1, Provider::Osn)).unwrap();
    let status = wait_for_terminal(&runtime, 1).await;

    assert_eq!(status.status, ExecutionStatus::Failed);
    assert_eq!(status.error.unwrap().kind, ErrorKind::PortalError);
}

#[tokio::test]
async fn unregistered_capability_fails_as_validation_error() {
    let runtime = runtime_with(AutomationRegistry::new(), 2, Duration::from_secs(5));

    runtime.try_accept(request(1, Provider::Evotel)).unwrap();
    let status = wait_for_terminal(&runtime, 1).await;

    assert_eq!(status.status, ExecutionStatus::Failed);
    assert_eq!(status.error.unwrap().kind, ErrorKind::ValidationError);
}

#[tokio::test]
async fn panicking_automation_maps_to_system_error_and_frees_the_slot() {
    let mut registry = AutomationRegistry::new();
    registry.register(Provider::Mfn, Action::Validation, Arc::new(PanickingAutomation));
    let runtime = runtime_with(registry, 1, Duration::from_secs(5));

    runtime.try_accept(request(1, Provider::Mfn)).unwrap();
    let status = wait_for_terminal(&runtime, 1).await;

    assert_eq!(status.status, ExecutionStatus::Failed);
    assert_eq!(status.error.unwrap().kind, ErrorKind::SystemError);
    assert_eq!(runtime.active_jobs(), 0, "a panic must not leak capacity");

    // The slot is usable again.
    runtime.try_accept(request(2, Provider::Mfn)).unwrap();
}

#[tokio::test]
async fn overrunning_automation_is_cut_off_with_timeout_error() {
    let mut registry = AutomationRegistry::new();
    registry.register(
        Provider::Mfn,
        Action::Validation,
        Arc::new(MockAutomation::succeeding().with_delay(Duration::from_secs(30))),
    );
    let runtime = runtime_with(registry, 1, Duration::from_millis(50));

    runtime.try_accept(request(1, Provider::Mfn)).unwrap();
    let status = wait_for_terminal(&runtime, 1).await;

    assert_eq!(status.status, ExecutionStatus::Failed);
    assert_eq!(status.error.unwrap().kind, ErrorKind::TimeoutError);
    assert_eq!(runtime.active_jobs(), 0);
}

#[tokio::test]
async fn mock_sequence_drives_fail_fail_succeed() {
    let mut registry = AutomationRegistry::new();
    registry.register(
        Provider::Mfn,
        Action::Validation,
        Arc::new(MockAutomation::sequence(vec![
            Err(fno_protocol::job::AutomationError::new(
                ErrorKind::NetworkError,
                "flaky",
            )),
            Err(fno_protocol::job::AutomationError::new(
                ErrorKind::NetworkError,
                "flaky again",
            )),
            Ok(Default::default()),
        ])),
    );
    let runtime = runtime_with(registry, 1, Duration::from_secs(5));

    for (attempt, expected) in [
        ExecutionStatus::Failed,
        ExecutionStatus::Failed,
        ExecutionStatus::Completed,
    ]
    .into_iter()
    .enumerate()
    {
        let job_id = attempt as i64 + 1;
        runtime.try_accept(request(job_id, Provider::Mfn)).unwrap();
        let status = wait_for_terminal(&runtime, job_id).await;
        assert_eq!(status.status, expected, "attempt {attempt}");
    }
}

#[tokio::test]
async fn finished_entries_are_evicted_after_the_result_ttl() {
    let mut registry = AutomationRegistry::new();
    registry.register(
        Provider::Mfn,
        Action::Validation,
        Arc::new(MockAutomation::succeeding()),
    );
    let runtime = runtime_with(registry, 2, Duration::from_secs(5));

    runtime.try_accept(request(1, Provider::Mfn)).unwrap();
    wait_for_terminal(&runtime, 1).await;

    // Within the TTL the result stays readable.
    assert_eq!(runtime.sweep_expired(Utc::now()), 0);
    assert_eq!(runtime.status(1).status, ExecutionStatus::Completed);

    // Past the TTL it is evicted.
    let later = Utc::now() + chrono::Duration::seconds(601);
    assert_eq!(runtime.sweep_expired(later), 1);
    assert_eq!(runtime.status(1).status, ExecutionStatus::NotFound);
}

#[tokio::test]
async fn running_entries_survive_the_sweep() {
    let mut registry = AutomationRegistry::new();
    registry.register(
        Provider::Mfn,
        Action::Validation,
        Arc::new(MockAutomation::succeeding().with_delay(Duration::from_millis(300))),
    );
    let runtime = runtime_with(registry, 1, Duration::from_secs(5));

    runtime.try_accept(request(1, Provider::Mfn)).unwrap();
    let later = Utc::now() + chrono::Duration::seconds(601);
    assert_eq!(runtime.sweep_expired(later), 0);
    assert_eq!(runtime.status(1).status, ExecutionStatus::Running);
}

#[tokio::test]
async fn health_and_capabilities_reflect_the_registry_and_load() {
    let mut registry = AutomationRegistry::new();
    registry.register(
        Provider::Mfn,
        Action::Validation,
        Arc::new(MockAutomation::succeeding().with_delay(Duration::from_millis(200))),
    );
    registry.register(
        Provider::Mfn,
        Action::Cancellation,
        Arc::new(MockAutomation::succeeding()),
    );
    let runtime = runtime_with(registry, 3, Duration::from_secs(5));

    runtime.try_accept(request(1, Provider::Mfn)).unwrap();

    let health = runtime.health();
    assert_eq!(health.status, "online");
    assert_eq!(health.active_jobs, 1);
    assert_eq!(health.capacity, 3);

    let caps = runtime.capabilities();
    assert_eq!(caps.providers, vec![Provider::Mfn]);
    assert_eq!(caps.automations.len(), 2);
}
