//! Periodic task driver.
//!
//! Owns every recurring orchestrator task: interval tasks run on
//! `tokio::time::interval` loops, the daily evidence sweep runs on a cron
//! schedule. Each task has its own guard mutex, so at most one invocation
//! is in flight at any time whether a run came from the timer or an
//! on-demand trigger; a run that overlaps the next tick simply delays it.
//! The whole driver is cancellable and can be reinitialized at runtime.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler as CronScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Task names used by the admin endpoints.
pub const QUEUE_POLL: &str = "queue-poll";
pub const STATUS_POLL: &str = "status-poll";
pub const STALE_RECOVERY: &str = "stale-recovery";
pub const METRICS_SNAPSHOT: &str = "metrics-snapshot";
pub const WORKER_HEALTH: &str = "worker-health";
pub const CALLBACK_FLUSH: &str = "callback-flush";
pub const EVIDENCE_EVICTION: &str = "evidence-eviction";

type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type TaskAction = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

#[derive(Debug, Clone)]
enum TaskSchedule {
    Every(Duration),
    Cron(String),
}

struct ScheduledTask {
    name: &'static str,
    schedule: TaskSchedule,
    guard: Mutex<()>,
    last_run: RwLock<Option<DateTime<Utc>>>,
    runs: AtomicU64,
    action: TaskAction,
}

/// Read-only task state for `GET /scheduler`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub name: &'static str,
    pub schedule: String,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub running: bool,
    pub runs: u64,
}

pub struct Scheduler {
    tasks: Vec<Arc<ScheduledTask>>,
    parent: CancellationToken,
    child: Mutex<Option<CancellationToken>>,
    cron: Mutex<Option<CronScheduler>>,
}

impl Scheduler {
    pub fn new(parent: CancellationToken) -> Self {
        Self {
            tasks: Vec::new(),
            parent,
            child: Mutex::new(None),
            cron: Mutex::new(None),
        }
    }

    pub fn add_interval_task<F, Fut>(&mut self, name: &'static str, interval: Duration, action: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.tasks.push(Arc::new(ScheduledTask {
            name,
            schedule: TaskSchedule::Every(interval),
            guard: Mutex::new(()),
            last_run: RwLock::new(None),
            runs: AtomicU64::new(0),
            action: Arc::new(move || Box::pin(action()) as TaskFuture),
        }));
    }

    pub fn add_cron_task<F, Fut>(&mut self, name: &'static str, expression: &str, action: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.tasks.push(Arc::new(ScheduledTask {
            name,
            schedule: TaskSchedule::Cron(expression.to_string()),
            guard: Mutex::new(()),
            last_run: RwLock::new(None),
            runs: AtomicU64::new(0),
            action: Arc::new(move || Box::pin(action()) as TaskFuture),
        }));
    }

    /// Spawn all task loops. Also serves as reinitialization: any loops
    /// from a previous start are cancelled first.
    pub async fn start(&self) -> Result<()> {
        let mut child_slot = self.child.lock().await;
        if let Some(old) = child_slot.take() {
            old.cancel();
        }
        let child = self.parent.child_token();
        *child_slot = Some(child.clone());
        drop(child_slot);

        let mut cron_slot = self.cron.lock().await;
        if let Some(mut old) = cron_slot.take() {
            let _ = old.shutdown().await;
        }

        let mut cron_tasks = Vec::new();
        for task in &self.tasks {
            match &task.schedule {
                TaskSchedule::Every(interval) => {
                    let task = task.clone();
                    let interval = *interval;
                    let token = child.clone();
                    tokio::spawn(async move {
                        let mut ticker = tokio::time::interval(interval);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        loop {
                            tokio::select! {
                                _ = token.cancelled() => break,
                                _ = ticker.tick() => Self::run_if_idle(&task).await,
                            }
                        }
                        debug!(task = task.name, "task loop stopped");
                    });
                }
                TaskSchedule::Cron(expression) => {
                    cron_tasks.push((task.clone(), expression.clone()));
                }
            }
        }

        if !cron_tasks.is_empty() {
            let scheduler = CronScheduler::new().await?;
            for (task, expression) in cron_tasks {
                let job = CronJob::new_async(expression.as_str(), move |_uuid, _lock| {
                    let task = task.clone();
                    Box::pin(async move {
                        Scheduler::run_if_idle(&task).await;
                    })
                })?;
                scheduler.add(job).await?;
            }
            scheduler.start().await?;
            *cron_slot = Some(scheduler);
        }

        info!(tasks = self.tasks.len(), "scheduler started");
        Ok(())
    }

    /// Reinitialize all task loops.
    pub async fn reset(&self) -> Result<()> {
        info!("reinitializing scheduler tasks");
        self.start().await
    }

    /// Run a named task now. Waits for any in-flight invocation of the same
    /// task to finish first, preserving the one-at-a-time contract.
    pub async fn trigger(&self, name: &str) -> Result<bool> {
        let Some(task) = self.tasks.iter().find(|t| t.name == name) else {
            return Ok(false);
        };
        let _guard = task.guard.lock().await;
        Self::execute(task).await;
        Ok(true)
    }

    /// Timer-driven entry: skip when the previous run is still going.
    async fn run_if_idle(task: &Arc<ScheduledTask>) {
        match task.guard.try_lock() {
            Ok(_guard) => Self::execute(task).await,
            Err(_) => debug!(task = task.name, "previous run still in flight; delaying"),
        }
    }

    async fn execute(task: &Arc<ScheduledTask>) {
        let started = Utc::now();
        if let Err(e) = (task.action)().await {
            error!(task = task.name, error = %e, "scheduled task failed");
        }
        *task.last_run.write().await = Some(started);
        task.runs.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn is_running(&self) -> bool {
        self.child.lock().await.is_some()
    }

    pub async fn statuses(&self) -> Vec<TaskStatus> {
        let mut statuses = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            let last_run = *task.last_run.read().await;
            let (schedule, next_run) = match &task.schedule {
                TaskSchedule::Every(interval) => {
                    let next = last_run
                        .and_then(|at| chrono::Duration::from_std(*interval).ok().map(|d| at + d));
                    (format!("every {}s", interval.as_secs()), next)
                }
                TaskSchedule::Cron(expression) => (format!("cron {expression}"), None),
            };
            statuses.push(TaskStatus {
                name: task.name,
                schedule,
                last_run,
                next_run,
                running: task.guard.try_lock().is_err(),
                runs: task.runs.load(Ordering::Relaxed),
            });
        }
        statuses
    }

    /// Stop all loops and wait up to `grace` for in-flight runs to finish.
    pub async fn shutdown(&self, grace: Duration) {
        if let Some(child) = self.child.lock().await.take() {
            child.cancel();
        }
        if let Some(mut cron) = self.cron.lock().await.take() {
            let _ = cron.shutdown().await;
        }

        let deadline = tokio::time::Instant::now() + grace;
        for task in &self.tasks {
            loop {
                if task.guard.try_lock().is_ok() {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    error!(task = task.name, "task still running at shutdown deadline");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn trigger_runs_a_named_task() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(CancellationToken::new());
        let c = counter.clone();
        scheduler.add_interval_task(QUEUE_POLL, Duration::from_secs(3600), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        assert!(scheduler.trigger(QUEUE_POLL).await.unwrap());
        assert!(!scheduler.trigger("no-such-task").await.unwrap());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn statuses_report_runs_and_schedule() {
        let mut scheduler = Scheduler::new(CancellationToken::new());
        scheduler.add_interval_task(STATUS_POLL, Duration::from_secs(30), || async { Ok(()) });
        scheduler.add_cron_task(EVIDENCE_EVICTION, "0 0 2 * * *", || async { Ok(()) });

        scheduler.trigger(STATUS_POLL).await.unwrap();

        let statuses = scheduler.statuses().await;
        let poll = statuses.iter().find(|s| s.name == STATUS_POLL).unwrap();
        assert_eq!(poll.runs, 1);
        assert!(poll.last_run.is_some());
        assert!(poll.next_run.is_some());
        assert_eq!(poll.schedule, "every 30s");

        let eviction = statuses.iter().find(|s| s.name == EVIDENCE_EVICTION).unwrap();
        assert_eq!(eviction.runs, 0);
        assert_eq!(eviction.schedule, "cron 0 0 2 * * *");
    }

    #[tokio::test]
    async fn a_failing_task_does_not_poison_the_guard() {
        let mut scheduler = Scheduler::new(CancellationToken::new());
        scheduler.add_interval_task(QUEUE_POLL, Duration::from_secs(3600), || async {
            anyhow::bail!("boom")
        });

        assert!(scheduler.trigger(QUEUE_POLL).await.unwrap());
        assert!(scheduler.trigger(QUEUE_POLL).await.unwrap());
        let statuses = scheduler.statuses().await;
        assert_eq!(statuses[0].runs, 2);
    }

    #[tokio::test]
    async fn interval_loop_fires_and_stops_on_cancel() {
        let counter = Arc::new(AtomicUsize::new(0));
        let parent = CancellationToken::new();
        let mut scheduler = Scheduler::new(parent.clone());
        let c = counter.clone();
        scheduler.add_interval_task(METRICS_SNAPSHOT, Duration::from_millis(10), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.shutdown(Duration::from_secs(1)).await;

        let after_stop = counter.load(Ordering::SeqCst);
        assert!(after_stop >= 2, "expected several runs, got {after_stop}");

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_stop);
    }
}
