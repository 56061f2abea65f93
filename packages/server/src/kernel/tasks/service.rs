//! Poll-driven task engine.
//!
//! The service unifies durable and ephemeral tasks behind one polling
//! executor. Each tick reconciles stuck rows, collects due tasks from both
//! stores, and executes them concurrently with claim-based concurrency
//! control, per-task timeouts, and cooperative cancellation.
//!
//! # Architecture
//!
//! ```text
//! TaskService (every polling_interval_secs)
//!     │
//!     ├─► findStuck + reset (rows not tracked in-process)
//!     ├─► get_due_before(now) from both stores
//!     └─► per task: claim ──► handler(task, cancel) ──► mark_idle(outcome)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::InstanceId;
use crate::config::SchedulerConfig;
use crate::kernel::error::{Result, SchedulerError};

use super::model::{
    RunOutcome, StorageMode, Task, TaskDraft, TaskPatch, TaskScheduleType, TaskStatus,
};
use super::registry::{HandlerRegistry, TaskRunResult};
use super::store::TaskStore;

struct ServiceInner {
    persisted: Arc<dyn TaskStore>,
    memory: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    config: SchedulerConfig,
    instance_id: InstanceId,
    /// Names currently executing in this process, with their cancel tokens.
    running: RwLock<HashMap<String, CancellationToken>>,
    /// Serializes cross-store uniqueness checks during registration.
    registration: Mutex<()>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    starting: AtomicBool,
    shutdown: CancellationToken,
}

/// Task engine: claim-based polling executor over both task stores.
///
/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct TaskService {
    inner: Arc<ServiceInner>,
}

impl TaskService {
    pub fn new(
        persisted: Arc<dyn TaskStore>,
        memory: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        config: SchedulerConfig,
        instance_id: InstanceId,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                persisted,
                memory,
                registry,
                config,
                instance_id,
                running: RwLock::new(HashMap::new()),
                registration: Mutex::new(()),
                poll_task: Mutex::new(None),
                started: AtomicBool::new(false),
                starting: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn stores(&self) -> [Arc<dyn TaskStore>; 2] {
        [
            Arc::clone(&self.inner.persisted),
            Arc::clone(&self.inner.memory),
        ]
    }

    fn store_for(&self, mode: StorageMode) -> &Arc<dyn TaskStore> {
        match mode {
            StorageMode::Persisted => &self.inner.persisted,
            StorageMode::InMemory => &self.inner.memory,
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the engine: reset orphans left by a crashed prior instance,
    /// then launch the polling loop.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::conflict("task service already started"));
        }
        self.inner.starting.store(true, Ordering::SeqCst);
        info!(instance_id = %self.inner.instance_id, "task service starting");

        let recovered = self.reset_orphans().await;
        self.inner.starting.store(false, Ordering::SeqCst);
        recovered?;

        let service = self.clone();
        let tick_interval = StdDuration::from_secs(self.inner.config.polling_interval_secs.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            loop {
                tokio::select! {
                    _ = service.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => service.tick().await,
                }
            }
        });
        *self.inner.poll_task.lock().await = Some(handle);

        info!("task service started");
        Ok(())
    }

    /// Stop the engine. Every running handler's token is a child of the
    /// shutdown token, so cancelling it signals them all (cancellation is
    /// cooperative); then the running set is drained with a 30 s deadline
    /// and handlers still going past it continue in the background.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();

        let start_deadline = tokio::time::Instant::now() + StdDuration::from_secs(5);
        while self.inner.starting.load(Ordering::SeqCst)
            && tokio::time::Instant::now() < start_deadline
        {
            tokio::time::sleep(StdDuration::from_millis(50)).await;
        }

        if let Some(handle) = self.inner.poll_task.lock().await.take() {
            handle.abort();
        }

        let drain_deadline = tokio::time::Instant::now() + StdDuration::from_secs(30);
        loop {
            let remaining = self.inner.running.read().await.len();
            if remaining == 0 {
                break;
            }
            if tokio::time::Instant::now() >= drain_deadline {
                warn!(remaining, "tasks still running past the stop deadline");
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(100)).await;
        }

        info!("task service stopped");
    }

    /// Names currently executing in this process.
    pub async fn running_tasks(&self) -> Vec<String> {
        self.inner.running.read().await.keys().cloned().collect()
    }

    // ========================================================================
    // Registration API
    // ========================================================================

    /// Validate and persist a new task in the store its storage mode selects.
    /// Names are unique across both stores.
    pub async fn register_task(&self, draft: TaskDraft) -> Result<Task> {
        draft.validate()?;
        let _guard = self.inner.registration.lock().await;
        for store in self.stores() {
            if store.get_by_name(&draft.name).await?.is_some() {
                return Err(SchedulerError::conflict(format!(
                    "task \"{}\" already exists",
                    draft.name
                )));
            }
        }
        let created = self.store_for(draft.storage_mode).create(draft).await?;
        info!(task = %created.name, task_type = %created.task_type, "task registered");
        Ok(created)
    }

    pub async fn get_task(&self, name: &str) -> Result<Task> {
        for store in self.stores() {
            if let Some(task) = store.get_by_name(name).await? {
                return Ok(task);
            }
        }
        Err(SchedulerError::not_found(format!("task \"{}\"", name)))
    }

    /// Snapshots of every task across both stores, sorted by name.
    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut all = Vec::new();
        for store in self.stores() {
            all.extend(store.get_all().await?);
        }
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    pub async fn update_task(&self, name: &str, patch: TaskPatch) -> Result<Task> {
        if let Some(interval_seconds) = patch.interval_seconds {
            if interval_seconds <= 0 {
                return Err(SchedulerError::validation(
                    "interval_seconds must be positive",
                ));
            }
        }
        let task = self.get_task(name).await?;
        self.store_for(task.storage_mode).update(name, patch).await
    }

    pub async fn set_task_enabled(&self, name: &str, enabled: bool) -> Result<Task> {
        let task = self.get_task(name).await?;
        self.store_for(task.storage_mode)
            .update(
                name,
                TaskPatch {
                    enabled: Some(enabled),
                    ..Default::default()
                },
            )
            .await
    }

    pub async fn delete_task(&self, name: &str) -> Result<bool> {
        for store in self.stores() {
            if store.delete(name).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Forcibly return a task to idle, clearing its run fields.
    pub async fn reset_task(&self, name: &str) -> Result<Task> {
        for store in self.stores() {
            if let Some(task) = store.reset(name).await? {
                return Ok(task);
            }
        }
        Err(SchedulerError::not_found(format!("task \"{}\"", name)))
    }

    // ========================================================================
    // Polling
    // ========================================================================

    /// One polling pass: reconcile stuck rows, then fire everything due.
    /// Public so tests can drive the engine without waiting out the tick.
    pub async fn tick(&self) {
        self.reconcile_stuck().await;

        let now = Utc::now();
        let mut due = Vec::new();
        for store in self.stores() {
            match store.get_due_before(now).await {
                Ok(mut tasks) => due.append(&mut tasks),
                Err(e) => error!(error = %e, "due-task query failed"),
            }
        }

        for task in due {
            if !self.inner.registry.has(&task.task_type) {
                warn!(
                    task = %task.name,
                    task_type = %task.task_type,
                    "no handler registered, skipping"
                );
                continue;
            }

            // In-process dedup: one handler per task name at a time.
            let token = {
                let mut running = self.inner.running.write().await;
                if running.contains_key(&task.name) {
                    continue;
                }
                let token = self.inner.shutdown.child_token();
                running.insert(task.name.clone(), token.clone());
                token
            };

            let service = self.clone();
            tokio::spawn(async move {
                service.execute_task(&task, token).await;
                service.inner.running.write().await.remove(&task.name);
            });
        }
    }

    /// Reset rows stuck in `running` that this process is not actually
    /// executing (left over from a hung or crashed run).
    async fn reconcile_stuck(&self) {
        for store in self.stores() {
            let stuck = match store
                .find_stuck(self.inner.config.stuck_task_timeout_ms as i64)
                .await
            {
                Ok(stuck) => stuck,
                Err(e) => {
                    error!(error = %e, "stuck-task query failed");
                    continue;
                }
            };
            for task in stuck {
                if self.inner.running.read().await.contains_key(&task.name) {
                    continue;
                }
                warn!(task = %task.name, "resetting stuck task");
                if let Err(e) = store.reset(&task.name).await {
                    error!(task = %task.name, error = %e, "failed to reset stuck task");
                }
            }
        }
    }

    // ========================================================================
    // Execution
    // ========================================================================

    async fn execute_task(&self, task: &Task, token: CancellationToken) {
        let store = self.store_for(task.storage_mode);
        let Some(descriptor) = self.inner.registry.get(&task.task_type) else {
            return;
        };

        // Precondition gate: a skipped run still advances the schedule, so a
        // task whose gate stays closed does not fire on every tick.
        if !descriptor.should_run(task) {
            debug!(task = %task.name, "should_run returned false, advancing without executing");
            let now = Utc::now();
            let outcome = RunOutcome {
                last_run_at: now,
                next_run_at: default_next_run(task, now),
                last_error: task.last_error.clone(),
                consecutive_failures: task.consecutive_failures,
                status: TaskStatus::Idle,
            };
            if let Err(e) = store.mark_idle(&task.name, outcome).await {
                error!(task = %task.name, error = %e, "failed to record skipped run");
            }
            return;
        }

        let claimed = match store.claim(&task.name, self.inner.instance_id.as_str()).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                debug!(task = %task.name, "claim lost, task already running");
                return;
            }
            Err(e) => {
                error!(task = %task.name, error = %e, "claim failed");
                return;
            }
        };

        let timeout_ms = descriptor
            .timeout_ms
            .unwrap_or(self.inner.config.default_timeout_ms);
        debug!(task = %claimed.name, timeout_ms, "executing task");

        // The handler runs in its own task so a panic is contained and
        // classified as an ordinary failure.
        let mut handle = tokio::spawn(descriptor.invoke(claimed.clone(), token.clone()));
        let result =
            match tokio::time::timeout(StdDuration::from_millis(timeout_ms), &mut handle).await {
                Ok(Ok(Ok(result))) => result,
                Ok(Ok(Err(e))) => TaskRunResult::failure(e.to_string()),
                Ok(Err(join_err)) => {
                    TaskRunResult::failure(format!("handler panicked: {join_err}"))
                }
                Err(_elapsed) => {
                    token.cancel();
                    handle.abort();
                    if self.inner.shutdown.is_cancelled() {
                        TaskRunResult::failure("shutdown")
                    } else {
                        warn!(task = %claimed.name, timeout_ms, "handler timed out");
                        TaskRunResult::failure("timeout")
                    }
                }
            };

        let now = Utc::now();
        // An explicit next_run_at from the handler overrides the
        // schedule-type default.
        let next_run_at = result.next_run_at.or_else(|| default_next_run(&claimed, now));

        let threshold = descriptor
            .max_consecutive_failures
            .unwrap_or(self.inner.config.max_consecutive_failures);

        let outcome = if result.success {
            RunOutcome {
                last_run_at: now,
                next_run_at,
                last_error: None,
                consecutive_failures: 0,
                status: TaskStatus::Idle,
            }
        } else {
            let failures = claimed.consecutive_failures + 1;
            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "handler reported failure".to_string());
            if failures >= threshold {
                warn!(
                    task = %claimed.name,
                    failures,
                    "failure threshold reached, disabling task"
                );
                RunOutcome {
                    last_run_at: now,
                    next_run_at: None,
                    last_error: Some(error),
                    consecutive_failures: failures,
                    status: TaskStatus::Disabled,
                }
            } else {
                RunOutcome {
                    last_run_at: now,
                    next_run_at,
                    last_error: Some(error),
                    consecutive_failures: failures,
                    status: TaskStatus::Idle,
                }
            }
        };

        if let Err(e) = store.mark_idle(&claimed.name, outcome).await {
            error!(task = %claimed.name, error = %e, "failed to record run outcome");
        }
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Reset persisted rows still marked running by a previous instance.
    async fn reset_orphans(&self) -> Result<()> {
        let orphaned = self
            .inner
            .persisted
            .find_orphaned(self.inner.instance_id.as_str())
            .await?;
        for task in orphaned {
            info!(
                task = %task.name,
                stale_instance = ?task.process_instance_id,
                "resetting orphaned task"
            );
            self.inner.persisted.reset(&task.name).await?;
        }
        Ok(())
    }
}

/// The schedule-type default for a task's next firing time.
fn default_next_run(task: &Task, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match task.schedule_type {
        TaskScheduleType::Interval => task
            .interval_seconds
            .map(|secs| now + Duration::seconds(secs)),
        // One-off tasks are done; dynamic tasks wait for an external
        // reschedule or a handler-supplied next_run_at.
        TaskScheduleType::OneOff | TaskScheduleType::Dynamic => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tasks::store::MemoryTaskStore;

    fn service() -> (TaskService, Arc<HandlerRegistry>) {
        let registry = Arc::new(HandlerRegistry::new());
        let service = TaskService::new(
            Arc::new(MemoryTaskStore::with_mode(StorageMode::Persisted)),
            Arc::new(MemoryTaskStore::new()),
            registry.clone(),
            SchedulerConfig::default(),
            InstanceId::generate(),
        );
        (service, registry)
    }

    fn interval_draft(name: &str, storage_mode: StorageMode) -> TaskDraft {
        TaskDraft::builder()
            .name(name)
            .task_type("cleanup")
            .schedule_type(TaskScheduleType::Interval)
            .storage_mode(storage_mode)
            .interval_seconds(60i64)
            .build()
    }

    #[tokio::test]
    async fn register_routes_by_storage_mode() {
        let (service, _) = service();
        let persisted = service
            .register_task(interval_draft("durable", StorageMode::Persisted))
            .await
            .unwrap();
        let ephemeral = service
            .register_task(interval_draft("ephemeral", StorageMode::InMemory))
            .await
            .unwrap();

        assert_eq!(persisted.storage_mode, StorageMode::Persisted);
        assert_eq!(ephemeral.storage_mode, StorageMode::InMemory);
        assert_eq!(service.list_tasks().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn names_are_unique_across_both_stores() {
        let (service, _) = service();
        service
            .register_task(interval_draft("t", StorageMode::Persisted))
            .await
            .unwrap();
        let err = service
            .register_task(interval_draft("t", StorageMode::InMemory))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Conflict(_)));
    }

    #[tokio::test]
    async fn update_rejects_non_positive_interval() {
        let (service, _) = service();
        service
            .register_task(interval_draft("t", StorageMode::Persisted))
            .await
            .unwrap();
        let err = service
            .update_task(
                "t",
                TaskPatch {
                    interval_seconds: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
    }

    #[tokio::test]
    async fn get_task_unknown_name_is_not_found() {
        let (service, _) = service();
        assert!(matches!(
            service.get_task("ghost").await,
            Err(SchedulerError::NotFound(_)),
        ));
        assert!(!service.delete_task("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn disabled_task_is_skipped_but_reenabling_restores_it() {
        let (service, _) = service();
        let mut draft = interval_draft("t", StorageMode::Persisted);
        draft.next_run_at = Some(Utc::now() - Duration::seconds(1));
        service.register_task(draft).await.unwrap();

        let disabled = service.set_task_enabled("t", false).await.unwrap();
        assert!(!disabled.enabled);

        service.tick().await;
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        let task = service.get_task("t").await.unwrap();
        assert!(task.last_run_at.is_none());

        let enabled = service.set_task_enabled("t", true).await.unwrap();
        assert!(enabled.enabled);
    }

    #[test]
    fn default_next_run_follows_schedule_type() {
        let now = Utc::now();
        let draft = TaskDraft::builder()
            .name("t")
            .task_type("x")
            .schedule_type(TaskScheduleType::Interval)
            .interval_seconds(30i64)
            .build();
        let task = Task::from_draft(-1, draft, now);
        assert_eq!(
            default_next_run(&task, now),
            Some(now + Duration::seconds(30))
        );

        let draft = TaskDraft::builder()
            .name("t2")
            .task_type("x")
            .schedule_type(TaskScheduleType::OneOff)
            .scheduled_at(now)
            .build();
        let task = Task::from_draft(-2, draft, now);
        assert_eq!(default_next_run(&task, now), None);
    }
}
