//! Task persistence.
//!
//! Two stores share one contract: [`PostgresTaskStore`] for durable tasks
//! and [`MemoryTaskStore`] for ephemeral ones. The service unions both for
//! due-scans; name uniqueness across the pair is enforced at registration.
//!
//! `claim` is the only correct way to move a task from idle to running; it
//! is an atomic conditional update that also stamps `run_started_at` and the
//! claiming process's instance id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::kernel::error::{Result, SchedulerError};

use super::model::{RunOutcome, StorageMode, Task, TaskDraft, TaskPatch, TaskStatus};

/// Row-level operations on task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Which storage family this store holds.
    fn storage_mode(&self) -> StorageMode;

    /// Insert a new record. Fails with a conflict if the name exists.
    async fn create(&self, draft: TaskDraft) -> Result<Task>;

    async fn get_by_name(&self, name: &str) -> Result<Option<Task>>;

    async fn get_all(&self) -> Result<Vec<Task>>;

    /// Idle, enabled tasks with `next_run_at <= cutoff`, soonest first.
    async fn get_due_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>>;

    /// Partial update; unset patch fields retain their values.
    async fn update(&self, name: &str, patch: TaskPatch) -> Result<Task>;

    async fn delete(&self, name: &str) -> Result<bool>;

    /// Atomic idle → running transition. Sets `run_started_at = now` and the
    /// claiming instance id. Returns `None` if the row was not idle.
    async fn claim(&self, name: &str, instance_id: &str) -> Result<Option<Task>>;

    /// Atomically write a run's outcome and return the task to `idle` (or
    /// `disabled`), clearing `run_started_at` and `process_instance_id`.
    async fn mark_idle(&self, name: &str, outcome: RunOutcome) -> Result<Task>;

    /// Running tasks claimed by a different process instance.
    async fn find_orphaned(&self, instance_id: &str) -> Result<Vec<Task>>;

    /// Running tasks whose `run_started_at` is older than `older_than_ms`.
    async fn find_stuck(&self, older_than_ms: i64) -> Result<Vec<Task>>;

    /// Forcibly return a row to idle, clearing the run fields. Returns the
    /// post-image, or `None` if the name is unknown.
    async fn reset(&self, name: &str) -> Result<Option<Task>>;
}

// ============================================================================
// In-memory store
// ============================================================================

/// In-memory task store with synthetic negative ids.
///
/// Ids come from a private decreasing sequence so they can never collide
/// with persisted row ids; they disambiguate, nothing more.
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<String, Task>>,
    next_id: AtomicI64,
    mode: StorageMode,
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::with_mode(StorageMode::InMemory)
    }

    /// A memory store posing as the given storage family. Tests use this to
    /// drive the persisted-task paths without a database.
    pub fn with_mode(mode: StorageMode) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(0),
            mode,
        }
    }

    /// Seed a record directly, bypassing draft validation. Test setup only.
    pub fn seed(&self, task: Task) {
        self.tasks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task.name.clone(), task);
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    fn storage_mode(&self) -> StorageMode {
        self.mode
    }

    async fn create(&self, mut draft: TaskDraft) -> Result<Task> {
        draft.storage_mode = self.mode;
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        if tasks.contains_key(&draft.name) {
            return Err(SchedulerError::conflict(format!(
                "task \"{}\" already exists",
                draft.name
            )));
        }
        let id = self.next_id.fetch_sub(1, Ordering::SeqCst) - 1;
        let task = Task::from_draft(id, draft, Utc::now());
        tasks.insert(task.name.clone(), task.clone());
        Ok(task)
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Task>> {
        let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        Ok(tasks.get(name).cloned())
    }

    async fn get_all(&self) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<Task> = tasks.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn get_due_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        let mut due: Vec<Task> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Idle && t.enabled)
            .filter(|t| t.next_run_at.is_some_and(|at| at <= cutoff))
            .cloned()
            .collect();
        due.sort_by(|a, b| (a.next_run_at, &a.name).cmp(&(b.next_run_at, &b.name)));
        Ok(due)
    }

    async fn update(&self, name: &str, patch: TaskPatch) -> Result<Task> {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        let task = tasks
            .get_mut(name)
            .ok_or_else(|| SchedulerError::not_found(format!("task \"{}\"", name)))?;
        patch.apply(task, Utc::now());
        Ok(task.clone())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        Ok(tasks.remove(name).is_some())
    }

    async fn claim(&self, name: &str, instance_id: &str) -> Result<Option<Task>> {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        let Some(task) = tasks.get_mut(name) else {
            return Ok(None);
        };
        if task.status != TaskStatus::Idle {
            return Ok(None);
        }
        let now = Utc::now();
        task.status = TaskStatus::Running;
        task.run_started_at = Some(now);
        task.process_instance_id = Some(instance_id.to_string());
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn mark_idle(&self, name: &str, outcome: RunOutcome) -> Result<Task> {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        let task = tasks
            .get_mut(name)
            .ok_or_else(|| SchedulerError::not_found(format!("task \"{}\"", name)))?;
        let now = Utc::now();
        task.status = outcome.status;
        task.last_run_at = Some(outcome.last_run_at);
        task.next_run_at = outcome.next_run_at;
        task.last_error = outcome.last_error;
        task.consecutive_failures = outcome.consecutive_failures;
        task.run_started_at = None;
        task.process_instance_id = None;
        task.updated_at = now;
        Ok(task.clone())
    }

    async fn find_orphaned(&self, instance_id: &str) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        Ok(tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .filter(|t| t.process_instance_id.as_deref() != Some(instance_id))
            .cloned()
            .collect())
    }

    async fn find_stuck(&self, older_than_ms: i64) -> Result<Vec<Task>> {
        let cutoff = Utc::now() - Duration::milliseconds(older_than_ms);
        let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        Ok(tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .filter(|t| t.run_started_at.is_some_and(|at| at < cutoff))
            .cloned()
            .collect())
    }

    async fn reset(&self, name: &str) -> Result<Option<Task>> {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        let Some(task) = tasks.get_mut(name) else {
            return Ok(None);
        };
        task.status = TaskStatus::Idle;
        task.run_started_at = None;
        task.process_instance_id = None;
        task.updated_at = Utc::now();
        Ok(Some(task.clone()))
    }
}

// ============================================================================
// PostgreSQL store
// ============================================================================

pub struct PostgresTaskStore {
    db: PgPool,
    /// Serializes the read-modify-write update path.
    writer: Mutex<()>,
}

impl PostgresTaskStore {
    pub fn new(db: PgPool) -> Self {
        Self {
            db,
            writer: Mutex::new(()),
        }
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    fn storage_mode(&self) -> StorageMode {
        StorageMode::Persisted
    }

    async fn create(&self, mut draft: TaskDraft) -> Result<Task> {
        draft.storage_mode = StorageMode::Persisted;
        let _guard = self.writer.lock().await;
        let template = Task::from_draft(0, draft, Utc::now());

        let task = sqlx::query_as::<_, Task>(
            r#"
            INSERT INTO tasks (
                name, task_type, schedule_type, storage_mode, interval_seconds,
                scheduled_at, enabled, payload, next_run_at, status,
                consecutive_failures, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING *
            "#,
        )
        .bind(&template.name)
        .bind(&template.task_type)
        .bind(template.schedule_type)
        .bind(template.storage_mode)
        .bind(template.interval_seconds)
        .bind(template.scheduled_at)
        .bind(template.enabled)
        .bind(&template.payload)
        .bind(template.next_run_at)
        .bind(template.status)
        .bind(template.consecutive_failures)
        .bind(template.created_at)
        .bind(template.updated_at)
        .fetch_one(&self.db)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                SchedulerError::conflict(format!("task \"{}\" already exists", template.name))
            }
            _ => e.into(),
        })?;

        Ok(task)
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Task>> {
        let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.db)
            .await?;
        Ok(task)
    }

    async fn get_all(&self) -> Result<Vec<Task>> {
        let tasks = sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY name")
            .fetch_all(&self.db)
            .await?;
        Ok(tasks)
    }

    async fn get_due_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
        let tasks = sqlx::query_as::<_, Task>(
            r#"
            SELECT * FROM tasks
            WHERE status = 'idle' AND enabled = TRUE
              AND next_run_at IS NOT NULL AND next_run_at <= $1
            ORDER BY next_run_at ASC, name ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.db)
        .await?;
        Ok(tasks)
    }

    async fn update(&self, name: &str, patch: TaskPatch) -> Result<Task> {
        let _guard = self.writer.lock().await;
        let mut task = self
            .get_by_name(name)
            .await?
            .ok_or_else(|| SchedulerError::not_found(format!("task \"{}\"", name)))?;
        patch.apply(&mut task, Utc::now());

        let updated = sqlx::query_as::<_, Task>(
            r#"
            UPDATE tasks SET
                enabled = $2, payload = $3, next_run_at = $4,
                interval_seconds = $5, updated_at = $6
            WHERE name = $1
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(task.enabled)
        .bind(&task.payload)
        .bind(task.next_run_at)
        .bind(task.interval_seconds)
        .bind(task.updated_at)
        .fetch_one(&self.db)
        .await?;

        Ok(updated)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let _guard = self.writer.lock().await;
        let deleted = sqlx::query("DELETE FROM tasks WHERE name = $1")
            .bind(name)
            .execute(&self.db)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    async fn claim(&self, name: &str, instance_id: &str) -> Result<Option<Task>> {
        // Single-statement conditional update: the WHERE clause is the lock.
        let task = sqlx::query_as::<_, Task>(
            r#"
            UPDATE tasks
            SET status = 'running',
                run_started_at = NOW(),
                process_instance_id = $2,
                updated_at = NOW()
            WHERE name = $1 AND status = 'idle'
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(instance_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(task)
    }

    async fn mark_idle(&self, name: &str, outcome: RunOutcome) -> Result<Task> {
        let task = sqlx::query_as::<_, Task>(
            r#"
            UPDATE tasks
            SET status = $2,
                last_run_at = $3,
                next_run_at = $4,
                last_error = $5,
                consecutive_failures = $6,
                run_started_at = NULL,
                process_instance_id = NULL,
                updated_at = NOW()
            WHERE name = $1
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(outcome.status)
        .bind(outcome.last_run_at)
        .bind(outcome.next_run_at)
        .bind(&outcome.last_error)
        .bind(outcome.consecutive_failures)
        .fetch_optional(&self.db)
        .await?;

        task.ok_or_else(|| SchedulerError::not_found(format!("task \"{}\"", name)))
    }

    async fn find_orphaned(&self, instance_id: &str) -> Result<Vec<Task>> {
        let tasks = sqlx::query_as::<_, Task>(
            r#"
            SELECT * FROM tasks
            WHERE status = 'running'
              AND process_instance_id IS DISTINCT FROM $1
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.db)
        .await?;
        Ok(tasks)
    }

    async fn find_stuck(&self, older_than_ms: i64) -> Result<Vec<Task>> {
        let tasks = sqlx::query_as::<_, Task>(
            r#"
            SELECT * FROM tasks
            WHERE status = 'running'
              AND run_started_at < NOW() - ($1 || ' milliseconds')::INTERVAL
            "#,
        )
        .bind(older_than_ms.to_string())
        .fetch_all(&self.db)
        .await?;
        Ok(tasks)
    }

    async fn reset(&self, name: &str) -> Result<Option<Task>> {
        let task = sqlx::query_as::<_, Task>(
            r#"
            UPDATE tasks
            SET status = 'idle',
                run_started_at = NULL,
                process_instance_id = NULL,
                updated_at = NOW()
            WHERE name = $1
            RETURNING *
            "#,
        )
        .bind(name)
        .fetch_optional(&self.db)
        .await?;
        Ok(task)
    }
}
