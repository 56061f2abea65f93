//! Task model: a lighter record whose handler is invoked directly by the
//! service, without going through the external job queue.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use crate::kernel::error::{Result, SchedulerError};

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "task_schedule_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskScheduleType {
    OneOff,
    Interval,
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "task_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Idle,
    Running,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "task_storage_mode", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    #[default]
    Persisted,
    InMemory,
}

// ============================================================================
// Task
// ============================================================================

/// A task record. Callers receive immutable snapshots; all mutation goes
/// through the task service.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    /// Positive row id for persisted tasks, negative synthetic id for
    /// in-memory tasks. A disambiguator, never a sort key.
    pub id: i64,
    pub name: String,
    /// Key into the handler registry.
    pub task_type: String,
    pub schedule_type: TaskScheduleType,
    pub storage_mode: StorageMode,
    pub interval_seconds: Option<i64>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub payload: Option<serde_json::Value>,

    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub run_started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: i32,
    pub status: TaskStatus,

    /// Which process claimed the task; set by `claim`, cleared by
    /// `mark_idle`/`reset`. A running task whose instance id differs from the
    /// current process is orphaned.
    pub process_instance_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build the initial record from a validated draft.
    pub fn from_draft(id: i64, draft: TaskDraft, now: DateTime<Utc>) -> Self {
        let next_run_at = draft.initial_next_run(now);
        Self {
            id,
            name: draft.name,
            task_type: draft.task_type,
            schedule_type: draft.schedule_type,
            storage_mode: draft.storage_mode,
            interval_seconds: draft.interval_seconds,
            scheduled_at: draft.scheduled_at,
            enabled: draft.enabled,
            payload: draft.payload,
            next_run_at,
            last_run_at: None,
            run_started_at: None,
            last_error: None,
            consecutive_failures: 0,
            status: TaskStatus::Idle,
            process_instance_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// Draft
// ============================================================================

/// Input for registering a task.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct TaskDraft {
    pub name: String,
    pub task_type: String,
    pub schedule_type: TaskScheduleType,
    #[builder(default)]
    pub storage_mode: StorageMode,
    #[builder(default, setter(strip_option))]
    pub interval_seconds: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub next_run_at: Option<DateTime<Utc>>,
    #[builder(default = true)]
    pub enabled: bool,
    #[builder(default, setter(strip_option))]
    pub payload: Option<serde_json::Value>,
}

impl TaskDraft {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SchedulerError::validation("task name must not be empty"));
        }
        if self.task_type.trim().is_empty() {
            return Err(SchedulerError::validation("task type must not be empty"));
        }
        match self.schedule_type {
            TaskScheduleType::Interval => match self.interval_seconds {
                Some(secs) if secs > 0 => {}
                _ => {
                    return Err(SchedulerError::validation(format!(
                        "task \"{}\" requires a positive interval_seconds",
                        self.name
                    )));
                }
            },
            TaskScheduleType::OneOff => {
                if self.scheduled_at.is_none() {
                    return Err(SchedulerError::validation(format!(
                        "task \"{}\" requires scheduled_at",
                        self.name
                    )));
                }
            }
            // Dynamic tasks may start unscheduled; a handler or an update
            // supplies the first run time.
            TaskScheduleType::Dynamic => {}
        }
        Ok(())
    }

    fn initial_next_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.schedule_type {
            TaskScheduleType::OneOff => self.scheduled_at,
            TaskScheduleType::Interval => self
                .next_run_at
                .or_else(|| self.interval_seconds.map(|secs| now + Duration::seconds(secs))),
            TaskScheduleType::Dynamic => self.next_run_at,
        }
    }
}

// ============================================================================
// Patch & run outcome
// ============================================================================

/// Partial update of a task row. Same outer/inner `Option` convention as
/// schedule patches: `None` leaves the column untouched, `Some(None)` clears.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub enabled: Option<bool>,
    pub payload: Option<Option<serde_json::Value>>,
    pub next_run_at: Option<Option<DateTime<Utc>>>,
    pub interval_seconds: Option<i64>,
}

impl TaskPatch {
    pub fn apply(&self, task: &mut Task, now: DateTime<Utc>) {
        if let Some(enabled) = self.enabled {
            task.enabled = enabled;
        }
        if let Some(payload) = &self.payload {
            task.payload = payload.clone();
        }
        if let Some(next_run_at) = self.next_run_at {
            task.next_run_at = next_run_at;
        }
        if let Some(interval_seconds) = self.interval_seconds {
            task.interval_seconds = Some(interval_seconds);
        }
        task.updated_at = now;
    }
}

/// What a finished (or skipped) run writes back in one atomic `mark_idle`.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub last_run_at: DateTime<Utc>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: i32,
    /// `Idle`, or `Disabled` once the failure threshold is reached.
    pub status: TaskStatus,
}
