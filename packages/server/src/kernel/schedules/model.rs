//! Schedule model: a declarative record describing when a job should be
//! enqueued and what job template to use.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::kernel::error::{Result, SchedulerError};
use crate::kernel::job_queue::JobRequest;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "schedule_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    /// Fires once, then the schedule is completed.
    OneOff,
    /// Next firing time is supplied by the completed job's result.
    Dynamic,
    /// Next firing time is computed after the previous job completes.
    SequentialInterval,
    /// Fires on a fixed cadence regardless of job completion.
    ConcurrentInterval,
}

impl ScheduleType {
    /// Whether this type carries an `interval_ms`.
    pub fn is_interval(&self) -> bool {
        matches!(self, Self::SequentialInterval | Self::ConcurrentInterval)
    }

    /// Whether a firing records `active_job_id` and waits for the job's
    /// terminal event. `ConcurrentInterval` never does.
    pub fn tracks_active_job(&self) -> bool {
        !matches!(self, Self::ConcurrentInterval)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "schedule_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    #[default]
    Active,
    Paused,
    Completed,
    Error,
}

impl ScheduleStatus {
    /// Terminal statuses never fire again until the record is re-registered.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

// ============================================================================
// Schedule
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub schedule_type: ScheduleType,
    pub status: ScheduleStatus,
    /// Non-persistent records are purged wholesale at service start.
    pub is_persistent: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub interval_ms: Option<i64>,

    // Job template, forwarded verbatim on enqueue
    pub job_type: String,
    pub job_payload: Option<serde_json::Value>,
    pub job_priority: i32,
    pub job_max_retries: i32,
    pub job_execution_mode: Option<String>,
    pub job_reference_type: Option<String>,
    pub job_reference_id: Option<String>,

    /// Set while an enqueued job is in-flight for this schedule.
    pub active_job_id: Option<Uuid>,
    pub consecutive_failures: i32,
    pub max_consecutive_failures: i32,
    pub last_error: Option<String>,

    pub last_triggered_at: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Build the initial record from a validated draft.
    pub fn from_draft(draft: ScheduleDraft, now: DateTime<Utc>) -> Self {
        let next_run_at = draft.initial_next_run(now);
        Self {
            id: Uuid::new_v4(),
            name: draft.name,
            description: draft.description,
            schedule_type: draft.schedule_type,
            status: ScheduleStatus::Active,
            is_persistent: draft.is_persistent,
            next_run_at,
            interval_ms: draft.interval_ms,
            job_type: draft.job_type,
            job_payload: draft.job_payload,
            job_priority: draft.job_priority,
            job_max_retries: draft.job_max_retries,
            job_execution_mode: draft.job_execution_mode,
            job_reference_type: draft.job_reference_type,
            job_reference_id: draft.job_reference_id,
            active_job_id: None,
            consecutive_failures: 0,
            max_consecutive_failures: draft.max_consecutive_failures,
            last_error: None,
            last_triggered_at: None,
            last_completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The configured interval as a `chrono::Duration`.
    pub fn interval(&self) -> Option<Duration> {
        self.interval_ms.map(Duration::milliseconds)
    }

    /// The job template as an enqueue request.
    pub fn job_request(&self) -> JobRequest {
        JobRequest {
            job_type: self.job_type.clone(),
            payload: self.job_payload.clone(),
            priority: self.job_priority,
            max_retries: self.job_max_retries,
            execution_mode: self.job_execution_mode.clone(),
            reference_type: self.job_reference_type.clone(),
            reference_id: self.job_reference_id.clone(),
        }
    }
}

// ============================================================================
// Draft
// ============================================================================

/// Input for registering a schedule.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ScheduleDraft {
    pub name: String,
    pub schedule_type: ScheduleType,
    pub job_type: String,
    #[builder(default)]
    pub description: Option<String>,
    #[builder(default = true)]
    pub is_persistent: bool,
    #[builder(default, setter(strip_option))]
    pub next_run_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub interval_ms: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub job_payload: Option<serde_json::Value>,
    #[builder(default = 0)]
    pub job_priority: i32,
    #[builder(default = 3)]
    pub job_max_retries: i32,
    #[builder(default)]
    pub job_execution_mode: Option<String>,
    #[builder(default)]
    pub job_reference_type: Option<String>,
    #[builder(default)]
    pub job_reference_id: Option<String>,
    #[builder(default = 5)]
    pub max_consecutive_failures: i32,
}

impl ScheduleDraft {
    /// Validate the draft against the registration rules.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SchedulerError::validation("schedule name must not be empty"));
        }
        if self.job_type.trim().is_empty() {
            return Err(SchedulerError::validation("job type must not be empty"));
        }
        match self.schedule_type {
            ScheduleType::OneOff | ScheduleType::Dynamic => {
                if self.next_run_at.is_none() {
                    return Err(SchedulerError::validation(format!(
                        "schedule \"{}\" requires next_run_at",
                        self.name
                    )));
                }
            }
            ScheduleType::SequentialInterval | ScheduleType::ConcurrentInterval => {
                match self.interval_ms {
                    Some(ms) if ms > 0 => {}
                    _ => {
                        return Err(SchedulerError::validation(format!(
                            "schedule \"{}\" requires a positive interval_ms",
                            self.name
                        )));
                    }
                }
            }
        }
        if self.max_consecutive_failures <= 0 {
            return Err(SchedulerError::validation(
                "max_consecutive_failures must be positive",
            ));
        }
        Ok(())
    }

    /// Attach a payload supplied as a raw string.
    ///
    /// The string is parsed as JSON best-effort: malformed input is logged
    /// and carried as a string value rather than rejecting the draft. Stored
    /// payloads are JSON columns, so this boundary is the only place a raw
    /// string can enter.
    pub fn with_raw_payload(mut self, raw: &str) -> Self {
        self.job_payload = Some(parse_payload(raw));
        self
    }

    /// The first firing time for a freshly registered schedule.
    ///
    /// One-off and dynamic schedules fire at the caller-supplied time;
    /// interval schedules default to one interval from now.
    fn initial_next_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.schedule_type {
            ScheduleType::OneOff | ScheduleType::Dynamic => self.next_run_at,
            ScheduleType::SequentialInterval | ScheduleType::ConcurrentInterval => self
                .next_run_at
                .or_else(|| self.interval_ms.map(|ms| now + Duration::milliseconds(ms))),
        }
    }
}

// ============================================================================
// Patch
// ============================================================================

/// Partial update of a schedule row.
///
/// The outer `Option` is "touch this column at all"; the inner `Option`
/// (where present) is the new value, including clearing to NULL. A field
/// left as `None` retains its stored value.
#[derive(Debug, Clone, Default)]
pub struct SchedulePatch {
    pub description: Option<Option<String>>,
    pub status: Option<ScheduleStatus>,
    pub next_run_at: Option<Option<DateTime<Utc>>>,
    pub interval_ms: Option<i64>,
    pub job_payload: Option<Option<serde_json::Value>>,
    pub active_job_id: Option<Option<Uuid>>,
    pub consecutive_failures: Option<i32>,
    pub max_consecutive_failures: Option<i32>,
    pub last_error: Option<Option<String>>,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
}

impl SchedulePatch {
    /// Apply the patch to a record in place, refreshing `updated_at`.
    pub fn apply(&self, schedule: &mut Schedule, now: DateTime<Utc>) {
        if let Some(description) = &self.description {
            schedule.description = description.clone();
        }
        if let Some(status) = self.status {
            schedule.status = status;
        }
        if let Some(next_run_at) = self.next_run_at {
            schedule.next_run_at = next_run_at;
        }
        if let Some(interval_ms) = self.interval_ms {
            schedule.interval_ms = Some(interval_ms);
        }
        if let Some(job_payload) = &self.job_payload {
            schedule.job_payload = job_payload.clone();
        }
        if let Some(active_job_id) = self.active_job_id {
            schedule.active_job_id = active_job_id;
        }
        if let Some(consecutive_failures) = self.consecutive_failures {
            schedule.consecutive_failures = consecutive_failures;
        }
        if let Some(max_consecutive_failures) = self.max_consecutive_failures {
            schedule.max_consecutive_failures = max_consecutive_failures;
        }
        if let Some(last_error) = &self.last_error {
            schedule.last_error = last_error.clone();
        }
        if let Some(last_triggered_at) = self.last_triggered_at {
            schedule.last_triggered_at = Some(last_triggered_at);
        }
        if let Some(last_completed_at) = self.last_completed_at {
            schedule.last_completed_at = Some(last_completed_at);
        }
        schedule.updated_at = now;
    }

    /// Whether the patch touches nothing (a no-op update still bumps
    /// `updated_at`).
    pub fn is_empty(&self) -> bool {
        self.description.is_none()
            && self.status.is_none()
            && self.next_run_at.is_none()
            && self.interval_ms.is_none()
            && self.job_payload.is_none()
            && self.active_job_id.is_none()
            && self.consecutive_failures.is_none()
            && self.max_consecutive_failures.is_none()
            && self.last_error.is_none()
            && self.last_triggered_at.is_none()
            && self.last_completed_at.is_none()
    }
}

// ============================================================================
// API update request
// ============================================================================

/// How an update decides the schedule's next firing time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NextRunPolicy {
    /// `now + interval_ms` (using the new interval if one was supplied).
    #[default]
    Reset,
    /// Leave `next_run_at` untouched.
    Preserve,
    /// Use the supplied time.
    Explicit(DateTime<Utc>),
}

/// Caller-facing update of a schedule.
#[derive(Debug, Clone, Default)]
pub struct ScheduleUpdate {
    /// `Some(None)` clears the description; `None` leaves it untouched.
    pub description: Option<Option<String>>,
    pub interval_ms: Option<i64>,
    pub next_run: Option<NextRunPolicy>,
    pub job_payload: Option<Option<serde_json::Value>>,
    pub max_consecutive_failures: Option<i32>,
}

// ============================================================================
// Payload helpers
// ============================================================================

/// Parse a raw payload string as JSON, falling back to the raw string.
///
/// Best effort: a malformed payload is logged and carried as a string value
/// rather than failing the operation.
pub fn parse_payload(raw: &str) -> serde_json::Value {
    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "payload is not valid JSON, storing as raw string");
            serde_json::Value::String(raw.to_string())
        }
    }
}

/// Read the dynamic-schedule `nextRunAt` field out of a job result.
///
/// The result is opaque bytes everywhere else; only this boundary interprets
/// it, as an object whose `nextRunAt` field (if present and non-null) is an
/// ISO-8601 timestamp.
pub fn next_run_from_result(result: Option<&serde_json::Value>) -> Option<DateTime<Utc>> {
    let raw = result?.get("nextRunAt")?;
    let raw = raw.as_str()?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(t) => Some(t.with_timezone(&Utc)),
        Err(e) => {
            tracing::warn!(value = raw, error = %e, "ignoring unparseable nextRunAt in job result");
            None
        }
    }
}
