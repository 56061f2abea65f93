//! Job queue dependency contract and the default PostgreSQL client.
//!
//! The scheduling core does not execute schedule jobs itself; it hands them
//! to an external queue and reacts to their terminal events. This module
//! defines that contract ([`JobQueue`]) and provides a PostgreSQL-backed
//! client ([`PostgresJobQueue`]) that stores jobs in a `jobs` table.
//!
//! # Completion delivery
//!
//! [`JobQueue::subscribe_completion`] returns a oneshot receiver that fires
//! at most once, with the job's terminal event. How an implementation
//! produces that event is its own business: the Postgres client watches the
//! job row internally, an in-memory queue (see [`crate::kernel::testing`])
//! fires it when a test drives the job to a terminal status.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use tokio::sync::oneshot;
use tracing::debug;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::error::Result;

// ============================================================================
// Contract types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobQueueStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobQueueStatus {
    /// Whether a job in this status will never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A job record as seen through the queue contract.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QueuedJob {
    pub id: Uuid,
    pub job_type: String,
    pub status: JobQueueStatus,
    pub payload: Option<serde_json::Value>,
    pub priority: i32,
    pub max_retries: i32,
    pub execution_mode: Option<String>,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    /// Opaque to the queue; the dynamic-schedule contract reads `nextRunAt`
    /// out of it at the completion boundary, nothing else.
    pub result: Option<serde_json::Value>,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything needed to enqueue a job. Built from a schedule's job template.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobRequest {
    pub job_type: String,
    #[builder(default)]
    pub payload: Option<serde_json::Value>,
    #[builder(default = 0)]
    pub priority: i32,
    #[builder(default = 3)]
    pub max_retries: i32,
    #[builder(default)]
    pub execution_mode: Option<String>,
    #[builder(default)]
    pub reference_type: Option<String>,
    #[builder(default)]
    pub reference_id: Option<String>,
}

/// Terminal event kinds delivered by a completion subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    Completed,
    Failed,
    Cancelled,
}

/// A job's terminal event, delivered at most once per subscription.
#[derive(Debug, Clone)]
pub struct JobCompletion {
    pub kind: CompletionKind,
    pub job: QueuedJob,
}

impl JobCompletion {
    /// Derive the completion event from a terminal job record.
    ///
    /// Returns `None` while the job is still pending or running.
    pub fn from_job(job: QueuedJob) -> Option<Self> {
        let kind = match job.status {
            JobQueueStatus::Completed => CompletionKind::Completed,
            JobQueueStatus::Failed => CompletionKind::Failed,
            JobQueueStatus::Cancelled => CompletionKind::Cancelled,
            JobQueueStatus::Pending | JobQueueStatus::Running => return None,
        };
        Some(Self { kind, job })
    }
}

/// Contract the scheduling core requires of the external job queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job. Synchronous from the caller's perspective: the returned
    /// record carries the identifier usable in all subsequent calls.
    async fn enqueue(&self, request: JobRequest) -> Result<QueuedJob>;

    /// Fetch a job by id. `None` if the record was purged.
    async fn get_job(&self, id: Uuid) -> Result<Option<QueuedJob>>;

    /// Cancel a job. May silently do nothing for already-terminal jobs.
    async fn cancel_job(&self, id: Uuid, reason: &str) -> Result<()>;

    /// Subscribe to the job's terminal event.
    ///
    /// The receiver resolves at most once. If the job record disappears
    /// before reaching a terminal status, the sender is dropped and the
    /// receiver observes a channel error.
    async fn subscribe_completion(&self, id: Uuid) -> Result<oneshot::Receiver<JobCompletion>>;
}

// ============================================================================
// PostgreSQL client
// ============================================================================

/// PostgreSQL-backed job queue client.
///
/// Enqueue inserts a `pending` row; completion subscriptions watch the row
/// until an external worker drives it to a terminal status.
pub struct PostgresJobQueue {
    db: PgPool,
    completion_check_interval: Duration,
}

impl PostgresJobQueue {
    /// Create a client with the default completion check interval (1 s).
    pub fn new(db: PgPool) -> Self {
        Self {
            db,
            completion_check_interval: Duration::from_millis(1_000),
        }
    }

    /// Create a client with a custom completion check interval.
    pub fn with_completion_check_interval(db: PgPool, interval: Duration) -> Self {
        Self {
            db,
            completion_check_interval: interval,
        }
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue(&self, request: JobRequest) -> Result<QueuedJob> {
        let job = sqlx::query_as::<_, QueuedJob>(
            r#"
            INSERT INTO jobs (
                id, job_type, status, payload, priority, max_retries,
                execution_mode, reference_type, reference_id
            )
            VALUES ($1, $2, 'pending', $3, $4, $5, $6, $7, $8)
            RETURNING id, job_type, status, payload, priority, max_retries,
                      execution_mode, reference_type, reference_id,
                      result, cancel_reason, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&request.job_type)
        .bind(&request.payload)
        .bind(request.priority)
        .bind(request.max_retries)
        .bind(&request.execution_mode)
        .bind(&request.reference_type)
        .bind(&request.reference_id)
        .fetch_one(&self.db)
        .await?;

        debug!(job_id = %job.id, job_type = %job.job_type, "enqueued job");
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<QueuedJob>> {
        let job = sqlx::query_as::<_, QueuedJob>(
            r#"
            SELECT id, job_type, status, payload, priority, max_retries,
                   execution_mode, reference_type, reference_id,
                   result, cancel_reason, created_at, updated_at
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        Ok(job)
    }

    async fn cancel_job(&self, id: Uuid, reason: &str) -> Result<()> {
        // Terminal jobs are left untouched; cancellation is best-effort.
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                cancel_reason = $2,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn subscribe_completion(&self, id: Uuid) -> Result<oneshot::Receiver<JobCompletion>> {
        let (tx, rx) = oneshot::channel();
        let db = self.db.clone();
        let interval = self.completion_check_interval;

        tokio::spawn(async move {
            let mut tx = tx;
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = tx.closed() => return,
                    _ = ticker.tick() => {}
                }

                let row = sqlx::query_as::<_, QueuedJob>(
                    r#"
                    SELECT id, job_type, status, payload, priority, max_retries,
                           execution_mode, reference_type, reference_id,
                           result, cancel_reason, created_at, updated_at
                    FROM jobs
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .fetch_optional(&db)
                .await;

                match row {
                    Ok(Some(job)) => {
                        if let Some(completion) = JobCompletion::from_job(job) {
                            let _ = tx.send(completion);
                            return;
                        }
                    }
                    Ok(None) => {
                        // Row purged: drop the sender so the subscriber sees
                        // the channel close instead of waiting forever.
                        debug!(job_id = %id, "job record disappeared before completion");
                        return;
                    }
                    Err(e) => {
                        debug!(job_id = %id, error = %e, "completion check failed, will retry");
                    }
                }
            }
        });

        Ok(rx)
    }
}
