//! Schedule persistence.
//!
//! [`ScheduleStore`] abstracts row-level CRUD over schedule records so the
//! engine can run against PostgreSQL in production and an in-memory store in
//! tests and embedded deployments.
//!
//! # Concurrency contract
//!
//! Every write-path operation runs under the store's exclusive writer lock.
//! Reads take no lock (Postgres) or a shared lock (memory) and may observe a
//! concurrent writer's pre-image.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::kernel::error::{Result, SchedulerError};

use super::model::{Schedule, ScheduleDraft, SchedulePatch, ScheduleStatus};

/// Row-level operations on schedule records.
///
/// All mutating operations return the post-image of the record on success.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Insert a new record. Fails with a conflict if the name exists.
    async fn create(&self, draft: ScheduleDraft) -> Result<Schedule>;

    async fn get_by_name(&self, name: &str) -> Result<Option<Schedule>>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Schedule>>;

    async fn get_all(&self) -> Result<Vec<Schedule>>;

    /// Active records with `next_run_at <= cutoff`, ordered by `next_run_at`
    /// ascending with ties broken by id.
    async fn get_due_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Schedule>>;

    /// Partial update by name; unset patch fields retain their values and
    /// `updated_at` is refreshed.
    async fn update(&self, name: &str, patch: SchedulePatch) -> Result<Schedule>;

    /// Partial update by id. Used by the engine so a delete-and-recreate
    /// under the same name cannot receive a stale write.
    async fn update_by_id(&self, id: Uuid, patch: SchedulePatch) -> Result<Schedule>;

    /// Remove a record. Returns whether a row was removed.
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Purge all non-persistent records. Returns how many were removed.
    async fn delete_ephemeral(&self) -> Result<u64>;

    /// The soonest `next_run_at` across active records, for timer arming.
    async fn soonest_next_run(&self) -> Result<Option<DateTime<Utc>>>;

    /// All records with an `active_job_id` set, for startup reconciliation.
    async fn with_active_job(&self) -> Result<Vec<Schedule>>;
}

// ============================================================================
// PostgreSQL store
// ============================================================================

pub struct PostgresScheduleStore {
    db: PgPool,
    /// Serializes the read-modify-write update path.
    writer: Mutex<()>,
}

impl PostgresScheduleStore {
    pub fn new(db: PgPool) -> Self {
        Self {
            db,
            writer: Mutex::new(()),
        }
    }

    async fn insert(&self, schedule: &Schedule) -> Result<Schedule> {
        let row = sqlx::query_as::<_, Schedule>(
            r#"
            INSERT INTO schedules (
                id, name, description, schedule_type, status, is_persistent,
                next_run_at, interval_ms, job_type, job_payload, job_priority,
                job_max_retries, job_execution_mode, job_reference_type,
                job_reference_id, active_job_id, consecutive_failures,
                max_consecutive_failures, last_error, last_triggered_at,
                last_completed_at, created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23
            )
            RETURNING *
            "#,
        )
        .bind(schedule.id)
        .bind(&schedule.name)
        .bind(&schedule.description)
        .bind(schedule.schedule_type)
        .bind(schedule.status)
        .bind(schedule.is_persistent)
        .bind(schedule.next_run_at)
        .bind(schedule.interval_ms)
        .bind(&schedule.job_type)
        .bind(&schedule.job_payload)
        .bind(schedule.job_priority)
        .bind(schedule.job_max_retries)
        .bind(&schedule.job_execution_mode)
        .bind(&schedule.job_reference_type)
        .bind(&schedule.job_reference_id)
        .bind(schedule.active_job_id)
        .bind(schedule.consecutive_failures)
        .bind(schedule.max_consecutive_failures)
        .bind(&schedule.last_error)
        .bind(schedule.last_triggered_at)
        .bind(schedule.last_completed_at)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .fetch_one(&self.db)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                SchedulerError::conflict(format!("schedule \"{}\" already exists", schedule.name))
            }
            _ => e.into(),
        })?;

        Ok(row)
    }

    async fn write_full(&self, schedule: &Schedule) -> Result<Schedule> {
        let row = sqlx::query_as::<_, Schedule>(
            r#"
            UPDATE schedules SET
                description = $2, status = $3, next_run_at = $4, interval_ms = $5,
                job_payload = $6, active_job_id = $7, consecutive_failures = $8,
                max_consecutive_failures = $9, last_error = $10,
                last_triggered_at = $11, last_completed_at = $12, updated_at = $13
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(schedule.id)
        .bind(&schedule.description)
        .bind(schedule.status)
        .bind(schedule.next_run_at)
        .bind(schedule.interval_ms)
        .bind(&schedule.job_payload)
        .bind(schedule.active_job_id)
        .bind(schedule.consecutive_failures)
        .bind(schedule.max_consecutive_failures)
        .bind(&schedule.last_error)
        .bind(schedule.last_triggered_at)
        .bind(schedule.last_completed_at)
        .bind(schedule.updated_at)
        .fetch_one(&self.db)
        .await?;

        Ok(row)
    }
}

#[async_trait]
impl ScheduleStore for PostgresScheduleStore {
    async fn create(&self, draft: ScheduleDraft) -> Result<Schedule> {
        let _guard = self.writer.lock().await;
        let schedule = Schedule::from_draft(draft, Utc::now());
        self.insert(&schedule).await
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Schedule>> {
        let row = sqlx::query_as::<_, Schedule>("SELECT * FROM schedules WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.db)
            .await?;
        Ok(row)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Schedule>> {
        let row = sqlx::query_as::<_, Schedule>("SELECT * FROM schedules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(row)
    }

    async fn get_all(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query_as::<_, Schedule>("SELECT * FROM schedules ORDER BY name")
            .fetch_all(&self.db)
            .await?;
        Ok(rows)
    }

    async fn get_due_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let rows = sqlx::query_as::<_, Schedule>(
            r#"
            SELECT * FROM schedules
            WHERE status = 'active' AND next_run_at IS NOT NULL AND next_run_at <= $1
            ORDER BY next_run_at ASC, id ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn update(&self, name: &str, patch: SchedulePatch) -> Result<Schedule> {
        let _guard = self.writer.lock().await;
        let mut schedule = self
            .get_by_name(name)
            .await?
            .ok_or_else(|| SchedulerError::not_found(format!("schedule \"{}\"", name)))?;
        patch.apply(&mut schedule, Utc::now());
        self.write_full(&schedule).await
    }

    async fn update_by_id(&self, id: Uuid, patch: SchedulePatch) -> Result<Schedule> {
        let _guard = self.writer.lock().await;
        let mut schedule = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| SchedulerError::not_found(format!("schedule {}", id)))?;
        patch.apply(&mut schedule, Utc::now());
        self.write_full(&schedule).await
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let _guard = self.writer.lock().await;
        let deleted = sqlx::query("DELETE FROM schedules WHERE name = $1")
            .bind(name)
            .execute(&self.db)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    async fn delete_ephemeral(&self) -> Result<u64> {
        let _guard = self.writer.lock().await;
        let deleted = sqlx::query("DELETE FROM schedules WHERE is_persistent = FALSE")
            .execute(&self.db)
            .await?
            .rows_affected();
        Ok(deleted)
    }

    async fn soonest_next_run(&self) -> Result<Option<DateTime<Utc>>> {
        let next = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            SELECT next_run_at FROM schedules
            WHERE status = 'active' AND next_run_at IS NOT NULL
            ORDER BY next_run_at ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.db)
        .await?;
        Ok(next)
    }

    async fn with_active_job(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query_as::<_, Schedule>(
            "SELECT * FROM schedules WHERE active_job_id IS NOT NULL ORDER BY name",
        )
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// In-memory schedule store for tests and embedded use.
///
/// The `RwLock` write guard doubles as the writer lock; poisoned locks are
/// recovered since records are plain data.
#[derive(Default)]
pub struct MemoryScheduleStore {
    schedules: RwLock<HashMap<Uuid, Schedule>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly, bypassing draft validation. Test setup only.
    pub fn seed(&self, schedule: Schedule) {
        self.schedules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(schedule.id, schedule);
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn create(&self, draft: ScheduleDraft) -> Result<Schedule> {
        let mut schedules = self.schedules.write().unwrap_or_else(|e| e.into_inner());
        if schedules.values().any(|s| s.name == draft.name) {
            return Err(SchedulerError::conflict(format!(
                "schedule \"{}\" already exists",
                draft.name
            )));
        }
        let schedule = Schedule::from_draft(draft, Utc::now());
        schedules.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Schedule>> {
        let schedules = self.schedules.read().unwrap_or_else(|e| e.into_inner());
        Ok(schedules.values().find(|s| s.name == name).cloned())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Schedule>> {
        let schedules = self.schedules.read().unwrap_or_else(|e| e.into_inner());
        Ok(schedules.get(&id).cloned())
    }

    async fn get_all(&self) -> Result<Vec<Schedule>> {
        let schedules = self.schedules.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<Schedule> = schedules.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn get_due_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let schedules = self.schedules.read().unwrap_or_else(|e| e.into_inner());
        let mut due: Vec<Schedule> = schedules
            .values()
            .filter(|s| s.status == ScheduleStatus::Active)
            .filter(|s| s.next_run_at.is_some_and(|t| t <= cutoff))
            .cloned()
            .collect();
        due.sort_by_key(|s| (s.next_run_at, s.id));
        Ok(due)
    }

    async fn update(&self, name: &str, patch: SchedulePatch) -> Result<Schedule> {
        let mut schedules = self.schedules.write().unwrap_or_else(|e| e.into_inner());
        let schedule = schedules
            .values_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| SchedulerError::not_found(format!("schedule \"{}\"", name)))?;
        patch.apply(schedule, Utc::now());
        Ok(schedule.clone())
    }

    async fn update_by_id(&self, id: Uuid, patch: SchedulePatch) -> Result<Schedule> {
        let mut schedules = self.schedules.write().unwrap_or_else(|e| e.into_inner());
        let schedule = schedules
            .get_mut(&id)
            .ok_or_else(|| SchedulerError::not_found(format!("schedule {}", id)))?;
        patch.apply(schedule, Utc::now());
        Ok(schedule.clone())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let mut schedules = self.schedules.write().unwrap_or_else(|e| e.into_inner());
        let id = schedules
            .iter()
            .find(|(_, s)| s.name == name)
            .map(|(id, _)| *id);
        Ok(match id {
            Some(id) => schedules.remove(&id).is_some(),
            None => false,
        })
    }

    async fn delete_ephemeral(&self) -> Result<u64> {
        let mut schedules = self.schedules.write().unwrap_or_else(|e| e.into_inner());
        let before = schedules.len();
        schedules.retain(|_, s| s.is_persistent);
        Ok((before - schedules.len()) as u64)
    }

    async fn soonest_next_run(&self) -> Result<Option<DateTime<Utc>>> {
        let schedules = self.schedules.read().unwrap_or_else(|e| e.into_inner());
        Ok(schedules
            .values()
            .filter(|s| s.status == ScheduleStatus::Active)
            .filter_map(|s| s.next_run_at)
            .min())
    }

    async fn with_active_job(&self) -> Result<Vec<Schedule>> {
        let schedules = self.schedules.read().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<Schedule> = schedules
            .values()
            .filter(|s| s.active_job_id.is_some())
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::schedules::model::ScheduleType;
    use chrono::Duration;

    fn draft(name: &str, next_run_at: DateTime<Utc>) -> ScheduleDraft {
        ScheduleDraft::builder()
            .name(name)
            .schedule_type(ScheduleType::OneOff)
            .job_type("test")
            .next_run_at(next_run_at)
            .build()
    }

    #[tokio::test]
    async fn create_then_get_then_delete_roundtrip() {
        let store = MemoryScheduleStore::new();
        let created = store.create(draft("r", Utc::now())).await.unwrap();

        let fetched = store.get_by_name("r").await.unwrap().unwrap();
        assert_eq!(fetched.id, created.id);

        assert!(store.delete("r").await.unwrap());
        assert!(store.get_by_name("r").await.unwrap().is_none());
        assert!(!store.delete("r").await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_name_is_a_conflict() {
        let store = MemoryScheduleStore::new();
        store.create(draft("r", Utc::now())).await.unwrap();
        let err = store.create(draft("r", Utc::now())).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Conflict(_)));
    }

    #[tokio::test]
    async fn due_query_orders_by_next_run_then_id() {
        let store = MemoryScheduleStore::new();
        let now = Utc::now();
        store
            .create(draft("later", now + Duration::milliseconds(50)))
            .await
            .unwrap();
        store
            .create(draft("sooner", now - Duration::milliseconds(50)))
            .await
            .unwrap();
        store
            .create(draft("future", now + Duration::seconds(3600)))
            .await
            .unwrap();

        let due = store
            .get_due_before(now + Duration::milliseconds(100))
            .await
            .unwrap();
        let names: Vec<&str> = due.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["sooner", "later"]);
    }

    #[tokio::test]
    async fn due_query_skips_non_active() {
        let store = MemoryScheduleStore::new();
        let now = Utc::now();
        store
            .create(draft("paused", now - Duration::seconds(1)))
            .await
            .unwrap();
        store
            .update(
                "paused",
                SchedulePatch {
                    status: Some(ScheduleStatus::Paused),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(store.get_due_before(now).await.unwrap().is_empty());
        // Paused records do not drive the timer either.
        assert!(store.soonest_next_run().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_ephemeral_purges_only_non_persistent() {
        let store = MemoryScheduleStore::new();
        let mut ephemeral = draft("ephemeral", Utc::now());
        ephemeral.is_persistent = false;
        store.create(ephemeral).await.unwrap();
        store.create(draft("durable", Utc::now())).await.unwrap();

        assert_eq!(store.delete_ephemeral().await.unwrap(), 1);
        assert!(store.get_by_name("ephemeral").await.unwrap().is_none());
        assert!(store.get_by_name("durable").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn update_unknown_name_is_not_found() {
        let store = MemoryScheduleStore::new();
        let err = store
            .update("ghost", SchedulePatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)));
    }

    #[tokio::test]
    async fn with_active_job_finds_in_flight_records() {
        let store = MemoryScheduleStore::new();
        store.create(draft("a", Utc::now())).await.unwrap();
        store.create(draft("b", Utc::now())).await.unwrap();
        store
            .update(
                "b",
                SchedulePatch {
                    active_job_id: Some(Some(Uuid::new_v4())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let in_flight = store.with_active_job().await.unwrap();
        assert_eq!(in_flight.len(), 1);
        assert_eq!(in_flight[0].name, "b");
    }
}
