//! Timer-driven schedule engine.
//!
//! The service keeps at most one armed timer. Arming queries the soonest
//! active `next_run_at`, sleeps until it (clamped to the configured
//! maximum), fires every due schedule in order, then re-arms. Mutations go
//! through a short debounce window so a burst of configuration changes
//! produces a single recomputation.
//!
//! # Architecture
//!
//! ```text
//! register / update / pause / resume / delete
//!     │
//!     └─► request_reschedule() ── debounce ──► schedule_next_trigger()
//!                                                   │
//!                                     one armed timer, clamped delay
//!                                                   │
//!                                       trigger_due_schedules()
//!                                                   │
//!                             enqueue job ──► record activeJobId
//!                                                   │
//!                             completion event ──► handle_job_completion()
//!                                                   └─► re-arm
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::kernel::error::{Result, SchedulerError};
use crate::kernel::job_queue::{CompletionKind, JobCompletion, JobQueue};

use super::model::{
    next_run_from_result, NextRunPolicy, Schedule, ScheduleDraft, SchedulePatch, ScheduleStatus,
    ScheduleType, ScheduleUpdate,
};
use super::store::ScheduleStore;

/// Retry delay after a failed dynamic-schedule job. Interval schedules retry
/// one interval later instead.
const DYNAMIC_RETRY_DELAY_MS: i64 = 60_000;

/// Timer bookkeeping. `fire_task` is the single armed timer; `debounce_task`
/// is the pending reschedule coalescer.
struct TimerState {
    fire_task: Option<JoinHandle<()>>,
    next_scheduled_time: Option<DateTime<Utc>>,
    debounce_task: Option<JoinHandle<()>>,
}

struct ServiceInner {
    store: Arc<dyn ScheduleStore>,
    queue: Arc<dyn JobQueue>,
    config: SchedulerConfig,
    timers: Mutex<TimerState>,
    triggering: AtomicBool,
    started: AtomicBool,
    starting: AtomicBool,
    shutdown: CancellationToken,
}

/// Schedule engine: validates mutations, arms the timer, enqueues jobs, and
/// feeds completion events back into schedule state.
///
/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct ScheduleService {
    inner: Arc<ServiceInner>,
}

impl ScheduleService {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        queue: Arc<dyn JobQueue>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                store,
                queue,
                config,
                timers: Mutex::new(TimerState {
                    fire_task: None,
                    next_scheduled_time: None,
                    debounce_task: None,
                }),
                triggering: AtomicBool::new(false),
                started: AtomicBool::new(false),
                starting: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the engine: purge ephemeral records, reconcile stale in-flight
    /// jobs, heal completion subscriptions, and arm the timer.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::conflict("schedule service already started"));
        }
        self.inner.starting.store(true, Ordering::SeqCst);
        info!("schedule service starting");

        let recovered = self.recover().await;
        self.inner.starting.store(false, Ordering::SeqCst);
        recovered?;

        self.schedule_next_trigger().await?;
        info!("schedule service started");
        Ok(())
    }

    /// Stop the engine. Waits briefly for an in-progress start, clears the
    /// timers, then drains a firing pass with a 30 s deadline.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();

        let start_deadline = tokio::time::Instant::now() + StdDuration::from_secs(5);
        while self.inner.starting.load(Ordering::SeqCst)
            && tokio::time::Instant::now() < start_deadline
        {
            tokio::time::sleep(StdDuration::from_millis(50)).await;
        }

        {
            let mut timers = self.inner.timers.lock().await;
            if let Some(handle) = timers.fire_task.take() {
                handle.abort();
            }
            if let Some(handle) = timers.debounce_task.take() {
                handle.abort();
            }
            timers.next_scheduled_time = None;
        }

        let drain_deadline = tokio::time::Instant::now() + StdDuration::from_secs(30);
        while self.inner.triggering.load(Ordering::SeqCst) {
            if tokio::time::Instant::now() >= drain_deadline {
                warn!("firing pass still in progress past the stop deadline");
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(100)).await;
        }

        info!("schedule service stopped");
    }

    /// The cached target of the currently armed timer, if any.
    pub async fn next_scheduled_time(&self) -> Option<DateTime<Utc>> {
        self.inner.timers.lock().await.next_scheduled_time
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Validate and persist a new schedule, then request a reschedule.
    pub async fn register_schedule(&self, draft: ScheduleDraft) -> Result<Schedule> {
        draft.validate()?;
        let created = self.inner.store.create(draft).await?;
        info!(schedule = %created.name, schedule_type = ?created.schedule_type, "schedule registered");
        self.request_reschedule().await;
        Ok(created)
    }

    pub async fn get_schedule(&self, name: &str) -> Result<Schedule> {
        self.inner
            .store
            .get_by_name(name)
            .await?
            .ok_or_else(|| SchedulerError::not_found(format!("schedule \"{}\"", name)))
    }

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        self.inner.store.get_all().await
    }

    /// Apply a caller-facing update.
    ///
    /// `interval_ms` is rejected for non-interval types. The next-run policy
    /// defaults to `Reset` when the interval changes; while a job is
    /// in-flight `next_run_at` is left alone and the completion handler picks
    /// up the new interval.
    pub async fn update_schedule(&self, name: &str, update: ScheduleUpdate) -> Result<Schedule> {
        let schedule = self.get_schedule(name).await?;

        if let Some(interval_ms) = update.interval_ms {
            if !schedule.schedule_type.is_interval() {
                return Err(SchedulerError::validation(format!(
                    "interval_ms cannot be set on a {:?} schedule",
                    schedule.schedule_type
                )));
            }
            if interval_ms <= 0 {
                return Err(SchedulerError::validation("interval_ms must be positive"));
            }
        }
        if let Some(max) = update.max_consecutive_failures {
            if max <= 0 {
                return Err(SchedulerError::validation(
                    "max_consecutive_failures must be positive",
                ));
            }
        }

        let next_run_at = resolve_next_run(&schedule, &update)?;

        let patch = SchedulePatch {
            description: update.description,
            interval_ms: update.interval_ms,
            job_payload: update.job_payload,
            max_consecutive_failures: update.max_consecutive_failures,
            next_run_at,
            ..Default::default()
        };
        let updated = self.inner.store.update_by_id(schedule.id, patch).await?;
        self.request_reschedule().await;
        Ok(updated)
    }

    /// Pause an active schedule. `next_run_at` is retained so one-off and
    /// dynamic schedules keep their target time across a pause.
    pub async fn pause_schedule(&self, name: &str) -> Result<Schedule> {
        let schedule = self.get_schedule(name).await?;
        if schedule.status != ScheduleStatus::Active {
            return Err(SchedulerError::conflict(format!(
                "cannot pause schedule \"{}\" in status {:?}",
                name, schedule.status
            )));
        }
        let updated = self
            .inner
            .store
            .update_by_id(
                schedule.id,
                SchedulePatch {
                    status: Some(ScheduleStatus::Paused),
                    ..Default::default()
                },
            )
            .await?;
        self.request_reschedule().await;
        Ok(updated)
    }

    /// Resume a paused schedule. Interval schedules get a fresh
    /// `next_run_at`; one-off and dynamic keep their stored time.
    pub async fn resume_schedule(&self, name: &str) -> Result<Schedule> {
        let schedule = self.get_schedule(name).await?;
        if schedule.status != ScheduleStatus::Paused {
            return Err(SchedulerError::conflict(format!(
                "cannot resume schedule \"{}\" in status {:?}",
                name, schedule.status
            )));
        }
        let next_run_at =
            if schedule.schedule_type.is_interval() && schedule.active_job_id.is_none() {
                Some(schedule.interval().map(|i| Utc::now() + i))
            } else {
                None
            };
        let updated = self
            .inner
            .store
            .update_by_id(
                schedule.id,
                SchedulePatch {
                    status: Some(ScheduleStatus::Active),
                    next_run_at,
                    ..Default::default()
                },
            )
            .await?;
        self.request_reschedule().await;
        Ok(updated)
    }

    /// Cancel the schedule's in-flight job, if any. The resulting cancelled
    /// completion event drives the state transition.
    pub async fn cancel_schedule(&self, name: &str) -> Result<bool> {
        let schedule = self.get_schedule(name).await?;
        match schedule.active_job_id {
            Some(job_id) => {
                self.inner
                    .queue
                    .cancel_job(job_id, "schedule cancelled")
                    .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Delete a schedule, cancelling its in-flight job best-effort.
    pub async fn delete_schedule(&self, name: &str) -> Result<bool> {
        if let Some(schedule) = self.inner.store.get_by_name(name).await? {
            if let Some(job_id) = schedule.active_job_id {
                if let Err(e) = self.inner.queue.cancel_job(job_id, "schedule deleted").await {
                    warn!(schedule = %name, job_id = %job_id, error = %e, "failed to cancel in-flight job");
                }
            }
        }
        let removed = self.inner.store.delete(name).await?;
        self.request_reschedule().await;
        Ok(removed)
    }

    /// Fire a schedule immediately, outside its timer.
    pub async fn trigger_now(&self, name: &str) -> Result<()> {
        let schedule = self.get_schedule(name).await?;
        if schedule.status.is_terminal() {
            return Err(SchedulerError::conflict(format!(
                "cannot trigger schedule \"{}\" in status {:?}",
                name, schedule.status
            )));
        }
        if schedule.active_job_id.is_some() {
            return Err(SchedulerError::conflict(format!(
                "schedule \"{}\" already has a job in flight",
                name
            )));
        }
        self.fire_schedule(schedule).await;
        self.schedule_next_trigger().await?;
        Ok(())
    }

    // ========================================================================
    // Timer protocol
    // ========================================================================

    /// Coalesce reschedule requests: cancel any pending recomputation and arm
    /// a fresh debounce window. Two mutations inside the window produce one
    /// recomputation that observes both.
    pub async fn request_reschedule(&self) {
        // Nothing to coalesce before start (recovery must run first) or
        // after shutdown.
        if !self.inner.started.load(Ordering::SeqCst) || self.inner.shutdown.is_cancelled() {
            return;
        }
        let mut timers = self.inner.timers.lock().await;
        if let Some(handle) = timers.debounce_task.take() {
            handle.abort();
        }
        let window = StdDuration::from_millis(self.inner.config.min_recalculation_interval_ms);
        let service = self.clone();
        timers.debounce_task = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            {
                let mut timers = service.inner.timers.lock().await;
                timers.debounce_task = None;
            }
            if let Err(e) = service.schedule_next_trigger().await {
                error!(error = %e, "debounced reschedule failed");
            }
        }));
    }

    /// Disarm the current timer and arm one for the soonest active
    /// `next_run_at`, clamping the delay to `max_timeout_ms`. Disarms
    /// entirely when no active schedule has a next run.
    ///
    /// Boxed so the mutual recursion with [`Self::trigger_due_schedules`]
    /// and [`Self::handle_job_completion`] (both reachable from the task
    /// spawned inside this method) does not leave the compiler unable to
    /// prove the resulting future is `Send`.
    pub fn schedule_next_trigger(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.schedule_next_trigger_impl())
    }

    async fn schedule_next_trigger_impl(&self) -> Result<()> {
        let soonest = self.inner.store.soonest_next_run().await?;

        let mut timers = self.inner.timers.lock().await;
        if let Some(handle) = timers.fire_task.take() {
            handle.abort();
        }
        timers.next_scheduled_time = soonest;

        // Never arm before start (recovery runs first) or after shutdown.
        if !self.inner.started.load(Ordering::SeqCst) || self.inner.shutdown.is_cancelled() {
            return Ok(());
        }
        let Some(target) = soonest else {
            debug!("no active schedule due, timer disarmed");
            return Ok(());
        };

        let delay_ms = (target - Utc::now())
            .num_milliseconds()
            .clamp(0, self.inner.config.max_timeout_ms as i64);
        let delay = StdDuration::from_millis(delay_ms as u64);

        let service = self.clone();
        timers.fire_task = Some(tokio::spawn(async move {
            tokio::select! {
                _ = service.inner.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            // Clear our own slot before firing so re-arming inside the
            // firing pass does not abort the task running it.
            {
                let mut timers = service.inner.timers.lock().await;
                timers.fire_task = None;
                timers.next_scheduled_time = None;
            }
            service.trigger_due_schedules().await;
        }));

        debug!(next_fire = %target, delay_ms, "timer armed");
        Ok(())
    }

    /// Fire every due schedule in `next_run_at` order, then re-arm.
    ///
    /// Idempotent: a firing pass already in progress makes this a no-op.
    pub async fn trigger_due_schedules(&self) {
        if self.inner.triggering.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.inner.store.get_due_before(Utc::now()).await {
            Ok(due) => {
                for schedule in due {
                    if self.inner.shutdown.is_cancelled() {
                        break;
                    }
                    self.fire_schedule(schedule).await;
                }
            }
            Err(e) => error!(error = %e, "failed to query due schedules"),
        }

        self.inner.triggering.store(false, Ordering::SeqCst);

        if let Err(e) = self.schedule_next_trigger().await {
            error!(error = %e, "failed to re-arm timer after firing");
        }
    }

    // ========================================================================
    // Firing and completion
    // ========================================================================

    async fn fire_schedule(&self, schedule: Schedule) {
        match self.inner.queue.enqueue(schedule.job_request()).await {
            Ok(job) => {
                let now = Utc::now();
                let patch = match schedule.schedule_type {
                    // Enqueue and immediately line up the next run. The
                    // enqueue is this type's only success signal, so it also
                    // resets the failure streak.
                    ScheduleType::ConcurrentInterval => SchedulePatch {
                        next_run_at: Some(schedule.interval().map(|i| now + i)),
                        last_triggered_at: Some(now),
                        consecutive_failures: Some(0),
                        ..Default::default()
                    },
                    // The next run is computed only after the job's terminal
                    // event; the failure streak resets there too, so failed
                    // jobs keep accumulating across retriggers.
                    ScheduleType::SequentialInterval | ScheduleType::Dynamic => SchedulePatch {
                        next_run_at: Some(None),
                        active_job_id: Some(Some(job.id)),
                        last_triggered_at: Some(now),
                        ..Default::default()
                    },
                    // A single successful enqueue completes the schedule.
                    ScheduleType::OneOff => SchedulePatch {
                        status: Some(ScheduleStatus::Completed),
                        next_run_at: Some(None),
                        active_job_id: Some(Some(job.id)),
                        last_triggered_at: Some(now),
                        ..Default::default()
                    },
                };

                if let Err(e) = self.inner.store.update_by_id(schedule.id, patch).await {
                    error!(schedule = %schedule.name, error = %e, "failed to record trigger");
                    return;
                }
                if schedule.schedule_type.tracks_active_job() {
                    self.watch_completion(schedule.id, job.id).await;
                }
                info!(schedule = %schedule.name, job_id = %job.id, "schedule fired");
            }
            Err(e) => {
                warn!(schedule = %schedule.name, error = %e, "enqueue failed");
                self.record_failure(&schedule, &e.to_string()).await;
            }
        }
    }

    /// Record a failed trigger or a failed/cancelled job, escalating to the
    /// error status once the threshold is reached.
    async fn record_failure(&self, schedule: &Schedule, message: &str) {
        let failures = schedule.consecutive_failures + 1;
        let now = Utc::now();

        let patch = if failures >= schedule.max_consecutive_failures {
            warn!(
                schedule = %schedule.name,
                failures,
                "consecutive failure threshold reached, schedule moved to error"
            );
            SchedulePatch {
                status: Some(ScheduleStatus::Error),
                next_run_at: Some(None),
                active_job_id: Some(None),
                consecutive_failures: Some(failures),
                last_error: Some(Some(message.to_string())),
                ..Default::default()
            }
        } else {
            let retry_at = match schedule.schedule_type {
                ScheduleType::SequentialInterval | ScheduleType::ConcurrentInterval => {
                    schedule.interval().map(|i| Some(now + i))
                }
                ScheduleType::Dynamic => {
                    Some(Some(now + Duration::milliseconds(DYNAMIC_RETRY_DELAY_MS)))
                }
                // Already terminal; the failure is recorded but the schedule
                // is never resurrected.
                ScheduleType::OneOff => None,
            };
            SchedulePatch {
                next_run_at: retry_at,
                active_job_id: Some(None),
                consecutive_failures: Some(failures),
                last_error: Some(Some(message.to_string())),
                ..Default::default()
            }
        };

        if let Err(e) = self.inner.store.update_by_id(schedule.id, patch).await {
            error!(schedule = %schedule.name, error = %e, "failed to record failure");
        }
    }

    /// Apply a job's terminal event to its schedule.
    ///
    /// Events whose job id no longer matches the schedule's `active_job_id`
    /// are ignored (race with delete/reset).
    pub async fn handle_job_completion(&self, schedule_id: Uuid, completion: JobCompletion) {
        let schedule = match self.inner.store.get_by_id(schedule_id).await {
            Ok(Some(schedule)) => schedule,
            Ok(None) => {
                debug!(schedule_id = %schedule_id, "completion for a deleted schedule, ignoring");
                return;
            }
            Err(e) => {
                error!(schedule_id = %schedule_id, error = %e, "failed to load schedule for completion");
                return;
            }
        };
        if schedule.active_job_id != Some(completion.job.id) {
            debug!(
                schedule = %schedule.name,
                job_id = %completion.job.id,
                "stale completion event, ignoring"
            );
            return;
        }

        let now = Utc::now();
        match completion.kind {
            CompletionKind::Completed => {
                let patch = match schedule.schedule_type {
                    ScheduleType::Dynamic => {
                        match next_run_from_result(completion.job.result.as_ref()) {
                            Some(next) => SchedulePatch {
                                next_run_at: Some(Some(next)),
                                active_job_id: Some(None),
                                last_completed_at: Some(now),
                                consecutive_failures: Some(0),
                                ..Default::default()
                            },
                            // No next time requested: the schedule is done.
                            None => SchedulePatch {
                                status: Some(ScheduleStatus::Completed),
                                next_run_at: Some(None),
                                active_job_id: Some(None),
                                last_completed_at: Some(now),
                                consecutive_failures: Some(0),
                                ..Default::default()
                            },
                        }
                    }
                    ScheduleType::SequentialInterval => SchedulePatch {
                        next_run_at: Some(schedule.interval().map(|i| now + i)),
                        active_job_id: Some(None),
                        last_completed_at: Some(now),
                        consecutive_failures: Some(0),
                        ..Default::default()
                    },
                    ScheduleType::OneOff | ScheduleType::ConcurrentInterval => SchedulePatch {
                        active_job_id: Some(None),
                        last_completed_at: Some(now),
                        consecutive_failures: Some(0),
                        ..Default::default()
                    },
                };
                if let Err(e) = self.inner.store.update_by_id(schedule.id, patch).await {
                    error!(schedule = %schedule.name, error = %e, "failed to record completion");
                }
                debug!(schedule = %schedule.name, job_id = %completion.job.id, "job completed");
            }
            CompletionKind::Failed | CompletionKind::Cancelled => {
                let message = match completion.kind {
                    CompletionKind::Cancelled => completion
                        .job
                        .cancel_reason
                        .clone()
                        .unwrap_or_else(|| "job cancelled".to_string()),
                    _ => format!("job {} failed", completion.job.id),
                };
                self.record_failure(&schedule, &message).await;
            }
        }

        if let Err(e) = self.schedule_next_trigger().await {
            error!(error = %e, "failed to re-arm timer after completion");
        }
    }

    /// Subscribe to a job's terminal event and route it back into
    /// [`Self::handle_job_completion`]. The watcher dies with the service.
    async fn watch_completion(&self, schedule_id: Uuid, job_id: Uuid) {
        let rx = match self.inner.queue.subscribe_completion(job_id).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "completion subscription failed");
                return;
            }
        };
        let service = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = service.inner.shutdown.cancelled() => {}
                received = rx => match received {
                    Ok(completion) => {
                        service.handle_job_completion(schedule_id, completion).await;
                    }
                    Err(_) => {
                        debug!(job_id = %job_id, "completion channel closed without an event");
                    }
                }
            }
        });
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Startup reconciliation: purge ephemeral records, then walk every
    /// schedule with an `active_job_id` and either heal its completion
    /// subscription (job still in flight), apply the missed terminal event,
    /// or clear the stale reference when the job record is gone.
    async fn recover(&self) -> Result<()> {
        let purged = self.inner.store.delete_ephemeral().await?;
        if purged > 0 {
            info!(purged, "purged ephemeral schedules");
        }

        for schedule in self.inner.store.with_active_job().await? {
            let Some(job_id) = schedule.active_job_id else {
                continue;
            };
            match self.inner.queue.get_job(job_id).await? {
                Some(job) if !job.status.is_terminal() => {
                    debug!(schedule = %schedule.name, job_id = %job_id, "re-subscribing to in-flight job");
                    self.watch_completion(schedule.id, job_id).await;
                }
                Some(job) => {
                    debug!(schedule = %schedule.name, job_id = %job_id, "applying missed terminal event");
                    if let Some(completion) = JobCompletion::from_job(job) {
                        self.handle_job_completion(schedule.id, completion).await;
                    }
                }
                None => {
                    info!(schedule = %schedule.name, job_id = %job_id, "clearing stale active job");
                    let next_run_at = if schedule.schedule_type.is_interval() {
                        Some(schedule.interval().map(|i| Utc::now() + i))
                    } else {
                        None
                    };
                    let patch = SchedulePatch {
                        active_job_id: Some(None),
                        next_run_at,
                        ..Default::default()
                    };
                    self.inner.store.update_by_id(schedule.id, patch).await?;
                }
            }
        }

        Ok(())
    }
}

/// Work out how an update touches `next_run_at`, honouring the in-flight
/// exception and terminal statuses.
fn resolve_next_run(
    schedule: &Schedule,
    update: &ScheduleUpdate,
) -> Result<Option<Option<DateTime<Utc>>>> {
    if update.interval_ms.is_none() && update.next_run.is_none() {
        return Ok(None);
    }
    // Terminal schedules keep next_run_at = NULL; an in-flight job owns the
    // next run and will apply the new interval on completion.
    if schedule.status.is_terminal() {
        return Ok(None);
    }
    if schedule.active_job_id.is_some() {
        if matches!(update.next_run, Some(NextRunPolicy::Explicit(_))) {
            warn!(
                schedule = %schedule.name,
                "ignoring explicit next_run_at while a job is in flight"
            );
        }
        return Ok(None);
    }

    match update.next_run.unwrap_or_default() {
        NextRunPolicy::Preserve => Ok(None),
        NextRunPolicy::Explicit(t) => Ok(Some(Some(t))),
        NextRunPolicy::Reset => {
            let interval_ms = update
                .interval_ms
                .or(schedule.interval_ms)
                .ok_or_else(|| {
                    SchedulerError::validation("next_run reset requires an interval schedule")
                })?;
            Ok(Some(Some(Utc::now() + Duration::milliseconds(interval_ms))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::schedules::store::MemoryScheduleStore;
    use crate::kernel::testing::MemoryJobQueue;

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            min_recalculation_interval_ms: 10,
            ..Default::default()
        }
    }

    fn service() -> (ScheduleService, Arc<MemoryJobQueue>) {
        let store = Arc::new(MemoryScheduleStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let service = ScheduleService::new(store, queue.clone(), fast_config());
        (service, queue)
    }

    fn one_off_draft(name: &str) -> ScheduleDraft {
        ScheduleDraft::builder()
            .name(name)
            .schedule_type(ScheduleType::OneOff)
            .job_type("report")
            .next_run_at(Utc::now() + Duration::seconds(3600))
            .build()
    }

    fn interval_draft(name: &str, interval_ms: i64) -> ScheduleDraft {
        ScheduleDraft::builder()
            .name(name)
            .schedule_type(ScheduleType::SequentialInterval)
            .job_type("sync")
            .interval_ms(interval_ms)
            .build()
    }

    #[tokio::test]
    async fn register_rejects_invalid_drafts() {
        let (service, _) = service();

        let missing_next_run = ScheduleDraft::builder()
            .name("r")
            .schedule_type(ScheduleType::Dynamic)
            .job_type("x")
            .build();
        assert!(matches!(
            service.register_schedule(missing_next_run).await,
            Err(SchedulerError::Validation(_))
        ));

        let empty_job_type = ScheduleDraft::builder()
            .name("r")
            .schedule_type(ScheduleType::OneOff)
            .job_type("")
            .next_run_at(Utc::now())
            .build();
        assert!(matches!(
            service.register_schedule(empty_job_type).await,
            Err(SchedulerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn register_duplicate_name_conflicts() {
        let (service, _) = service();
        service.register_schedule(one_off_draft("r")).await.unwrap();
        assert!(matches!(
            service.register_schedule(one_off_draft("r")).await,
            Err(SchedulerError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn pause_requires_active_and_resume_requires_paused() {
        let (service, _) = service();
        service.register_schedule(one_off_draft("r")).await.unwrap();

        assert!(matches!(
            service.resume_schedule("r").await,
            Err(SchedulerError::Conflict(_))
        ));

        let paused = service.pause_schedule("r").await.unwrap();
        assert_eq!(paused.status, ScheduleStatus::Paused);

        assert!(matches!(
            service.pause_schedule("r").await,
            Err(SchedulerError::Conflict(_))
        ));

        let resumed = service.resume_schedule("r").await.unwrap();
        assert_eq!(resumed.status, ScheduleStatus::Active);
    }

    #[tokio::test]
    async fn pause_resume_preserves_one_off_next_run() {
        let (service, _) = service();
        let created = service.register_schedule(one_off_draft("r")).await.unwrap();
        let target = created.next_run_at.unwrap();

        service.pause_schedule("r").await.unwrap();
        let paused = service.get_schedule("r").await.unwrap();
        assert_eq!(paused.next_run_at, Some(target));

        let resumed = service.resume_schedule("r").await.unwrap();
        assert_eq!(resumed.next_run_at, Some(target));
    }

    #[tokio::test]
    async fn resume_resets_interval_next_run() {
        let (service, _) = service();
        service
            .register_schedule(interval_draft("s", 5_000))
            .await
            .unwrap();
        service.pause_schedule("s").await.unwrap();

        let before = Utc::now();
        let resumed = service.resume_schedule("s").await.unwrap();
        let next = resumed.next_run_at.unwrap();
        assert!(next >= before + Duration::milliseconds(4_800));
        assert!(next <= Utc::now() + Duration::milliseconds(5_200));
    }

    #[tokio::test]
    async fn update_rejects_interval_on_non_interval_types() {
        let (service, _) = service();
        service.register_schedule(one_off_draft("r")).await.unwrap();

        let update = ScheduleUpdate {
            interval_ms: Some(1_000),
            ..Default::default()
        };
        assert!(matches!(
            service.update_schedule("r", update).await,
            Err(SchedulerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn update_interval_resets_next_run_by_default() {
        let (service, _) = service();
        service
            .register_schedule(interval_draft("s", 5_000))
            .await
            .unwrap();

        let before = Utc::now();
        let updated = service
            .update_schedule(
                "s",
                ScheduleUpdate {
                    interval_ms: Some(60_000),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.interval_ms, Some(60_000));
        let next = updated.next_run_at.unwrap();
        assert!(next >= before + Duration::milliseconds(59_000));
    }

    #[tokio::test]
    async fn update_interval_preserve_keeps_next_run() {
        let (service, _) = service();
        let created = service
            .register_schedule(interval_draft("s", 5_000))
            .await
            .unwrap();
        let original_next = created.next_run_at;

        let updated = service
            .update_schedule(
                "s",
                ScheduleUpdate {
                    interval_ms: Some(60_000),
                    next_run: Some(NextRunPolicy::Preserve),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.next_run_at, original_next);
    }

    #[tokio::test]
    async fn update_explicit_next_run() {
        let (service, _) = service();
        service.register_schedule(one_off_draft("r")).await.unwrap();

        let target = Utc::now() + Duration::seconds(120);
        let updated = service
            .update_schedule(
                "r",
                ScheduleUpdate {
                    next_run: Some(NextRunPolicy::Explicit(target)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.next_run_at, Some(target));
    }

    #[tokio::test]
    async fn empty_update_only_bumps_updated_at() {
        let (service, _) = service();
        let created = service.register_schedule(one_off_draft("r")).await.unwrap();

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        let updated = service
            .update_schedule("r", ScheduleUpdate::default())
            .await
            .unwrap();

        assert!(updated.updated_at > created.updated_at);
        assert_eq!(updated.next_run_at, created.next_run_at);
        assert_eq!(updated.status, created.status);
    }

    #[tokio::test]
    async fn trigger_now_rejects_terminal_schedules() {
        let (service, queue) = service();
        service.register_schedule(one_off_draft("r")).await.unwrap();

        service.trigger_now("r").await.unwrap();
        assert_eq!(queue.enqueue_count(), 1);
        let fired = service.get_schedule("r").await.unwrap();
        assert_eq!(fired.status, ScheduleStatus::Completed);

        assert!(matches!(
            service.trigger_now("r").await,
            Err(SchedulerError::Conflict(_))
        ));
        assert_eq!(queue.enqueue_count(), 1);
    }

    #[tokio::test]
    async fn trigger_now_rejects_in_flight_sequential() {
        let (service, queue) = service();
        service
            .register_schedule(interval_draft("s", 60_000))
            .await
            .unwrap();

        service.trigger_now("s").await.unwrap();
        let fired = service.get_schedule("s").await.unwrap();
        assert!(fired.active_job_id.is_some());

        assert!(matches!(
            service.trigger_now("s").await,
            Err(SchedulerError::Conflict(_))
        ));
        assert_eq!(queue.enqueue_count(), 1);
    }

    #[tokio::test]
    async fn delete_cancels_in_flight_job() {
        let (service, queue) = service();
        service
            .register_schedule(interval_draft("s", 60_000))
            .await
            .unwrap();
        service.trigger_now("s").await.unwrap();
        let job_id = service
            .get_schedule("s")
            .await
            .unwrap()
            .active_job_id
            .unwrap();

        assert!(service.delete_schedule("s").await.unwrap());
        let job = queue.get_job_sync(job_id).unwrap();
        assert!(job.status.is_terminal());
        assert!(matches!(
            service.get_schedule("s").await,
            Err(SchedulerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn start_twice_is_a_conflict() {
        let (service, _) = service();
        service.start().await.unwrap();
        assert!(matches!(
            service.start().await,
            Err(SchedulerError::Conflict(_))
        ));
        service.stop().await;
    }
}
