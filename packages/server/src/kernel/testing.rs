//! Testing utilities for the scheduling kernel.
//!
//! [`MemoryJobQueue`] stands in for the external job queue: it records every
//! enqueue for inspection and lets tests drive jobs to terminal statuses,
//! firing completion subscriptions exactly like a real queue would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::error::{Result, SchedulerError};
use super::job_queue::{
    JobCompletion, JobQueue, JobQueueStatus, JobRequest, QueuedJob,
};

/// In-memory job queue for tests.
pub struct MemoryJobQueue {
    jobs: RwLock<HashMap<Uuid, QueuedJob>>,
    /// Ids in enqueue order, for inspection.
    order: RwLock<Vec<Uuid>>,
    subscribers: Mutex<HashMap<Uuid, Vec<oneshot::Sender<JobCompletion>>>>,
    fail_next_enqueue: AtomicBool,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            subscribers: Mutex::new(HashMap::new()),
            fail_next_enqueue: AtomicBool::new(false),
        }
    }

    /// Total number of jobs ever enqueued.
    pub fn enqueue_count(&self) -> usize {
        self.order.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// All enqueued jobs, oldest first.
    pub fn enqueued_jobs(&self) -> Vec<QueuedJob> {
        let order = self.order.read().unwrap_or_else(|e| e.into_inner());
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        order.iter().filter_map(|id| jobs.get(id).cloned()).collect()
    }

    /// Enqueued jobs of a given type, oldest first.
    pub fn jobs_of_type(&self, job_type: &str) -> Vec<QueuedJob> {
        self.enqueued_jobs()
            .into_iter()
            .filter(|j| j.job_type == job_type)
            .collect()
    }

    /// Synchronous job lookup for assertions.
    pub fn get_job_sync(&self, id: Uuid) -> Option<QueuedJob> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    /// Remove a job record entirely, simulating queue-side purging.
    pub fn purge_job(&self, id: Uuid) {
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    /// Make the next enqueue call fail, for failure-path tests.
    pub fn fail_next_enqueue(&self) {
        self.fail_next_enqueue.store(true, Ordering::SeqCst);
    }

    /// Drive a job to `completed` with the given result and fire its
    /// completion subscriptions.
    pub fn complete_job(&self, id: Uuid, result: Option<serde_json::Value>) {
        self.finish(id, JobQueueStatus::Completed, result, None);
    }

    /// Drive a job to `failed` and fire its completion subscriptions.
    pub fn fail_job(&self, id: Uuid) {
        self.finish(id, JobQueueStatus::Failed, None, None);
    }

    fn finish(
        &self,
        id: Uuid,
        status: JobQueueStatus,
        result: Option<serde_json::Value>,
        cancel_reason: Option<String>,
    ) {
        let job = {
            let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
            let Some(job) = jobs.get_mut(&id) else {
                return;
            };
            // A job reaches a terminal status at most once.
            if job.status.is_terminal() {
                return;
            }
            job.status = status;
            job.result = result;
            job.cancel_reason = cancel_reason;
            job.updated_at = Utc::now();
            job.clone()
        };
        self.notify(&job);
    }

    fn notify(&self, job: &QueuedJob) {
        let senders = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job.id)
            .unwrap_or_default();
        for sender in senders {
            if let Some(completion) = JobCompletion::from_job(job.clone()) {
                let _ = sender.send(completion);
            }
        }
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, request: JobRequest) -> Result<QueuedJob> {
        if self.fail_next_enqueue.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::Internal(anyhow::anyhow!(
                "enqueue failed (injected)"
            )));
        }
        let now = Utc::now();
        let job = QueuedJob {
            id: Uuid::new_v4(),
            job_type: request.job_type,
            status: JobQueueStatus::Pending,
            payload: request.payload,
            priority: request.priority,
            max_retries: request.max_retries,
            execution_mode: request.execution_mode,
            reference_type: request.reference_type,
            reference_id: request.reference_id,
            result: None,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.id, job.clone());
        self.order
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(job.id);
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<QueuedJob>> {
        Ok(self.get_job_sync(id))
    }

    async fn cancel_job(&self, id: Uuid, reason: &str) -> Result<()> {
        let already_terminal = self
            .get_job_sync(id)
            .map(|j| j.status.is_terminal())
            .unwrap_or(true);
        if !already_terminal {
            self.finish(
                id,
                JobQueueStatus::Cancelled,
                None,
                Some(reason.to_string()),
            );
        }
        Ok(())
    }

    async fn subscribe_completion(&self, id: Uuid) -> Result<oneshot::Receiver<JobCompletion>> {
        let (tx, rx) = oneshot::channel();
        match self.get_job_sync(id) {
            Some(job) if job.status.is_terminal() => {
                if let Some(completion) = JobCompletion::from_job(job) {
                    let _ = tx.send(completion);
                }
            }
            Some(_) => {
                self.subscribers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .entry(id)
                    .or_default()
                    .push(tx);
            }
            // Unknown job: drop the sender so the receiver observes a close.
            None => {}
        }
        Ok(rx)
    }
}
