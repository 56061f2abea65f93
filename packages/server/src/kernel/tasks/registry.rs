//! Handler registry for task execution.
//!
//! The registry maps task type strings (e.g. "cleanup_expired") to handler
//! descriptors: the async handler itself plus an optional precondition,
//! timeout override, and failure-threshold override. This lets the task
//! engine claim due tasks and dispatch them without knowing concrete types.
//!
//! Population normally happens before the service starts; additional
//! registrations while running are permitted.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::kernel::error::{Result, SchedulerError};

use super::model::Task;

/// Outcome of a single handler invocation.
#[derive(Debug, Clone, Default)]
pub struct TaskRunResult {
    pub success: bool,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    /// Explicit override for the task's next firing time. Takes precedence
    /// over the schedule-type default.
    pub next_run_at: Option<DateTime<Utc>>,
}

impl TaskRunResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn ok_with(result: serde_json::Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_next_run_at(mut self, next_run_at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(next_run_at);
        self
    }
}

/// Type alias for the boxed async handler function.
///
/// Handlers receive an immutable task snapshot and a cancellation token they
/// are expected to observe; cancellation is cooperative.
pub type TaskHandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<TaskRunResult>> + Send>>;

type BoxedTaskHandler = Arc<dyn Fn(Task, CancellationToken) -> TaskHandlerFuture + Send + Sync>;

type ShouldRunFn = Arc<dyn Fn(&Task) -> bool + Send + Sync>;

/// A registered handler with its execution policy overrides.
#[derive(Clone)]
pub struct HandlerDescriptor {
    run: BoxedTaskHandler,
    should_run: Option<ShouldRunFn>,
    pub timeout_ms: Option<u64>,
    pub max_consecutive_failures: Option<i32>,
}

impl HandlerDescriptor {
    /// Wrap an async handler function.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Task, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<TaskRunResult>> + Send + 'static,
    {
        let run: BoxedTaskHandler = Arc::new(move |task, cancel| -> TaskHandlerFuture {
            Box::pin(handler(task, cancel))
        });
        Self {
            run,
            should_run: None,
            timeout_ms: None,
            max_consecutive_failures: None,
        }
    }

    /// Skip execution (but still advance the schedule) when the precondition
    /// returns false.
    pub fn with_should_run<F>(mut self, should_run: F) -> Self
    where
        F: Fn(&Task) -> bool + Send + Sync + 'static,
    {
        self.should_run = Some(Arc::new(should_run));
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_consecutive_failures(mut self, max: i32) -> Self {
        self.max_consecutive_failures = Some(max);
        self
    }

    /// Evaluate the precondition; absent means "run".
    pub fn should_run(&self, task: &Task) -> bool {
        self.should_run.as_ref().map_or(true, |f| f(task))
    }

    /// Invoke the handler.
    pub fn invoke(&self, task: Task, cancel: CancellationToken) -> TaskHandlerFuture {
        (self.run)(task, cancel)
    }
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("has_should_run", &self.should_run.is_some())
            .field("timeout_ms", &self.timeout_ms)
            .field("max_consecutive_failures", &self.max_consecutive_failures)
            .finish()
    }
}

/// Process-wide mapping from task type to handler descriptor.
///
/// Reads vastly outnumber writes; a `std::sync::RwLock` is enough. Poisoned
/// locks are recovered since the map is plain data.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<HandlerDescriptor>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor. Fails with a conflict if the type is taken.
    pub fn register(
        &self,
        task_type: impl Into<String>,
        descriptor: HandlerDescriptor,
    ) -> Result<()> {
        let task_type = task_type.into();
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.contains_key(&task_type) {
            return Err(SchedulerError::conflict(format!(
                "handler already registered for task type \"{}\"",
                task_type
            )));
        }
        handlers.insert(task_type, Arc::new(descriptor));
        Ok(())
    }

    /// Convenience: register a bare handler function with no overrides.
    pub fn register_fn<F, Fut>(&self, task_type: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(Task, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<TaskRunResult>> + Send + 'static,
    {
        self.register(task_type, HandlerDescriptor::new(handler))
    }

    /// Remove a registration. Idempotent; returns whether one was removed.
    pub fn unregister(&self, task_type: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_type)
            .is_some()
    }

    pub fn has(&self, task_type: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(task_type)
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<HandlerDescriptor>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_type)
            .cloned()
    }

    /// All registered task types.
    pub fn registered_types(&self) -> Vec<String> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}
