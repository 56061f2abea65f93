// Kernel - the scheduling core infrastructure.
//
// The kernel decides WHEN background work runs and delegates HOW it runs:
// schedules hand jobs to the external queue, tasks dispatch to in-process
// handlers. Domain logic belongs to the handlers, not here.

pub mod error;
pub mod job_queue;
pub mod schedules;
pub mod tasks;
pub mod testing;

pub use error::{Result, SchedulerError};
pub use job_queue::{
    CompletionKind, JobCompletion, JobQueue, JobQueueStatus, JobRequest, PostgresJobQueue,
    QueuedJob,
};
pub use schedules::{
    NextRunPolicy, Schedule, ScheduleDraft, ScheduleService, ScheduleStatus, ScheduleStore,
    ScheduleType, ScheduleUpdate,
};
pub use tasks::{
    HandlerDescriptor, HandlerRegistry, StorageMode, Task, TaskDraft, TaskRunResult,
    TaskScheduleType, TaskService, TaskStatus, TaskStore,
};
