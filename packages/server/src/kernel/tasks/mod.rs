//! Task subsystem: self-executing records dispatched to in-process handlers.

pub mod model;
pub mod registry;
pub mod service;
pub mod store;

pub use model::{RunOutcome, StorageMode, Task, TaskDraft, TaskPatch, TaskScheduleType, TaskStatus};
pub use registry::{HandlerDescriptor, HandlerRegistry, TaskRunResult};
pub use service::TaskService;
pub use store::{MemoryTaskStore, PostgresTaskStore, TaskStore};
