//! Schedule subsystem: declarative records that enqueue jobs on time.

pub mod model;
pub mod service;
pub mod store;

pub use model::{
    next_run_from_result, parse_payload, NextRunPolicy, Schedule, ScheduleDraft, SchedulePatch,
    ScheduleStatus, ScheduleType, ScheduleUpdate,
};
pub use service::ScheduleService;
pub use store::{MemoryScheduleStore, PostgresScheduleStore, ScheduleStore};
