// Crude Functions - Scheduling Core
//
// This crate decides when background work runs and delegates how it runs to
// an external job queue. Schedules are timer-driven and job-queue-backed;
// tasks are poll-driven and executed by in-process handlers registered in
// the handler registry. Both survive process crashes through claim-based
// concurrency control and startup recovery.

pub mod common;
pub mod config;
pub mod kernel;

pub use config::{Config, SchedulerConfig};
