//! Structured error types for the scheduling kernel.
//!
//! `SchedulerError` provides pattern-matchable errors instead of generic
//! `anyhow::Error` at the service API boundary.
//!
//! # The Error Boundary Rule
//!
//! > Validation, conflict, and not-found errors always escape to the caller.
//! > Handler and job failures never escape a trigger cycle.
//!
//! - `anyhow` is internal transport (ergonomic for handlers)
//! - `SchedulerError` is the only externalized error (structured for callers)

use thiserror::Error;

/// Errors surfaced by the scheduling services.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Bad input at the API boundary. No state change.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Duplicate name, or wrong state for the requested operation. No state change.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Name or id unknown.
    #[error("not found: {0}")]
    NotFound(String),

    /// Storage-layer failure.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Corrupt row, unexpected internal state, or a dependency fault.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SchedulerError {
    /// Build a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Build a conflict error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Build a not-found error for the named entity.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Whether this error indicates a caller mistake (as opposed to a fault).
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Conflict(_) | Self::NotFound(_)
        )
    }
}

/// Result alias used throughout the kernel.
pub type Result<T, E = SchedulerError> = std::result::Result<T, E>;
