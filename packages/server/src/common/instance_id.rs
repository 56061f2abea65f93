//! Process instance identity.
//!
//! An [`InstanceId`] is a short string that is stable for the life of a
//! process and different after every restart. It is the sole mechanism
//! distinguishing "my in-flight task" from "a previous instance's abandoned
//! task" during orphan recovery.

use std::fmt;

use uuid::Uuid;

/// Short, process-lifetime-stable identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceId(String);

impl InstanceId {
    /// Generate a fresh instance id for this process.
    pub fn generate() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(format!("sched-{}", &hex[..8]))
    }

    /// Wrap an existing id (used by tests to simulate a prior instance).
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
