//! Error types for the task module

use std::fmt;

use crate::store::StoreError;

/// Result type for task operations
pub type TaskResult<T> = Result<T, TaskError>;

/// Task-specific errors
#[derive(Debug)]
pub enum TaskError {
    /// No definition registered under this name
    UnknownTask {
        name: String,
    },

    /// A stored payload failed to deserialize into a valid task
    PayloadCorrupt {
        id: String,
        reason: String,
    },

    /// A task body failed during execution
    ExecutionFailed {
        name: String,
        reason: String,
    },

    /// Queue store failure during a queue transition
    Store {
        reason: String,
    },

    /// Serialization/deserialization error
    Serialization {
        reason: String,
    },
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownTask { name } => {
                write!(f, "Unknown task '{}'", name)
            }
            Self::PayloadCorrupt { id, reason } => {
                write!(f, "Corrupt payload for task id '{}': {}", id, reason)
            }
            Self::ExecutionFailed { name, reason } => {
                write!(f, "Task '{}' failed: {}", name, reason)
            }
            Self::Store { reason } => {
                write!(f, "Queue store error: {}", reason)
            }
            Self::Serialization { reason } => {
                write!(f, "Serialization error: {}", reason)
            }
        }
    }
}

impl std::error::Error for TaskError {}

impl TaskError {
    /// Store failures are transient; everything else is terminal
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Store { .. })
    }

    /// Create an execution failure
    pub fn execution(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        Self::Store {
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            reason: err.to_string(),
        }
    }
}
