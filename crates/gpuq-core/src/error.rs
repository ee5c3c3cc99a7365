//! Error types for gpuq

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::task::{DeviceId, TaskId, TaskState};

/// Main error type for gpuq
#[derive(Error, Debug)]
pub enum GpuqError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rejected user input (bad priority, malformed submission, missing file)
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Task not found
    #[error("no task found by id {0}")]
    TaskNotFound(TaskId),

    /// Operation not permitted in the task's current state
    #[error("task {id} in {state} state can not be {action}")]
    InvalidState {
        id: TaskId,
        state: TaskState,
        action: &'static str,
    },

    /// A device is still held by a live process
    #[error("GPU {device} is still owned by running process {pid}")]
    DeviceConflict { device: DeviceId, pid: u32 },

    /// Another scheduler instance holds the server record
    #[error("server with pid {pid} is running since {since}")]
    AlreadyRunning { pid: u32, since: DateTime<Utc> },

    /// Process launch failure
    #[error("Launch error: {0}")]
    Launch(String),

    /// Blocking wait abandoned because a stop was requested
    #[error("Operation cancelled by stop request")]
    Cancelled,

    /// GPU error
    #[error("GPU error: {0}")]
    Gpu(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for gpuq operations
pub type GpuqResult<T> = Result<T, GpuqError>;

impl From<serde_json::Error> for GpuqError {
    fn from(err: serde_json::Error) -> Self {
        GpuqError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GpuqError::Config("invalid config".to_string());
        assert_eq!(err.to_string(), "Configuration error: invalid config");
    }

    #[test]
    fn test_invalid_state_names_current_state() {
        let err = GpuqError::InvalidState {
            id: 7,
            state: TaskState::Running,
            action: "deleted",
        };
        assert_eq!(err.to_string(), "task 7 in running state can not be deleted");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: GpuqError = io_err.into();
        assert!(matches!(err, GpuqError::Io(_)));
    }
}
