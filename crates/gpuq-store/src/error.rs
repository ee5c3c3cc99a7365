//! Store error types

use gpuq_core::{GpuqError, TaskId, TaskState};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),

    /// A row that does not decode into a domain value
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("task {id} in {state} state can not be {action}")]
    InvalidState {
        id: TaskId,
        state: TaskState,
        action: &'static str,
    },

    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: TaskState, to: TaskState },

    #[error("invalid input: {0}")]
    Validation(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for GpuqError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TaskNotFound(id) => GpuqError::TaskNotFound(id),
            StoreError::InvalidState { id, state, action } => {
                GpuqError::InvalidState { id, state, action }
            }
            StoreError::Validation(msg) => GpuqError::Validation(msg),
            StoreError::IllegalTransition { from, to } => {
                GpuqError::Internal(format!("illegal transition {} -> {}", from, to))
            }
            StoreError::Io(e) => GpuqError::Io(e),
            other => GpuqError::Storage(other.to_string()),
        }
    }
}

impl From<GpuqError> for StoreError {
    fn from(err: GpuqError) -> Self {
        match err {
            GpuqError::Validation(msg) => StoreError::Validation(msg),
            other => StoreError::Corrupt(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_errors_survive_conversion() {
        let err: GpuqError = StoreError::InvalidState {
            id: 3,
            state: TaskState::Running,
            action: "deleted",
        }
        .into();
        assert_eq!(err.to_string(), "task 3 in running state can not be deleted");

        let err: GpuqError = StoreError::TaskNotFound(9).into();
        assert!(matches!(err, GpuqError::TaskNotFound(9)));
    }

    #[test]
    fn test_database_errors_become_storage() {
        let err: GpuqError = StoreError::Corrupt("bad state".to_string()).into();
        assert!(matches!(err, GpuqError::Storage(_)));
    }
}
