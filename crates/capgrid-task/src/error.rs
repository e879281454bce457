//! Error types for the task runtime.

use thiserror::Error;

/// Result type alias for task runtime operations.
pub type TaskResult<T> = Result<T, TaskError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    /// The task body was rejected before the task was created.
    #[error("invalid task: {0}")]
    Validation(String),

    /// The task's mailbox is gone; it finished and every handle was dropped.
    #[error("task {0} is no longer running")]
    Closed(String),
}
