//! Error types for the capgrid state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A conditional update was rejected (insufficient capacity).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("inventory error: {0}")]
    Inventory(String),
}

impl StateError {
    /// Whether the error is a rejected conditional commit rather than a
    /// storage failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::Conflict(_) | StateError::NotFound(_))
    }
}
