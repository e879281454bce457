//! Reservation error types.

use capgrid_state::StateError;
use capgrid_task::TaskError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-checkable class of a terminal reservation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    NoCandidate,
    ProfileResolution,
    ConstraintUnsatisfied,
    PlacementFailure,
    ReservationConflict,
    CollaboratorUnavailable,
}

/// Why a reservation failed. Carried to the caller by the terminal callback.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", content = "reason", rename_all = "snake_case")]
pub enum ReservationError {
    #[error("invalid reservation request: {0}")]
    Validation(String),

    #[error("no candidate placements: {0}")]
    NoCandidate(String),

    #[error("profile resolution failed: {0}")]
    ProfileResolution(String),

    #[error("placement constraints unsatisfied: {0}")]
    ConstraintUnsatisfied(String),

    #[error("placement failed: {0}")]
    PlacementFailure(String),

    #[error("no placement could be committed: {0}")]
    ReservationConflict(String),

    #[error("collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),
}

impl ReservationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ReservationError::Validation(_) => ErrorClass::Validation,
            ReservationError::NoCandidate(_) => ErrorClass::NoCandidate,
            ReservationError::ProfileResolution(_) => ErrorClass::ProfileResolution,
            ReservationError::ConstraintUnsatisfied(_) => ErrorClass::ConstraintUnsatisfied,
            ReservationError::PlacementFailure(_) => ErrorClass::PlacementFailure,
            ReservationError::ReservationConflict(_) => ErrorClass::ReservationConflict,
            ReservationError::CollaboratorUnavailable(_) => ErrorClass::CollaboratorUnavailable,
        }
    }

    /// Human-readable reason without the class prefix.
    pub fn reason(&self) -> &str {
        match self {
            ReservationError::Validation(r)
            | ReservationError::NoCandidate(r)
            | ReservationError::ProfileResolution(r)
            | ReservationError::ConstraintUnsatisfied(r)
            | ReservationError::PlacementFailure(r)
            | ReservationError::ReservationConflict(r)
            | ReservationError::CollaboratorUnavailable(r) => r,
        }
    }
}

impl From<TaskError> for ReservationError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Validation(reason) => ReservationError::Validation(reason),
            TaskError::Closed(_) => ReservationError::CollaboratorUnavailable(err.to_string()),
        }
    }
}

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    /// Transport-level failure; never retried at this layer.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A conditional commit was rejected.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The collaborator answered but could not satisfy the request.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl CollaboratorError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CollaboratorError::Unavailable(_))
    }
}

impl From<StateError> for CollaboratorError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Conflict(reason) => CollaboratorError::Conflict(reason),
            StateError::NotFound(what) => CollaboratorError::NotFound(what),
            other => CollaboratorError::Unavailable(other.to_string()),
        }
    }
}
