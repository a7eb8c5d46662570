//! Domain error model.

use thiserror::Error;

use crate::job::JobState;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Covers deterministic failures of the job model (malformed specs, illegal
/// state transitions). Storage and process failures live in `queuectl-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed job spec).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (empty, too long, bad characters).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A state could not be parsed from its textual form.
    #[error("unknown job state: {0}")]
    UnknownState(String),

    /// A lifecycle transition that the state machine does not allow.
    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition { from: JobState, to: JobState },

    /// The job is leased by a different worker.
    #[error("job is not owned by worker {0}")]
    NotOwner(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn illegal(from: JobState, to: JobState) -> Self {
        Self::IllegalTransition { from, to }
    }
}
