//! Domain error model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Why an aggregate refused a command.
///
/// A failed scheduled command keeps the error that failed it, so this is
/// serializable alongside the command.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// The command is not allowed in the aggregate's current state.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The command addresses an aggregate that has no events.
    #[error("not found")]
    NotFound,

    /// E.g. creating an aggregate that already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Refused by the configured authorization policy before being handled.
    #[error("unauthorized")]
    Unauthorized,
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }
}
