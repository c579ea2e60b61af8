//! Ledger error types.
//!
//! Every operation validates before it mutates, so any error below means
//! the stored state is exactly what it was before the call.

use serde::Serialize;
use thiserror::Error;

use crate::storage::RecordKey;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// The operation would break a budget-conservation rule.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("not found: {0}")]
    NotFound(RecordKey),

    /// The entity's lifecycle state does not permit the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("arithmetic overflow: {0}")]
    ArithmeticOverflow(&'static str),
}

/// Coarse classification of [`LedgerError`], for callers that map errors
/// onto transport status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvariantViolation,
    NotFound,
    InvalidState,
    ArithmeticOverflow,
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvariantViolation(_) => ErrorKind::InvariantViolation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::ArithmeticOverflow(_) => ErrorKind::ArithmeticOverflow,
        }
    }

    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub(crate) fn state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_names_the_full_key() {
        let err = LedgerError::NotFound(RecordKey::Collaborator(2, 0, "alice".into()));
        assert_eq!(
            err.to_string(),
            "not found: project/2/package/0/collaborator/alice"
        );
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn kinds_cover_every_variant() {
        assert_eq!(
            LedgerError::invariant("x").kind(),
            ErrorKind::InvariantViolation
        );
        assert_eq!(LedgerError::state("x").kind(), ErrorKind::InvalidState);
        assert_eq!(
            LedgerError::ArithmeticOverflow("x").kind(),
            ErrorKind::ArithmeticOverflow
        );
    }
}
