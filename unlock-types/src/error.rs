//! Error types for unlock-types.

use thiserror::Error;

/// Errors raised while constructing relay types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypesError {
    /// Identifier was empty or whitespace only
    #[error("{0} must not be empty")]
    EmptyIdentifier(&'static str),

    /// Role string was neither `approver` nor `requester`
    #[error("invalid role: {0:?} (expected \"approver\" or \"requester\")")]
    InvalidRole(String),
}
