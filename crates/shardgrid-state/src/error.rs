//! Entity store errors.

use thiserror::Error;

use crate::types::NamespaceId;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open state store: {0}")]
    Open(String),

    /// A redb step failed. `op` names the step (`transaction`, `table`,
    /// `read`, `write`).
    #[error("redb {op} failed: {message}")]
    Storage { op: &'static str, message: String },

    #[error("failed to {op} record: {message}")]
    Codec { op: &'static str, message: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u64 },

    #[error("root namespace {0} is already enabled")]
    AlreadyEnabled(NamespaceId),

    /// Returned by a unit-of-work closure to roll the transaction back.
    #[error("unit of work aborted: {0}")]
    Aborted(String),
}
