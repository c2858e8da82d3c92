//! Reconciliation error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("state store error: {0}")]
    State(#[from] shardgrid_state::StateError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] shardgrid_dispatch::DispatchError),
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
