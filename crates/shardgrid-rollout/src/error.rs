//! Rollout error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("state store error: {0}")]
    State(#[from] shardgrid_state::StateError),

    #[error("rollout lease held by {holder}")]
    LeaseHeld { holder: String },
}

pub type RolloutResult<T> = Result<T, RolloutError>;
