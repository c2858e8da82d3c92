//! Dispatcher error types.

use shardgrid_state::{TaskId, TaskState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("task {task_id} cannot be reported from state {state:?}")]
    InvalidTransition { task_id: TaskId, state: TaskState },

    #[error("state store error: {0}")]
    State(#[from] shardgrid_state::StateError),
}

pub type DispatchResult<T> = Result<T, DispatchError>;
