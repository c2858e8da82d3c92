//! shardgrid-dispatch — turns repositories that need work into tasks.
//!
//! The [`TaskDispatcher`] binds a repository to the node hosting its index
//! and queues a [`Task`](shardgrid_state::Task) for the node agent. It also
//! owns the agent side of the task lifecycle: agents claim pending tasks and
//! report them done or failed, which publishes the matching event.
//!
//! # Architecture
//!
//! ```text
//! reconcile worker ──create_tasks_for──▶ TaskDispatcher ──▶ tasks table
//!                                             ▲
//! node agent ──claim_tasks / report_*─────────┘──▶ EventBus (TaskDone/TaskFailed)
//! ```

pub mod dispatcher;
pub mod error;

pub use dispatcher::{DispatchOutcome, TaskDispatcher};
pub use error::{DispatchError, DispatchResult};
