//! Turning pending repositories into tasks.

use shardgrid_dispatch::{DispatchOutcome, TaskDispatcher};
use shardgrid_events::FleetEvent;
use shardgrid_state::*;

use crate::context::ReconcileContext;
use crate::error::ReconcileResult;
use crate::outcome::{WorkerOutcome, split_batch};
use crate::workers::orphans::mark_repos_pending_deletion;

/// Queue index tasks for pending repositories on indexable indices.
pub fn dispatch_repos_to_index(
    store: &StateStore,
    ctx: &ReconcileContext,
    dispatcher: &TaskDispatcher,
) -> ReconcileResult<WorkerOutcome> {
    let cap = ctx.limits().dispatch_batch;
    let (batch, more) = split_batch(store.read(|r| scopes::repos_to_index(r, cap + 1))?, cap);
    let outcome = dispatcher.create_tasks_for(&ctx.flags, &batch, TaskType::IndexRepo, ctx.now)?;
    Ok(schedule_next(
        WorkerOutcome::new("dispatch_repos_to_index"),
        outcome,
        batch.len(),
        more,
        FleetEvent::RepoToIndex,
    ))
}

/// Move orphaned repositories to `pending_deletion`, then queue delete
/// tasks for repositories awaiting deletion.
pub fn dispatch_repos_to_delete(
    store: &StateStore,
    ctx: &ReconcileContext,
    dispatcher: &TaskDispatcher,
) -> ReconcileResult<WorkerOutcome> {
    let (marked, more_orphans) = mark_repos_pending_deletion(store, ctx)?;

    let cap = ctx.limits().dispatch_batch;
    let (batch, more) = split_batch(store.read(|r| scopes::repos_to_delete(r, cap + 1))?, cap);
    let outcome = dispatcher.create_tasks_for(&ctx.flags, &batch, TaskType::DeleteRepo, ctx.now)?;
    let mut next = schedule_next(
        WorkerOutcome::new("dispatch_repos_to_delete"),
        outcome,
        batch.len(),
        more || more_orphans,
        FleetEvent::RepoToDelete,
    );
    next.affected += marked;
    Ok(next)
}

/// Chain while progress is being made; back off when the dispatcher
/// deferred or skipped candidates.
fn schedule_next(
    worker: WorkerOutcome,
    outcome: DispatchOutcome,
    candidates: usize,
    more: bool,
    event: FleetEvent,
) -> WorkerOutcome {
    match outcome {
        DispatchOutcome::Paused => worker,
        DispatchOutcome::Deferred { .. } => worker.later(event),
        DispatchOutcome::Created(created) => {
            let worker = worker.with_affected(created);
            if created > 0 && more {
                worker.then(event)
            } else if created < candidates {
                worker.later(event)
            } else {
                worker
            }
        }
    }
}
