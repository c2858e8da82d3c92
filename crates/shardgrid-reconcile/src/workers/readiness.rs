//! Initializing indices become ready once nothing under them is in flight.

use shardgrid_events::FleetEvent;
use shardgrid_state::*;

use crate::context::ReconcileContext;
use crate::error::ReconcileResult;
use crate::outcome::{WorkerOutcome, bulk_transition};

pub fn mark_indices_ready(
    store: &StateStore,
    ctx: &ReconcileContext,
) -> ReconcileResult<WorkerOutcome> {
    let (affected, more) = bulk_transition(
        store,
        ctx.limits().ready_batch,
        |w, limit| scopes::indices_to_mark_ready(w, limit),
        |index: &mut Index| {
            index.state = IndexState::Ready;
            index.updated_at = ctx.now;
        },
    )?;
    Ok(WorkerOutcome::new("mark_indices_ready")
        .with_affected(affected)
        .then_if(more, FleetEvent::MarkIndicesReady))
}
