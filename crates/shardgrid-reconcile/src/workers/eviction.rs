//! Pending-eviction marking, eviction, and storage-pressure rebalancing.

use std::collections::{BTreeSet, HashSet};

use shardgrid_events::FleetEvent;
use shardgrid_placement::select_for_eviction;
use shardgrid_state::*;
use tracing::{info, warn};

use crate::context::ReconcileContext;
use crate::error::ReconcileResult;
use crate::outcome::{WorkerOutcome, bulk_transition, split_batch};

/// Orphaned indices, and ready indices past the critical watermark, become
/// `pending_eviction`.
pub fn mark_indices_pending_eviction(
    store: &StateStore,
    ctx: &ReconcileContext,
) -> ReconcileResult<WorkerOutcome> {
    let (affected, more) = bulk_transition(
        store,
        ctx.limits().pending_eviction_batch,
        |w, limit| scopes::indices_to_mark_pending_eviction(w, limit),
        |index: &mut Index| {
            index.state = IndexState::PendingEviction;
            index.updated_at = ctx.now;
        },
    )?;
    Ok(WorkerOutcome::new("mark_indices_pending_eviction")
        .with_affected(affected)
        .then_if(more, FleetEvent::IndexMarkPendingEviction)
        .then_if(affected > 0, FleetEvent::IndexToEvict))
}

struct EvictionPass {
    evicted: usize,
    marked_to_delete: usize,
    replicas_deleted: usize,
    more: bool,
}

/// Evict a batch of `pending_eviction` indices.
///
/// An index whose `EnabledNamespace` still exists becomes `evicted`;
/// otherwise the namespace was offboarded and it becomes `marked_to_delete`.
/// Detached replicas are deleted in the same transaction, once each, when
/// no other index still points at them.
pub fn evict_indices(store: &StateStore, ctx: &ReconcileContext) -> ReconcileResult<WorkerOutcome> {
    let cap = ctx.limits().eviction_batch;
    let pass = store.write(|w| {
        let (batch, more) = split_batch(scopes::indices_to_evict(w, cap + 1)?, cap);
        let enabled: HashSet<EnabledNamespaceId> = w
            .all::<EnabledNamespace>()?
            .into_iter()
            .map(|e| e.id)
            .collect();

        let mut pass = EvictionPass {
            evicted: 0,
            marked_to_delete: 0,
            replicas_deleted: 0,
            more,
        };
        let mut detached: BTreeSet<ReplicaId> = BTreeSet::new();
        for mut index in batch {
            let namespace_enabled = index
                .enabled_namespace_id
                .is_some_and(|id| enabled.contains(&id));
            if namespace_enabled {
                index.state = IndexState::Evicted;
                pass.evicted += 1;
            } else {
                index.state = IndexState::MarkedToDelete;
                pass.marked_to_delete += 1;
            }
            if let Some(replica_id) = index.replica_id.take() {
                detached.insert(replica_id);
            }
            index.updated_at = ctx.now;
            w.put(&index)?;
        }

        if !detached.is_empty() {
            let still_used: HashSet<ReplicaId> = w
                .scan(
                    |i: &Index| i.replica_id.is_some_and(|id| detached.contains(&id)),
                    None,
                )?
                .into_iter()
                .filter_map(|i| i.replica_id)
                .collect();
            let unused: Vec<ReplicaId> = detached
                .into_iter()
                .filter(|id| !still_used.contains(id))
                .collect();
            pass.replicas_deleted = w.remove_many::<Replica>(&unused)?;
        }
        Ok(pass)
    })?;

    if pass.evicted + pass.marked_to_delete > 0 {
        info!(
            evicted = pass.evicted,
            marked_to_delete = pass.marked_to_delete,
            replicas_deleted = pass.replicas_deleted,
            "indices evicted"
        );
    }
    Ok(WorkerOutcome::new("evict_indices")
        .with_affected(pass.evicted + pass.marked_to_delete)
        .then_if(pass.more, FleetEvent::IndexToEvict)
        .then_if(pass.evicted > 0, FleetEvent::OrphanedRepo)
        .then_if(pass.marked_to_delete > 0, FleetEvent::IndexMarkedToDelete))
}

/// Free storage on over-committed nodes.
///
/// For each node (all over-committed nodes when `node_ids` is empty) the
/// deficit is re-derived from current reservations, net of indices already
/// pending eviction; indices are then
/// picked largest first until the deficit is covered or
/// `limits.max_indices_to_evict` is reached, and marked `pending_eviction`.
pub fn rebalance_node_storage(
    store: &StateStore,
    ctx: &ReconcileContext,
    node_ids: &[NodeId],
) -> ReconcileResult<WorkerOutcome> {
    let max_indices = ctx.limits().max_indices_to_evict;
    let marked = store.write(|w| {
        let over_committed = scopes::nodes_with_negative_unclaimed_storage(w)?;
        let mut marked = 0;
        for (node, unclaimed) in over_committed {
            if !node_ids.is_empty() && !node_ids.contains(&node.id) {
                continue;
            }
            let candidates = w.scan(|i: &Index| i.node_id == node.id, None)?;
            // Reservations already on their way out count as freed.
            let in_flight: i64 = candidates
                .iter()
                .filter(|i| i.state == IndexState::PendingEviction)
                .map(|i| i.reserved_storage_bytes)
                .sum();
            let deficit = -unclaimed - in_flight;
            if deficit <= 0 {
                continue;
            }
            let selection = select_for_eviction(&candidates, deficit, max_indices);
            if !selection.covers(deficit) {
                warn!(
                    node_id = node.id,
                    deficit,
                    freed = selection.freed_bytes,
                    "eviction cap reached before deficit was covered"
                );
            }
            marked += w.update_many(&selection.index_ids, |index: &mut Index| {
                index.state = IndexState::PendingEviction;
                index.updated_at = ctx.now;
            })?;
            info!(
                node_id = node.id,
                deficit,
                indices = selection.index_ids.len(),
                freed = selection.freed_bytes,
                "storage pressure rebalanced"
            );
        }
        Ok(marked)
    })?;
    Ok(WorkerOutcome::new("rebalance_node_storage")
        .with_affected(marked)
        .then_if(marked > 0, FleetEvent::IndexToEvict))
}
