//! Used-storage refresh and reservation resizing.

use std::collections::HashMap;

use shardgrid_events::FleetEvent;
use shardgrid_placement::refreshed_reservation;
use shardgrid_state::*;
use tracing::debug;

use crate::context::ReconcileContext;
use crate::error::ReconcileResult;
use crate::outcome::{WorkerOutcome, split_batch};

/// Recompute usage and reservation for indices indexed since their last
/// refresh.
pub fn update_index_used_storage_bytes(
    store: &StateStore,
    ctx: &ReconcileContext,
) -> ReconcileResult<WorkerOutcome> {
    let (affected, more) = refresh_indices(store, ctx, |w, limit| {
        scopes::indices_with_stale_used_storage(w, limit)
    })?;
    Ok(WorkerOutcome::new("update_index_used_storage_bytes")
        .with_affected(affected)
        .then_if(more, FleetEvent::UpdateIndexUsedStorageBytes))
}

/// Shrink ready indices whose reservation is well above their usage.
pub fn force_update_overprovisioned(
    store: &StateStore,
    ctx: &ReconcileContext,
) -> ReconcileResult<WorkerOutcome> {
    let (affected, more) = refresh_indices(store, ctx, |w, limit| {
        scopes::overprovisioned_ready_indices(w, limit)
    })?;
    Ok(WorkerOutcome::new("force_update_overprovisioned")
        .with_affected(affected)
        .then_if(more, FleetEvent::ForceUpdateOverprovisionedIndex))
}

/// Σ `size_bytes` of the index's non-deleted repositories, never below 1 KiB.
fn used_bytes<R: TableReader>(r: &R, index_id: IndexId) -> StateResult<i64> {
    let used: i64 = r
        .scan(
            |repo: &Repository| {
                repo.index_id == index_id && repo.state != RepositoryState::Deleted
            },
            None,
        )?
        .iter()
        .map(|repo| repo.size_bytes)
        .sum();
    Ok(if used > 0 {
        used
    } else {
        DEFAULT_USED_STORAGE_BYTES
    })
}

/// Refresh one batch from `scope`. Growth on a node is charged against its
/// unclaimed storage as the batch proceeds, so two indices on the same node
/// cannot both claim the same free bytes.
fn refresh_indices(
    store: &StateStore,
    ctx: &ReconcileContext,
    scope: impl FnOnce(&WriteScope, usize) -> StateResult<Vec<Index>>,
) -> ReconcileResult<(usize, bool)> {
    let cap = ctx.limits().storage_refresh_batch;
    let result = store.write(|w| {
        let (batch, more) = split_batch(scope(w, cap + 1)?, cap);
        if batch.is_empty() {
            return Ok((0, more));
        }

        let reserved = scopes::node_reserved_bytes(w)?;
        let mut unclaimed: HashMap<NodeId, i64> = w
            .all::<Node>()?
            .into_iter()
            .map(|n| (n.id, n.total_bytes - reserved.get(&n.id).copied().unwrap_or(0)))
            .collect();

        let refreshed = batch.len();
        for mut index in batch {
            let used = used_bytes(w, index.id)?;
            let available = unclaimed.get(&index.node_id).copied().unwrap_or(0);
            let new_reserved = refreshed_reservation(&index, used, available);
            if let Some(node_unclaimed) = unclaimed.get_mut(&index.node_id) {
                *node_unclaimed -= new_reserved - index.reserved_storage_bytes;
            }
            debug!(
                index_id = index.id,
                used,
                reserved = new_reserved,
                previous = index.reserved_storage_bytes,
                "index storage refreshed"
            );

            index.used_storage_bytes = used;
            index.reserved_storage_bytes = new_reserved;
            index.watermark_level = WatermarkLevel::for_usage(used, new_reserved);
            index.used_storage_bytes_updated_at = ctx.now;
            index.used_storage_stale = false;
            index.updated_at = ctx.now;
            w.put(&index)?;
        }
        Ok((refreshed, more))
    })?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::tasks::task_done;
    use crate::workers::testing::*;

    fn sized_repos(fleet: &Fleet, index: &Index, sizes: &[i64]) {
        for (repo, size) in fleet
            .repos(index, sizes.len(), RepositoryState::Ready)
            .into_iter()
            .zip(sizes)
        {
            fleet
                .store
                .bulk_update(&[repo.id], |r: &mut Repository| r.size_bytes = *size)
                .unwrap();
        }
    }

    fn mark_indexed(fleet: &Fleet, index: &Index, at: u64) {
        fleet
            .store
            .bulk_update(&[index.id], |i: &mut Index| {
                i.last_indexed_at = at;
                i.used_storage_stale = true;
            })
            .unwrap();
    }

    #[test]
    fn stale_index_grows_to_ideal() {
        let fleet = Fleet::new();
        let node = fleet.node("node-1", 10_000);
        let index = fleet.index_on(&node, 1, 1_000, IndexState::Ready);
        sized_repos(&fleet, &index, &[500, 300]);
        mark_indexed(&fleet, &index, T0);
        let ctx = fleet.ctx_at(T0 + 5);

        let outcome = update_index_used_storage_bytes(&fleet.store, &ctx).unwrap();
        assert_eq!(outcome.affected, 1);
        let index = fleet.index(index.id);
        assert_eq!(index.used_storage_bytes, 800);
        assert_eq!(index.reserved_storage_bytes, 2_000);
        assert_eq!(index.watermark_level, WatermarkLevel::Healthy);
        assert_eq!(index.used_storage_bytes_updated_at, T0 + 5);

        assert_eq!(
            update_index_used_storage_bytes(&fleet.store, &ctx)
                .unwrap()
                .affected,
            0
        );
    }

    #[test]
    fn growth_bounded_by_node_capacity() {
        let fleet = Fleet::new();
        let node = fleet.node("node-1", 1_200);
        let index = fleet.index_on(&node, 1, 1_000, IndexState::Ready);
        sized_repos(&fleet, &index, &[800]);
        mark_indexed(&fleet, &index, T0);

        update_index_used_storage_bytes(&fleet.store, &fleet.ctx_at(T0 + 1)).unwrap();
        let index = fleet.index(index.id);
        assert_eq!(index.reserved_storage_bytes, 1_200);
        assert_eq!(index.watermark_level, WatermarkLevel::LowWatermarkExceeded);
    }

    #[test]
    fn siblings_share_remaining_capacity() {
        let fleet = Fleet::new();
        let node = fleet.node("node-1", 2_500);
        let a = fleet.index_on(&node, 1, 1_000, IndexState::Ready);
        let b = fleet.index_on(&node, 2, 1_000, IndexState::Ready);
        sized_repos(&fleet, &a, &[800]);
        sized_repos(&fleet, &b, &[800]);
        mark_indexed(&fleet, &a, T0);
        mark_indexed(&fleet, &b, T0);

        update_index_used_storage_bytes(&fleet.store, &fleet.ctx_at(T0 + 1)).unwrap();
        let total: i64 = [a.id, b.id]
            .iter()
            .map(|id| fleet.index(*id).reserved_storage_bytes)
            .sum();
        assert_eq!(total, 2_500);
    }

    #[test]
    fn empty_index_counts_one_kib() {
        let fleet = Fleet::new();
        let node = fleet.node("node-1", 1_000_000);
        let index = fleet.index_on(&node, 1, 100, IndexState::Initializing);
        mark_indexed(&fleet, &index, T0);

        update_index_used_storage_bytes(&fleet.store, &fleet.ctx_at(T0 + 1)).unwrap();
        let index = fleet.index(index.id);
        assert_eq!(index.used_storage_bytes, DEFAULT_USED_STORAGE_BYTES);
        assert_eq!(index.reserved_storage_bytes, ideal_reservation(1024));
    }

    #[test]
    fn overprovisioned_ready_index_shrinks_once() {
        let fleet = Fleet::new();
        let node = fleet.node("node-1", 100_000);
        let index = fleet.index_on(&node, 1, 10_000, IndexState::Ready);
        sized_repos(&fleet, &index, &[2_000]);
        fleet
            .store
            .bulk_update(&[index.id], |i: &mut Index| {
                i.used_storage_bytes = 100;
                i.watermark_level = WatermarkLevel::Overprovisioned;
            })
            .unwrap();
        let ctx = fleet.ctx();

        let outcome = force_update_overprovisioned(&fleet.store, &ctx).unwrap();
        assert_eq!(outcome.affected, 1);
        let refreshed = fleet.index(index.id);
        assert_eq!(refreshed.reserved_storage_bytes, 5_000);
        assert_eq!(refreshed.watermark_level, WatermarkLevel::Healthy);

        assert_eq!(
            force_update_overprovisioned(&fleet.store, &ctx).unwrap().affected,
            0
        );
    }

    #[test]
    fn results_within_one_second_are_all_counted() {
        let fleet = Fleet::new();
        let node = fleet.node("node-1", 1_000_000);
        let index = fleet.index_on(&node, 1, 100_000, IndexState::Initializing);
        let repos = fleet.repos(&index, 2, RepositoryState::InProgress);
        let first = fleet.task(&repos[0], node.id, TaskType::IndexRepo);
        let second = fleet.task(&repos[1], node.id, TaskType::IndexRepo);
        let ctx = fleet.ctx_at(T0 + 10);

        task_done(&fleet.store, &ctx, first.id, 10_000).unwrap();
        assert_eq!(update_index_used_storage_bytes(&fleet.store, &ctx).unwrap().affected, 1);
        assert_eq!(fleet.index(index.id).used_storage_bytes, 10_000);

        task_done(&fleet.store, &ctx, second.id, 20_000).unwrap();
        assert_eq!(update_index_used_storage_bytes(&fleet.store, &ctx).unwrap().affected, 1);
        let refreshed = fleet.index(index.id);
        assert_eq!(refreshed.used_storage_bytes, 30_000);
        assert!(!refreshed.used_storage_stale);

        assert_eq!(update_index_used_storage_bytes(&fleet.store, &ctx).unwrap().affected, 0);
    }
}
