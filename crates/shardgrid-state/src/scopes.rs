//! Named query scopes.
//!
//! Each function is the transition guard of one state machine edge: a worker
//! reads a bounded batch through its scope, applies the transition, and the
//! next batch is re-derived from the scope rather than from a cursor. Every
//! scope takes any [`TableReader`] so a write transaction can re-check its
//! own precondition before mutating.

use std::collections::{HashMap, HashSet};

use crate::error::StateResult;
use crate::txn::TableReader;
use crate::types::*;

// ── Nodes ──────────────────────────────────────────────────────────

/// Nodes with `now - last_seen_at > threshold_secs`.
pub fn lost_nodes<R: TableReader>(r: &R, now: u64, threshold_secs: u64) -> StateResult<Vec<Node>> {
    r.scan(|n: &Node| n.heartbeat_expired(now, threshold_secs), None)
}

/// Sum of `reserved_storage_bytes` over reservation-holding indices, per node.
pub fn node_reserved_bytes<R: TableReader>(r: &R) -> StateResult<HashMap<NodeId, i64>> {
    let mut reserved = HashMap::new();
    for index in r.scan(|i: &Index| i.holds_reservation(), None)? {
        *reserved.entry(index.node_id).or_insert(0) += index.reserved_storage_bytes;
    }
    Ok(reserved)
}

/// `(node, unclaimed)` for nodes with
/// `total_bytes - Σ reserved(holding indices) < 0`, in node id order.
pub fn nodes_with_negative_unclaimed_storage<R: TableReader>(
    r: &R,
) -> StateResult<Vec<(Node, i64)>> {
    let reserved = node_reserved_bytes(r)?;
    Ok(r.all::<Node>()?
        .into_iter()
        .filter_map(|node| {
            let unclaimed = node.total_bytes - reserved.get(&node.id).copied().unwrap_or(0);
            (unclaimed < 0).then_some((node, unclaimed))
        })
        .collect())
}

// ── Indices ────────────────────────────────────────────────────────

fn enabled_namespace_ids<R: TableReader>(r: &R) -> StateResult<HashSet<EnabledNamespaceId>> {
    Ok(r.all::<EnabledNamespace>()?.into_iter().map(|e| e.id).collect())
}

/// Indices in `pending | initializing | ready` whose `enabled_namespace_id`
/// is unset or dangling, or whose `replica_id` is unset or dangling.
pub fn indices_to_mark_orphaned<R: TableReader>(r: &R, limit: usize) -> StateResult<Vec<Index>> {
    let enabled = enabled_namespace_ids(r)?;
    let replicas: HashSet<ReplicaId> = r.all::<Replica>()?.into_iter().map(|p| p.id).collect();
    r.scan(
        |i: &Index| {
            i.is_live()
                && (!i.enabled_namespace_id.is_some_and(|id| enabled.contains(&id))
                    || !i.replica_id.is_some_and(|id| replicas.contains(&id)))
        },
        Some(limit),
    )
}

/// Indices with `state == orphaned`, or `state == ready` with a critical
/// watermark and a replica still attached.
pub fn indices_to_mark_pending_eviction<R: TableReader>(
    r: &R,
    limit: usize,
) -> StateResult<Vec<Index>> {
    r.scan(
        |i: &Index| {
            i.state == IndexState::Orphaned
                || (i.state == IndexState::Ready
                    && i.watermark_level == WatermarkLevel::CriticalWatermarkExceeded
                    && i.replica_id.is_some())
        },
        Some(limit),
    )
}

/// Indices with `state == pending_eviction`.
pub fn indices_to_evict<R: TableReader>(r: &R, limit: usize) -> StateResult<Vec<Index>> {
    r.scan(|i: &Index| i.state == IndexState::PendingEviction, Some(limit))
}

/// Indices with `state == initializing` where every repository under the
/// index is finished (`ready | failed | deleted`). An index without
/// repositories qualifies.
pub fn indices_to_mark_ready<R: TableReader>(r: &R, limit: usize) -> StateResult<Vec<Index>> {
    let blocked: HashSet<IndexId> = r
        .scan(|repo: &Repository| !repo.state.is_finished(), None)?
        .into_iter()
        .map(|repo| repo.index_id)
        .collect();
    r.scan(
        |i: &Index| i.state == IndexState::Initializing && !blocked.contains(&i.id),
        Some(limit),
    )
}

/// Indices with `state == marked_to_delete`.
pub fn indices_marked_to_delete<R: TableReader>(r: &R, limit: usize) -> StateResult<Vec<Index>> {
    r.scan(|i: &Index| i.state == IndexState::MarkedToDelete, Some(limit))
}

/// Reservation-holding indices not pending eviction with
/// `used_storage_stale`, i.e. indexed since the last refresh.
pub fn indices_with_stale_used_storage<R: TableReader>(
    r: &R,
    limit: usize,
) -> StateResult<Vec<Index>> {
    r.scan(
        |i: &Index| {
            i.holds_reservation()
                && i.state != IndexState::PendingEviction
                && i.used_storage_stale
        },
        Some(limit),
    )
}

/// Indices with `state == ready`, `watermark_level == overprovisioned` and
/// `reserved_storage_bytes > ideal_reservation(max(used, 1 KiB))`.
pub fn overprovisioned_ready_indices<R: TableReader>(
    r: &R,
    limit: usize,
) -> StateResult<Vec<Index>> {
    r.scan(
        |i: &Index| {
            i.state == IndexState::Ready
                && i.watermark_level == WatermarkLevel::Overprovisioned
                && i.is_overprovisioned()
        },
        Some(limit),
    )
}

/// Reservation-holding indices whose stored `watermark_level` differs from
/// `WatermarkLevel::for_usage(used, reserved)`.
pub fn indices_with_mismatched_watermark<R: TableReader>(
    r: &R,
    limit: usize,
) -> StateResult<Vec<Index>> {
    r.scan(
        |i: &Index| i.holds_reservation() && i.watermark_level != i.appropriate_watermark_level(),
        Some(limit),
    )
}

/// Pending indices on alive nodes, at most `per_node` per node, in id order.
pub fn pending_indices_on_alive_nodes<R: TableReader>(
    r: &R,
    per_node: usize,
) -> StateResult<Vec<Index>> {
    let alive: HashSet<NodeId> = r
        .scan(|n: &Node| n.liveness == NodeLiveness::Alive, None)?
        .into_iter()
        .map(|n| n.id)
        .collect();
    let mut taken: HashMap<NodeId, usize> = HashMap::new();
    r.scan(
        |i: &Index| {
            if i.state != IndexState::Pending || !alive.contains(&i.node_id) {
                return false;
            }
            let count = taken.entry(i.node_id).or_insert(0);
            if *count >= per_node {
                return false;
            }
            *count += 1;
            true
        },
        None,
    )
}

// ── Repositories ───────────────────────────────────────────────────

/// Repositories in `pending | ready` whose index is missing or `evicted`,
/// or whose namespace no longer has an `EnabledNamespace`.
pub fn repos_to_mark_orphaned<R: TableReader>(
    r: &R,
    limit: usize,
) -> StateResult<Vec<Repository>> {
    let enabled_roots: HashSet<NamespaceId> = r
        .all::<EnabledNamespace>()?
        .into_iter()
        .map(|e| e.root_namespace_id)
        .collect();
    let usable: HashSet<IndexId> = r
        .scan(|i: &Index| i.state != IndexState::Evicted, None)?
        .into_iter()
        .map(|i| i.id)
        .collect();
    r.scan(
        |repo: &Repository| {
            matches!(repo.state, RepositoryState::Pending | RepositoryState::Ready)
                && (!usable.contains(&repo.index_id) || !enabled_roots.contains(&repo.namespace_id))
        },
        Some(limit),
    )
}

/// Repositories with `state == orphaned`.
pub fn repos_to_mark_pending_deletion<R: TableReader>(
    r: &R,
    limit: usize,
) -> StateResult<Vec<Repository>> {
    r.scan(
        |repo: &Repository| repo.state == RepositoryState::Orphaned,
        Some(limit),
    )
}

fn repos_with_outstanding_task<R: TableReader>(r: &R) -> StateResult<HashSet<RepositoryId>> {
    Ok(outstanding_tasks(r)?
        .into_iter()
        .map(|t| t.repository_id)
        .collect())
}

/// Repositories with `state == pending`, no outstanding task, on an index in
/// `initializing | ready` hosted by an alive node.
pub fn repos_to_index<R: TableReader>(r: &R, limit: usize) -> StateResult<Vec<Repository>> {
    let busy = repos_with_outstanding_task(r)?;
    let alive: HashSet<NodeId> = r
        .scan(|n: &Node| n.liveness == NodeLiveness::Alive, None)?
        .into_iter()
        .map(|n| n.id)
        .collect();
    let indexable: HashSet<IndexId> = r
        .scan(
            |i: &Index| {
                matches!(i.state, IndexState::Initializing | IndexState::Ready)
                    && alive.contains(&i.node_id)
            },
            None,
        )?
        .into_iter()
        .map(|i| i.id)
        .collect();
    r.scan(
        |repo: &Repository| {
            repo.state == RepositoryState::Pending
                && indexable.contains(&repo.index_id)
                && !busy.contains(&repo.id)
        },
        Some(limit),
    )
}

/// Repositories with `state == pending_deletion` and no outstanding task.
pub fn repos_to_delete<R: TableReader>(r: &R, limit: usize) -> StateResult<Vec<Repository>> {
    let busy = repos_with_outstanding_task(r)?;
    r.scan(
        |repo: &Repository| repo.state == RepositoryState::PendingDeletion && !busy.contains(&repo.id),
        Some(limit),
    )
}

// ── Tasks ──────────────────────────────────────────────────────────

/// Tasks in `pending | processing`.
pub fn outstanding_tasks<R: TableReader>(r: &R) -> StateResult<Vec<Task>> {
    r.scan(|t: &Task| t.state.is_outstanding(), None)
}

/// Reconciled tasks in `done | failed` with `updated_at + retention_secs <= now`.
pub fn purgeable_tasks<R: TableReader>(
    r: &R,
    now: u64,
    retention_secs: u64,
    limit: usize,
) -> StateResult<Vec<Task>> {
    r.scan(
        |t: &Task| {
            !t.state.is_outstanding()
                && t.reconciled_at.is_some()
                && t.updated_at.saturating_add(retention_secs) <= now
        },
        Some(limit),
    )
}

/// Finished tasks whose outcome has not been applied to the repository yet.
pub fn unreconciled_finished_tasks<R: TableReader>(r: &R, limit: usize) -> StateResult<Vec<Task>> {
    r.scan(
        |t: &Task| !t.state.is_outstanding() && t.reconciled_at.is_none(),
        Some(limit),
    )
}

/// `evicted` indices that no repository row references any more.
pub fn evicted_indices_without_repositories<R: TableReader>(
    r: &R,
    limit: usize,
) -> StateResult<Vec<Index>> {
    let referenced: HashSet<IndexId> = r
        .all::<Repository>()?
        .into_iter()
        .map(|repo| repo.index_id)
        .collect();
    r.scan(
        |i: &Index| i.state == IndexState::Evicted && !referenced.contains(&i.id),
        Some(limit),
    )
}

/// Repositories not referenced by an outstanding task that are `deleted`,
/// or `failed` under an index that is `evicted` or gone.
pub fn purgeable_repositories<R: TableReader>(
    r: &R,
    limit: usize,
) -> StateResult<Vec<Repository>> {
    let busy = repos_with_outstanding_task(r)?;
    let serving: HashSet<IndexId> = r
        .scan(|i: &Index| i.state != IndexState::Evicted, None)?
        .into_iter()
        .map(|i| i.id)
        .collect();
    r.scan(
        |repo: &Repository| {
            !busy.contains(&repo.id)
                && (repo.state == RepositoryState::Deleted
                    || (repo.state == RepositoryState::Failed && !serving.contains(&repo.index_id)))
        },
        Some(limit),
    )
}

// ── Namespaces ─────────────────────────────────────────────────────

/// Eligible catalogue namespaces without an `EnabledNamespace`, in id order.
pub fn namespaces_to_onboard<R: TableReader>(r: &R, limit: usize) -> StateResult<Vec<Namespace>> {
    let enabled_roots: HashSet<NamespaceId> = r
        .all::<EnabledNamespace>()?
        .into_iter()
        .map(|e| e.root_namespace_id)
        .collect();
    r.scan(
        |ns: &Namespace| ns.eligible && !enabled_roots.contains(&ns.id),
        Some(limit),
    )
}

/// `EnabledNamespace` rows whose catalogue namespace is missing or ineligible.
pub fn enabled_namespaces_to_offboard<R: TableReader>(
    r: &R,
    limit: usize,
) -> StateResult<Vec<EnabledNamespace>> {
    let eligible: HashSet<NamespaceId> = r
        .scan(|ns: &Namespace| ns.eligible, None)?
        .into_iter()
        .map(|ns| ns.id)
        .collect();
    r.scan(
        |e: &EnabledNamespace| !eligible.contains(&e.root_namespace_id),
        Some(limit),
    )
}

/// `EnabledNamespace` rows that no reservation-holding index references and
/// whose last rollout did not fail within `failed_retry_secs`.
pub fn enabled_namespaces_without_indices<R: TableReader>(
    r: &R,
    now: u64,
    failed_retry_secs: u64,
    limit: usize,
) -> StateResult<Vec<EnabledNamespace>> {
    let placed: HashSet<EnabledNamespaceId> = r
        .scan(|i: &Index| i.holds_reservation(), None)?
        .into_iter()
        .filter_map(|i| i.enabled_namespace_id)
        .collect();
    r.scan(
        |e: &EnabledNamespace| {
            !placed.contains(&e.id) && !e.rollout_recently_failed(now, failed_retry_secs)
        },
        Some(limit),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StateStore;

    fn seeded() -> (StateStore, EnabledNamespace, Node, Index) {
        let store = StateStore::open_in_memory().unwrap();
        let node = store.insert(Node::new("node-1", 1_000, 100)).unwrap();
        let enabled = store.insert(EnabledNamespace::new(10, 100)).unwrap();
        let replica = store.insert(Replica::new(&enabled, node.id, 100)).unwrap();
        let index = store
            .insert(Index::new(&enabled, node.id, replica.id, 100, 100))
            .unwrap();
        (store, enabled, node, index)
    }

    fn set_index_state(store: &StateStore, id: IndexId, state: IndexState) {
        store.bulk_update(&[id], |i: &mut Index| i.state = state).unwrap();
    }

    #[test]
    fn lost_nodes_uses_threshold() {
        let (store, ..) = seeded();
        store.read(|r| {
            assert!(lost_nodes(r, 160, 60)?.is_empty());
            assert_eq!(lost_nodes(r, 161, 60)?.len(), 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn index_without_enabled_namespace_is_orphan_candidate() {
        let (store, enabled, _, index) = seeded();
        set_index_state(&store, index.id, IndexState::Ready);
        assert!(store.read(|r| indices_to_mark_orphaned(r, 10)).unwrap().is_empty());

        store.delete::<EnabledNamespace>(enabled.id).unwrap();
        let found = store.read(|r| indices_to_mark_orphaned(r, 10)).unwrap();
        assert_eq!(found.len(), 1);

        // Terminal-bound states are not re-orphaned.
        set_index_state(&store, index.id, IndexState::PendingEviction);
        assert!(store.read(|r| indices_to_mark_orphaned(r, 10)).unwrap().is_empty());
    }

    #[test]
    fn index_without_replica_is_orphan_candidate() {
        let (store, _, _, index) = seeded();
        store.delete::<Replica>(index.replica_id.unwrap()).unwrap();
        assert_eq!(store.read(|r| indices_to_mark_orphaned(r, 10)).unwrap().len(), 1);
    }

    #[test]
    fn critical_ready_index_needs_replica_for_eviction() {
        let (store, _, _, index) = seeded();
        store
            .bulk_update(&[index.id], |i: &mut Index| {
                i.state = IndexState::Ready;
                i.watermark_level = WatermarkLevel::CriticalWatermarkExceeded;
            })
            .unwrap();
        assert_eq!(
            store.read(|r| indices_to_mark_pending_eviction(r, 10)).unwrap().len(),
            1
        );
        store
            .bulk_update(&[index.id], |i: &mut Index| i.replica_id = None)
            .unwrap();
        assert!(store
            .read(|r| indices_to_mark_pending_eviction(r, 10))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn ready_requires_all_repositories_finished() {
        let (store, _, _, index) = seeded();
        set_index_state(&store, index.id, IndexState::Initializing);
        let project = Project::new(1, 10, 0, 0);
        let a = store.insert(Repository::new(&project, &index, 3, 0)).unwrap();
        let b = store.insert(Repository::new(&project, &index, 3, 0)).unwrap();

        store
            .bulk_update(&[a.id], |r: &mut Repository| r.state = RepositoryState::Ready)
            .unwrap();
        assert!(store.read(|r| indices_to_mark_ready(r, 10)).unwrap().is_empty());

        store
            .bulk_update(&[b.id], |r: &mut Repository| r.state = RepositoryState::Failed)
            .unwrap();
        assert_eq!(store.read(|r| indices_to_mark_ready(r, 10)).unwrap().len(), 1);
    }

    #[test]
    fn negative_unclaimed_ignores_released_reservations() {
        let (store, enabled, node, _) = seeded();
        let replica = store.insert(Replica::new(&enabled, node.id, 0)).unwrap();
        let big = store
            .insert(Index::new(&enabled, node.id, replica.id, 950, 0))
            .unwrap();
        let found = store.read(|r| nodes_with_negative_unclaimed_storage(r)).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1, -50);

        set_index_state(&store, big.id, IndexState::Evicted);
        assert!(store.read(|r| nodes_with_negative_unclaimed_storage(r)).unwrap().is_empty());
    }

    #[test]
    fn repos_to_index_skips_busy_and_lost() {
        let (store, _, node, index) = seeded();
        set_index_state(&store, index.id, IndexState::Initializing);
        let project = Project::new(1, 10, 0, 0);
        let a = store.insert(Repository::new(&project, &index, 3, 0)).unwrap();
        let b = store.insert(Repository::new(&project, &index, 3, 0)).unwrap();
        store.insert(Task::new(&a, node.id, TaskType::IndexRepo, 0)).unwrap();

        let found = store.read(|r| repos_to_index(r, 10)).unwrap();
        assert_eq!(found.iter().map(|r| r.id).collect::<Vec<_>>(), vec![b.id]);

        store
            .bulk_update(&[node.id], |n: &mut Node| n.liveness = NodeLiveness::Lost)
            .unwrap();
        assert!(store.read(|r| repos_to_index(r, 10)).unwrap().is_empty());
    }

    #[test]
    fn repos_orphaned_when_index_evicted_or_namespace_gone() {
        let (store, enabled, _, index) = seeded();
        let project = Project::new(1, 10, 0, 0);
        store.insert(Repository::new(&project, &index, 3, 0)).unwrap();
        assert!(store.read(|r| repos_to_mark_orphaned(r, 10)).unwrap().is_empty());

        store.delete::<EnabledNamespace>(enabled.id).unwrap();
        assert_eq!(store.read(|r| repos_to_mark_orphaned(r, 10)).unwrap().len(), 1);
    }

    #[test]
    fn onboarding_and_offboarding_candidates() {
        let store = StateStore::open_in_memory().unwrap();
        store.put(&Namespace::new(1, "a", 0, 0)).unwrap();
        store.put(&Namespace::new(2, "b", 0, 0)).unwrap();
        let mut ineligible = Namespace::new(3, "c", 0, 0);
        ineligible.eligible = false;
        store.put(&ineligible).unwrap();
        store.enable_namespace(2, 0).unwrap();
        store.enable_namespace(3, 0).unwrap();

        let onboard = store.read(|r| namespaces_to_onboard(r, 10)).unwrap();
        assert_eq!(onboard.iter().map(|n| n.id).collect::<Vec<_>>(), vec![1]);

        let offboard = store.read(|r| enabled_namespaces_to_offboard(r, 10)).unwrap();
        assert_eq!(offboard.len(), 1);
        assert_eq!(offboard[0].root_namespace_id, 3);
    }

    #[test]
    fn recently_failed_namespaces_are_not_reprovisioned() {
        let store = StateStore::open_in_memory().unwrap();
        let mut enabled = store.enable_namespace(1, 0).unwrap();
        assert_eq!(
            store
                .read(|r| enabled_namespaces_without_indices(r, 100, 50, 10))
                .unwrap()
                .len(),
            1
        );
        enabled.last_rollout_failed_at = Some(90);
        store.put(&enabled).unwrap();
        assert!(store
            .read(|r| enabled_namespaces_without_indices(r, 100, 50, 10))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn pending_indices_capped_per_node() {
        let (store, enabled, node, _) = seeded();
        for _ in 0..4 {
            store.insert(Index::new(&enabled, node.id, 1, 10, 0)).unwrap();
        }
        let found = store.read(|r| pending_indices_on_alive_nodes(r, 3)).unwrap();
        assert_eq!(found.len(), 3);
    }
}
