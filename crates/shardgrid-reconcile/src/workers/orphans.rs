//! Orphan detection for indices and repositories.
//!
//! Orphaning is a grace step: nothing is deleted here, and the next
//! transition only fires on a later scheduling pass.

use shardgrid_events::FleetEvent;
use shardgrid_state::*;

use crate::context::ReconcileContext;
use crate::error::ReconcileResult;
use crate::outcome::{WorkerOutcome, bulk_transition};

/// Live indices that lost their namespace or replica become `orphaned`.
pub fn mark_orphaned_indices(
    store: &StateStore,
    ctx: &ReconcileContext,
) -> ReconcileResult<WorkerOutcome> {
    let (affected, more) = bulk_transition(
        store,
        ctx.limits().orphan_batch,
        |w, limit| scopes::indices_to_mark_orphaned(w, limit),
        |index: &mut Index| {
            index.state = IndexState::Orphaned;
            index.updated_at = ctx.now;
        },
    )?;
    Ok(WorkerOutcome::new("mark_orphaned_indices")
        .with_affected(affected)
        .then_if(more, FleetEvent::OrphanedIndex))
}

/// Repositories whose index is gone or evicted, or whose namespace was
/// offboarded, become `orphaned`.
pub fn mark_orphaned_repos(
    store: &StateStore,
    ctx: &ReconcileContext,
) -> ReconcileResult<WorkerOutcome> {
    let (affected, more) = bulk_transition(
        store,
        ctx.limits().orphan_batch,
        |w, limit| scopes::repos_to_mark_orphaned(w, limit),
        |repo: &mut Repository| {
            repo.state = RepositoryState::Orphaned;
            repo.updated_at = ctx.now;
        },
    )?;
    Ok(WorkerOutcome::new("mark_orphaned_repos")
        .with_affected(affected)
        .then_if(more, FleetEvent::OrphanedRepo))
}

/// Orphaned repositories become `pending_deletion`.
pub fn mark_repos_pending_deletion(
    store: &StateStore,
    ctx: &ReconcileContext,
) -> ReconcileResult<(usize, bool)> {
    bulk_transition(
        store,
        ctx.limits().orphan_batch,
        |w, limit| scopes::repos_to_mark_pending_deletion(w, limit),
        |repo: &mut Repository| {
            repo.state = RepositoryState::PendingDeletion;
            repo.updated_at = ctx.now;
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::testing::*;

    #[test]
    fn offboarded_namespace_orphans_index_and_repos() {
        let fleet = Fleet::new();
        let node = fleet.node("node-1", 1_000);
        let index = fleet.index_on(&node, 1, 100, IndexState::Ready);
        let repos = fleet.repos(&index, 2, RepositoryState::Ready);
        let ctx = fleet.ctx();

        assert_eq!(mark_orphaned_indices(&fleet.store, &ctx).unwrap().affected, 0);

        store_remove_enabled(&fleet, 1);
        let outcome = mark_orphaned_indices(&fleet.store, &ctx).unwrap();
        assert_eq!(outcome.affected, 1);
        assert_eq!(fleet.index(index.id).state, IndexState::Orphaned);

        let outcome = mark_orphaned_repos(&fleet.store, &ctx).unwrap();
        assert_eq!(outcome.affected, 2);
        assert_eq!(fleet.repo(repos[0].id).state, RepositoryState::Orphaned);

        let (affected, more) = mark_repos_pending_deletion(&fleet.store, &ctx).unwrap();
        assert_eq!((affected, more), (2, false));
        assert_eq!(fleet.repo(repos[1].id).state, RepositoryState::PendingDeletion);
    }

    #[test]
    fn backlog_drains_in_capped_invocations() {
        let fleet = Fleet::with_settings(|s| s.limits.orphan_batch = 4);
        let node = fleet.node("node-1", 1_000_000);
        for root in 0..12 {
            fleet.index_on(&node, root + 1, 10, IndexState::Ready);
        }
        let enabled: Vec<_> = fleet
            .store
            .list::<EnabledNamespace>()
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        fleet
            .store
            .write(|w| w.remove_many::<EnabledNamespace>(&enabled))
            .unwrap();
        let ctx = fleet.ctx();

        let mut invocations = 0;
        loop {
            invocations += 1;
            let outcome = mark_orphaned_indices(&fleet.store, &ctx).unwrap();
            if !outcome.chained(&FleetEvent::OrphanedIndex) {
                break;
            }
        }
        assert_eq!(invocations, 3);
        assert_eq!(
            fleet
                .store
                .count(|i: &Index| i.state == IndexState::Orphaned)
                .unwrap(),
            12
        );
        assert_eq!(mark_orphaned_indices(&fleet.store, &ctx).unwrap().affected, 0);
    }

    fn store_remove_enabled(fleet: &Fleet, root: NamespaceId) {
        let enabled = fleet.enabled(root);
        fleet.store.delete::<EnabledNamespace>(enabled.id).unwrap();
    }
}
