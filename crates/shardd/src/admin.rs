//! Operator maintenance commands.
//!
//! Each command is one short store transaction. Follow-up work (orphaning,
//! dispatch, cleanup) is left to the scheduling checks of the running
//! daemon, so these are safe to run from a separate process.

use serde::Serialize;
use shardgrid_metrics::{FleetSnapshot, collect_snapshot};
use shardgrid_placement::{NodeStorage, fleet_storage};
use shardgrid_state::*;
use tracing::info;

/// Persist `indexing_paused`. Returns the stored flags.
pub fn set_indexing_paused(store: &StateStore, paused: bool) -> StateResult<FleetFlags> {
    let mut flags = store.flags()?;
    flags.indexing_paused = paused;
    store.put_flags(&flags)?;
    info!(paused, "indexing pause flag set");
    Ok(flags)
}

/// Persist `auto_index_root_namespaces`. Returns the stored flags.
pub fn set_auto_index(store: &StateStore, enabled: bool) -> StateResult<FleetFlags> {
    let mut flags = store.flags()?;
    flags.auto_index_root_namespaces = enabled;
    store.put_flags(&flags)?;
    info!(enabled, "auto-index flag set");
    Ok(flags)
}

/// Queue every live repository of `project_id` for indexing again with a
/// full retry budget. Repositories on their way out are left alone.
pub fn reindex_project(
    store: &StateStore,
    project_id: ProjectId,
    retries: u32,
    now: u64,
) -> StateResult<usize> {
    let reset = store.write(|w| {
        let repos = w.scan(
            |r: &Repository| {
                r.project_id == project_id
                    && !matches!(
                        r.state,
                        RepositoryState::Orphaned
                            | RepositoryState::PendingDeletion
                            | RepositoryState::Deleted
                    )
            },
            None,
        )?;
        let ids: Vec<RepositoryId> = repos.iter().map(|r| r.id).collect();
        w.update_many(&ids, |r: &mut Repository| {
            r.state = RepositoryState::Pending;
            r.retries_left = retries;
            r.updated_at = now;
        })
    })?;
    info!(project_id, reset, "project queued for re-indexing");
    Ok(reset)
}

/// Stamp `last_rollout_failed_at` on the namespace's `EnabledNamespace`, so
/// provisioning skips it for `rollout.failed_retry_secs`.
pub fn mark_rollout_failed(
    store: &StateStore,
    root_namespace_id: NamespaceId,
    now: u64,
) -> StateResult<bool> {
    let marked = store.write(|w| {
        let found = w.scan(
            |e: &EnabledNamespace| e.root_namespace_id == root_namespace_id,
            Some(1),
        )?;
        let Some(mut enabled) = found.into_iter().next() else {
            return Ok(false);
        };
        enabled.last_rollout_failed_at = Some(now);
        enabled.updated_at = now;
        w.put(&enabled)?;
        Ok(true)
    })?;
    info!(root_namespace_id, marked, "rollout marked failed");
    Ok(marked)
}

/// Delete the namespace's `EnabledNamespace`. Its indices and repositories
/// are orphaned by the next scheduling pass.
pub fn offboard(store: &StateStore, root_namespace_id: NamespaceId) -> StateResult<bool> {
    let removed = store.write(|w| {
        let ids: Vec<EnabledNamespaceId> = w
            .scan(
                |e: &EnabledNamespace| e.root_namespace_id == root_namespace_id,
                None,
            )?
            .into_iter()
            .map(|e| e.id)
            .collect();
        w.remove_many::<EnabledNamespace>(&ids)
    })?;
    info!(root_namespace_id, removed, "namespace offboarded");
    Ok(removed > 0)
}

/// Diagnostics printed by `shardd info`.
#[derive(Debug, Clone, Serialize)]
pub struct FleetInfo {
    pub flags: FleetFlags,
    pub snapshot: FleetSnapshot,
    pub nodes: Vec<NodeStorage>,
}

pub fn fleet_info(store: &StateStore, now: u64) -> StateResult<FleetInfo> {
    let flags = store.flags()?;
    let (snapshot, nodes) = store.read(|r| Ok((collect_snapshot(r, now)?, fleet_storage(r)?)))?;
    Ok(FleetInfo {
        flags,
        snapshot,
        nodes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_project() -> (StateStore, Index) {
        let store = StateStore::open_in_memory().unwrap();
        let node = store.insert(Node::new("node-1", 10_000, 0)).unwrap();
        let enabled = store.enable_namespace(1, 0).unwrap();
        let index = store
            .insert(Index::new(&enabled, node.id, 1, 1_000, 0))
            .unwrap();
        (store, index)
    }

    fn repo(store: &StateStore, index: &Index, project_id: ProjectId, state: RepositoryState) {
        let project = Project::new(project_id, 1, 10, 0);
        let mut repo = Repository::new(&project, index, 0, 0);
        repo.state = state;
        store.insert(repo).unwrap();
    }

    #[test]
    fn pause_and_resume_persist() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(set_indexing_paused(&store, true).unwrap().indexing_paused);
        assert!(!store.flags().unwrap().indexing_active());
        set_indexing_paused(&store, false).unwrap();
        assert!(store.flags().unwrap().indexing_active());
    }

    #[test]
    fn reindex_resets_live_repositories() {
        let (store, index) = store_with_project();
        repo(&store, &index, 7, RepositoryState::Failed);
        repo(&store, &index, 7, RepositoryState::Ready);
        repo(&store, &index, 7, RepositoryState::PendingDeletion);
        repo(&store, &index, 8, RepositoryState::Failed);

        assert_eq!(reindex_project(&store, 7, 3, 50).unwrap(), 2);

        let repos: Vec<Repository> = store.list().unwrap();
        let pending: Vec<&Repository> = repos
            .iter()
            .filter(|r| r.state == RepositoryState::Pending)
            .collect();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|r| r.project_id == 7 && r.retries_left == 3));
        assert_eq!(repos[3].state, RepositoryState::Failed);
    }

    #[test]
    fn mark_rollout_failed_stamps_enabled_namespace() {
        let (store, _) = store_with_project();
        assert!(mark_rollout_failed(&store, 1, 99).unwrap());
        assert!(!mark_rollout_failed(&store, 2, 99).unwrap());

        let enabled: Vec<EnabledNamespace> = store.list().unwrap();
        assert_eq!(enabled[0].last_rollout_failed_at, Some(99));
    }

    #[test]
    fn offboard_removes_enabled_namespace() {
        let (store, _) = store_with_project();
        assert!(offboard(&store, 1).unwrap());
        assert!(!offboard(&store, 1).unwrap());
        assert_eq!(store.count(|_: &EnabledNamespace| true).unwrap(), 0);
    }

    #[test]
    fn info_lists_nodes_and_flags() {
        let (store, _) = store_with_project();
        set_auto_index(&store, true).unwrap();

        let info = fleet_info(&store, 5).unwrap();
        assert!(info.flags.auto_index_root_namespaces);
        assert_eq!(info.nodes.len(), 1);
        assert_eq!(info.nodes[0].unclaimed_bytes(), 9_000);
        assert_eq!(info.snapshot.enabled_namespaces, 1);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["snapshot"]["taken_at"], 5);
    }
}
