//! Project lifecycle events from the account subsystem.

use shardgrid_events::FleetEvent;
use shardgrid_state::*;
use tracing::debug;

use crate::context::ReconcileContext;
use crate::error::ReconcileResult;
use crate::outcome::WorkerOutcome;

/// Add a repository for a new project when its namespace already has an
/// indexable index. Pending indices pick the project up during initial
/// indexing instead.
pub fn project_created(
    store: &StateStore,
    ctx: &ReconcileContext,
    project_id: ProjectId,
) -> ReconcileResult<WorkerOutcome> {
    let retries = ctx.limits().repository_retries;
    let added = store.write(|w| add_repository(w, project_id, retries, ctx.now))?;
    Ok(WorkerOutcome::new("project_created")
        .with_affected(added)
        .then_if(added > 0, FleetEvent::RepoToIndex))
}

/// Every repository of a removed project is scheduled for deletion.
pub fn project_deleted(
    store: &StateStore,
    ctx: &ReconcileContext,
    project_id: ProjectId,
) -> ReconcileResult<WorkerOutcome> {
    let marked = store.write(|w| {
        mark_for_deletion(w, ctx.now, |r| r.project_id == project_id)
    })?;
    Ok(WorkerOutcome::new("project_deleted")
        .with_affected(marked)
        .then_if(marked > 0, FleetEvent::RepoToDelete))
}

/// The project's repositories in the old namespace are deleted and a new
/// one is added under the namespace it moved to.
pub fn project_transferred(
    store: &StateStore,
    ctx: &ReconcileContext,
    project_id: ProjectId,
    old_namespace_id: NamespaceId,
) -> ReconcileResult<WorkerOutcome> {
    let retries = ctx.limits().repository_retries;
    let (marked, added) = store.write(|w| {
        let marked = mark_for_deletion(w, ctx.now, |r| {
            r.project_id == project_id && r.namespace_id == old_namespace_id
        })?;
        let added = add_repository(w, project_id, retries, ctx.now)?;
        Ok((marked, added))
    })?;
    Ok(WorkerOutcome::new("project_transferred")
        .with_affected(marked + added)
        .then_if(marked > 0, FleetEvent::RepoToDelete)
        .then_if(added > 0, FleetEvent::RepoToIndex))
}

fn add_repository(
    w: &WriteScope,
    project_id: ProjectId,
    retries: u32,
    now: u64,
) -> StateResult<usize> {
    let Some(project) = w.get::<Project>(project_id)? else {
        debug!(project_id, "project not in catalogue");
        return Ok(0);
    };
    let index = w
        .scan(
            |i: &Index| {
                i.namespace_id == project.namespace_id
                    && matches!(i.state, IndexState::Initializing | IndexState::Ready)
            },
            Some(1),
        )?
        .into_iter()
        .next();
    let Some(index) = index else {
        return Ok(0);
    };
    let exists = !w
        .scan(
            |r: &Repository| r.project_id == project_id && r.index_id == index.id,
            Some(1),
        )?
        .is_empty();
    if exists {
        return Ok(0);
    }
    let mut repo = Repository::new(&project, &index, retries, now);
    repo.size_bytes = project.size_bytes;
    w.insert(repo)?;
    Ok(1)
}

fn mark_for_deletion(
    w: &WriteScope,
    now: u64,
    mut selects: impl FnMut(&Repository) -> bool,
) -> StateResult<usize> {
    let ids: Vec<RepositoryId> = w
        .scan(
            |r: &Repository| {
                selects(r)
                    && !matches!(
                        r.state,
                        RepositoryState::PendingDeletion | RepositoryState::Deleted
                    )
            },
            None,
        )?
        .into_iter()
        .map(|r| r.id)
        .collect();
    w.update_many(&ids, |repo: &mut Repository| {
        repo.state = RepositoryState::PendingDeletion;
        repo.updated_at = now;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::testing::*;

    #[test]
    fn created_project_joins_ready_index_once() {
        let fleet = Fleet::new();
        let node = fleet.node("node-1", 1_000_000);
        let index = fleet.index_on(&node, 1, 1_000, IndexState::Ready);
        let project = fleet.project(1, 77);
        let ctx = fleet.ctx();

        let outcome = project_created(&fleet.store, &ctx, project.id).unwrap();
        assert!(outcome.chained(&FleetEvent::RepoToIndex));
        let repos = fleet.store.list::<Repository>().unwrap();
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].index_id, index.id);
        assert_eq!(repos[0].size_bytes, 77);

        assert_eq!(project_created(&fleet.store, &ctx, project.id).unwrap().affected, 0);
    }

    #[test]
    fn created_project_waits_for_pending_index() {
        let fleet = Fleet::new();
        let node = fleet.node("node-1", 1_000_000);
        fleet.index_on(&node, 1, 1_000, IndexState::Pending);
        let project = fleet.project(1, 77);
        let outcome = project_created(&fleet.store, &fleet.ctx(), project.id).unwrap();
        assert_eq!(outcome.affected, 0);
    }

    #[test]
    fn deleted_project_repositories_pending_deletion() {
        let fleet = Fleet::new();
        let node = fleet.node("node-1", 1_000_000);
        let index = fleet.index_on(&node, 1, 1_000, IndexState::Ready);
        let repo = fleet.repos(&index, 1, RepositoryState::Ready).remove(0);

        let outcome = project_deleted(&fleet.store, &fleet.ctx(), repo.project_id).unwrap();
        assert!(outcome.chained(&FleetEvent::RepoToDelete));
        assert_eq!(fleet.repo(repo.id).state, RepositoryState::PendingDeletion);
    }

    #[test]
    fn transfer_moves_repository_between_namespaces() {
        let fleet = Fleet::new();
        let node = fleet.node("node-1", 1_000_000);
        let old = fleet.index_on(&node, 1, 1_000, IndexState::Ready);
        let new = fleet.index_on(&node, 2, 1_000, IndexState::Ready);
        let repo = fleet.repos(&old, 1, RepositoryState::Ready).remove(0);
        let mut project: Project = fleet.store.get(repo.project_id).unwrap();
        project.namespace_id = 2;
        fleet.store.put(&project).unwrap();

        let outcome = project_transferred(&fleet.store, &fleet.ctx(), project.id, 1).unwrap();
        assert_eq!(outcome.affected, 2);
        assert_eq!(fleet.repo(repo.id).state, RepositoryState::PendingDeletion);
        assert_eq!(
            fleet
                .store
                .count(|r: &Repository| r.index_id == new.id && r.state == RepositoryState::Pending)
                .unwrap(),
            1
        );
    }
}
