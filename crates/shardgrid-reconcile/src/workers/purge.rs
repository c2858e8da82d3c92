//! Removal of rows that reached a terminal state.

use shardgrid_events::FleetEvent;
use shardgrid_state::*;
use tracing::info;

use crate::context::ReconcileContext;
use crate::error::ReconcileResult;
use crate::outcome::{WorkerOutcome, split_batch};

#[derive(Default)]
struct Purged {
    tasks: usize,
    repositories: usize,
    indices: usize,
    more: bool,
}

impl Purged {
    fn total(&self) -> usize {
        self.tasks + self.repositories + self.indices
    }
}

/// Delete reconciled tasks past the retention window, purgeable
/// repositories (see [`scopes::purgeable_repositories`]), and evicted
/// indices no repository references. Each class is capped at `limits.purge_batch`.
pub fn purge(store: &StateStore, ctx: &ReconcileContext) -> ReconcileResult<WorkerOutcome> {
    let cap = ctx.limits().purge_batch;
    let retention = ctx.limits().task_retention_secs;
    let purged = store.write(|w| {
        let mut purged = Purged::default();

        let (tasks, more_tasks) =
            split_batch(scopes::purgeable_tasks(w, ctx.now, retention, cap + 1)?, cap);
        let ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
        purged.tasks = w.remove_many::<Task>(&ids)?;

        let (repos, more_repos) =
            split_batch(scopes::purgeable_repositories(w, cap + 1)?, cap);
        let ids: Vec<RepositoryId> = repos.iter().map(|r| r.id).collect();
        purged.repositories = w.remove_many::<Repository>(&ids)?;

        // Re-derived after the repository purge above.
        let (indices, more_indices) = split_batch(
            scopes::evicted_indices_without_repositories(w, cap + 1)?,
            cap,
        );
        let ids: Vec<IndexId> = indices.iter().map(|i| i.id).collect();
        purged.indices = w.remove_many::<Index>(&ids)?;

        purged.more = more_tasks || more_repos || more_indices;
        Ok(purged)
    })?;

    if purged.total() > 0 {
        info!(
            tasks = purged.tasks,
            repositories = purged.repositories,
            indices = purged.indices,
            "terminal rows purged"
        );
    }
    Ok(WorkerOutcome::new("purge")
        .with_affected(purged.total())
        .then_if(purged.more, FleetEvent::Purge))
}

/// Whether [`purge`] would remove anything at `now`.
pub fn has_work<R: TableReader>(r: &R, now: u64, retention_secs: u64) -> StateResult<bool> {
    Ok(!scopes::purgeable_tasks(r, now, retention_secs, 1)?.is_empty()
        || !scopes::purgeable_repositories(r, 1)?.is_empty()
        || !scopes::evicted_indices_without_repositories(r, 1)?.is_empty())
}
