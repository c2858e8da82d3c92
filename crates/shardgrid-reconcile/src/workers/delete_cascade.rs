//! Cascade for indices whose namespace was offboarded.
//!
//! Repositories of a `marked_to_delete` index are moved to
//! `pending_deletion` so the nodes drop their data. `failed` is terminal and
//! is never re-marked. Once every repository is `deleted` or `failed`, the
//! index is hard-deleted along with them.

use shardgrid_events::FleetEvent;
use shardgrid_state::*;
use tracing::{info, warn};

use crate::context::ReconcileContext;
use crate::error::ReconcileResult;
use crate::outcome::{WorkerOutcome, split_batch};

#[derive(Default)]
struct Cascade {
    repos_marked: usize,
    indices_deleted: usize,
    failed_dropped: usize,
    more: bool,
}

pub fn delete_marked_indices(
    store: &StateStore,
    ctx: &ReconcileContext,
) -> ReconcileResult<WorkerOutcome> {
    let cap = ctx.limits().delete_cascade_batch;
    let cascade = store.write(|w| {
        let (batch, more) = split_batch(scopes::indices_marked_to_delete(w, cap + 1)?, cap);
        let mut cascade = Cascade {
            more,
            ..Cascade::default()
        };
        for index in batch {
            let repos = w.scan(|r: &Repository| r.index_id == index.id, None)?;
            if repos.iter().all(|r| is_finished(r.state)) {
                let repo_ids: Vec<RepositoryId> = repos.iter().map(|r| r.id).collect();
                cascade.failed_dropped += repos
                    .iter()
                    .filter(|r| r.state == RepositoryState::Failed)
                    .count();
                w.remove_many::<Repository>(&repo_ids)?;
                w.remove::<Index>(index.id)?;
                cascade.indices_deleted += 1;
                continue;
            }
            let to_mark: Vec<RepositoryId> = repos
                .iter()
                .filter(|r| r.state != RepositoryState::PendingDeletion && !is_finished(r.state))
                .map(|r| r.id)
                .collect();
            cascade.repos_marked += w.update_many(&to_mark, |repo: &mut Repository| {
                repo.state = RepositoryState::PendingDeletion;
                repo.updated_at = ctx.now;
            })?;
        }
        Ok(cascade)
    })?;

    if cascade.indices_deleted > 0 {
        info!(indices = cascade.indices_deleted, "marked-to-delete indices removed");
    }
    if cascade.failed_dropped > 0 {
        warn!(
            repositories = cascade.failed_dropped,
            "failed repositories dropped with their index"
        );
    }
    Ok(WorkerOutcome::new("delete_marked_indices")
        .with_affected(cascade.repos_marked + cascade.indices_deleted)
        .then_if(cascade.repos_marked > 0, FleetEvent::RepoToDelete)
        .then_if(cascade.more, FleetEvent::IndexMarkedToDelete))
}

fn is_finished(state: RepositoryState) -> bool {
    matches!(state, RepositoryState::Deleted | RepositoryState::Failed)
}
