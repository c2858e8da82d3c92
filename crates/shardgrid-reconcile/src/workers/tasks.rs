//! Applying task results reported by node agents.
//!
//! A task's outcome is applied at most once: the worker stamps
//! `reconciled_at` in the same transaction that moves the repository, and
//! skips tasks that already carry it. Redelivered or duplicated reports are
//! therefore harmless.

use shardgrid_events::FleetEvent;
use shardgrid_state::*;
use tracing::{debug, info, warn};

use crate::context::ReconcileContext;
use crate::error::ReconcileResult;
use crate::outcome::WorkerOutcome;

/// What applying a task result did to its repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    /// Task missing or already reconciled.
    Nothing,
    /// Task reconciled; the repository was not in the expected state.
    Stale,
    Indexed,
    Deleted,
    Retry(TaskType),
    Exhausted,
}

pub fn task_done(
    store: &StateStore,
    ctx: &ReconcileContext,
    task_id: TaskId,
    size_bytes: i64,
) -> ReconcileResult<WorkerOutcome> {
    let now = ctx.now;
    let applied = store.write(|w| {
        let Some(mut task) = w.get::<Task>(task_id)? else {
            return Ok(Applied::Nothing);
        };
        if task.reconciled_at.is_some() {
            return Ok(Applied::Nothing);
        }
        task.state = TaskState::Done;
        task.reconciled_at = Some(now);
        task.updated_at = now;
        w.put(&task)?;

        let Some(mut repo) = w.get::<Repository>(task.repository_id)? else {
            return Ok(Applied::Stale);
        };
        let applied = match task.task_type {
            TaskType::IndexRepo
                if matches!(
                    repo.state,
                    RepositoryState::InProgress | RepositoryState::Pending
                ) =>
            {
                repo.state = RepositoryState::Ready;
                repo.size_bytes = size_bytes.max(0);
                repo.indexed_at = Some(now);
                w.update_many(&[repo.index_id], |index: &mut Index| {
                    index.last_indexed_at = now;
                    index.used_storage_stale = true;
                })?;
                Applied::Indexed
            }
            TaskType::DeleteRepo if repo.state == RepositoryState::PendingDeletion => {
                repo.state = RepositoryState::Deleted;
                Applied::Deleted
            }
            _ => return Ok(Applied::Stale),
        };
        repo.updated_at = now;
        w.put(&repo)?;
        Ok(applied)
    })?;

    let outcome = WorkerOutcome::new("task_done");
    Ok(match applied {
        Applied::Indexed => {
            debug!(task_id, size_bytes, "repository indexed");
            outcome
                .with_affected(1)
                .then(FleetEvent::MarkIndicesReady)
                .then(FleetEvent::UpdateIndexUsedStorageBytes)
        }
        Applied::Deleted => outcome
            .with_affected(1)
            .then(FleetEvent::IndexMarkedToDelete),
        Applied::Stale => {
            debug!(task_id, "task result no longer applies");
            outcome
        }
        _ => outcome,
    })
}

/// Return the repository to the queue, or fail it once its retries are
/// spent. Each failure consumes one retry; the failure that would leave
/// none fails the repository.
pub fn task_failed(
    store: &StateStore,
    ctx: &ReconcileContext,
    task_id: TaskId,
) -> ReconcileResult<WorkerOutcome> {
    let now = ctx.now;
    let applied = store.write(|w| {
        let Some(mut task) = w.get::<Task>(task_id)? else {
            return Ok(Applied::Nothing);
        };
        if task.reconciled_at.is_some() {
            return Ok(Applied::Nothing);
        }
        task.state = TaskState::Failed;
        task.reconciled_at = Some(now);
        task.updated_at = now;
        w.put(&task)?;

        let Some(mut repo) = w.get::<Repository>(task.repository_id)? else {
            return Ok(Applied::Stale);
        };
        let (expected, requeue_state) = match task.task_type {
            TaskType::IndexRepo => (RepositoryState::InProgress, RepositoryState::Pending),
            TaskType::DeleteRepo => (
                RepositoryState::PendingDeletion,
                RepositoryState::PendingDeletion,
            ),
        };
        if repo.state != expected {
            return Ok(Applied::Stale);
        }

        let applied = if repo.retries_left <= 1 {
            repo.retries_left = 0;
            repo.state = RepositoryState::Failed;
            Applied::Exhausted
        } else {
            repo.retries_left -= 1;
            repo.state = requeue_state;
            Applied::Retry(task.task_type)
        };
        repo.updated_at = now;
        w.put(&repo)?;
        Ok(applied)
    })?;

    let outcome = WorkerOutcome::new("task_failed");
    Ok(match applied {
        Applied::Retry(task_type) => {
            info!(task_id, task_type = task_type.as_str(), "task failed, repository requeued");
            let retry = match task_type {
                TaskType::IndexRepo => FleetEvent::RepoToIndex,
                TaskType::DeleteRepo => FleetEvent::RepoToDelete,
            };
            outcome.with_affected(1).then(retry)
        }
        Applied::Exhausted => {
            warn!(task_id, "task retries exhausted, repository failed");
            outcome.with_affected(1).then(FleetEvent::MarkIndicesReady)
        }
        _ => outcome,
    })
}

/// Finished tasks whose result was never applied, e.g. because the event
/// was lost. Replays them through [`task_done`] and [`task_failed`].
pub fn reconcile_finished_tasks(
    store: &StateStore,
    ctx: &ReconcileContext,
) -> ReconcileResult<WorkerOutcome> {
    let cap = ctx.limits().dispatch_batch;
    let stranded = store.read(|r| scopes::unreconciled_finished_tasks(r, cap))?;
    let mut outcome = WorkerOutcome::new("reconcile_finished_tasks");
    for task in stranded {
        let replayed = match task.state {
            TaskState::Done => {
                let size = store
                    .find::<Repository>(task.repository_id)?
                    .map(|r| r.size_bytes)
                    .unwrap_or(0);
                task_done(store, ctx, task.id, size)?
            }
            _ => task_failed(store, ctx, task.id)?,
        };
        outcome.affected += replayed.affected;
        for event in replayed.follow_up {
            if !outcome.follow_up.contains(&event) {
                outcome.follow_up.push(event);
            }
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::testing::*;

    fn in_progress(fleet: &Fleet) -> (Index, Repository, Task) {
        let node = fleet.node("node-1", 1_000_000);
        let index = fleet.index_on(&node, 1, 1_000, IndexState::Initializing);
        let repo = fleet.repos(&index, 1, RepositoryState::InProgress).remove(0);
        let task = fleet.task(&repo, node.id, TaskType::IndexRepo);
        (index, repo, task)
    }

    #[test]
    fn done_readies_repository_once() {
        let fleet = Fleet::new();
        let (index, repo, task) = in_progress(&fleet);
        let ctx = fleet.ctx_at(T0 + 60);

        let outcome = task_done(&fleet.store, &ctx, task.id, 4_096).unwrap();
        assert_eq!(outcome.affected, 1);
        assert!(outcome.chained(&FleetEvent::MarkIndicesReady));
        assert!(outcome.chained(&FleetEvent::UpdateIndexUsedStorageBytes));

        let repo = fleet.repo(repo.id);
        assert_eq!(repo.state, RepositoryState::Ready);
        assert_eq!(repo.size_bytes, 4_096);
        assert_eq!(repo.indexed_at, Some(T0 + 60));
        assert_eq!(fleet.index(index.id).last_indexed_at, T0 + 60);

        let again = task_done(&fleet.store, &ctx, task.id, 1).unwrap();
        assert_eq!(again.affected, 0);
        assert_eq!(fleet.repo(repo.id).size_bytes, 4_096);
    }

    #[test]
    fn three_failures_fail_the_repository() {
        let fleet = Fleet::new();
        let (_, repo, first) = in_progress(&fleet);
        let ctx = fleet.ctx();

        let outcome = task_failed(&fleet.store, &ctx, first.id).unwrap();
        assert!(outcome.chained(&FleetEvent::RepoToIndex));
        let after = fleet.repo(repo.id);
        assert_eq!(after.state, RepositoryState::Pending);
        assert_eq!(after.retries_left, 2);

        // Duplicate report of the same task changes nothing.
        task_failed(&fleet.store, &ctx, first.id).unwrap();
        assert_eq!(fleet.repo(repo.id).retries_left, 2);

        for expected_retries in [1, 0] {
            fleet
                .store
                .bulk_update(&[repo.id], |r: &mut Repository| {
                    r.state = RepositoryState::InProgress
                })
                .unwrap();
            let task = fleet.task(&fleet.repo(repo.id), 1, TaskType::IndexRepo);
            task_failed(&fleet.store, &ctx, task.id).unwrap();
            assert_eq!(fleet.repo(repo.id).retries_left, expected_retries);
        }
        assert_eq!(fleet.repo(repo.id).state, RepositoryState::Failed);
    }

    #[test]
    fn failed_delete_stays_pending_deletion() {
        let fleet = Fleet::new();
        let node = fleet.node("node-1", 1_000_000);
        let index = fleet.index_on(&node, 1, 1_000, IndexState::MarkedToDelete);
        let repo = fleet.repos(&index, 1, RepositoryState::PendingDeletion).remove(0);
        let task = fleet.task(&repo, node.id, TaskType::DeleteRepo);

        let outcome = task_failed(&fleet.store, &fleet.ctx(), task.id).unwrap();
        assert!(outcome.chained(&FleetEvent::RepoToDelete));
        let after = fleet.repo(repo.id);
        assert_eq!(after.state, RepositoryState::PendingDeletion);
        assert_eq!(after.retries_left, 2);
    }

    #[test]
    fn stranded_results_are_replayed() {
        let fleet = Fleet::new();
        let (_, repo, task) = in_progress(&fleet);
        fleet
            .store
            .bulk_update(&[task.id], |t: &mut Task| t.state = TaskState::Done)
            .unwrap();

        let outcome = reconcile_finished_tasks(&fleet.store, &fleet.ctx()).unwrap();
        assert_eq!(outcome.affected, 1);
        assert_eq!(fleet.repo(repo.id).state, RepositoryState::Ready);
        let task: Task = fleet.store.get(task.id).unwrap();
        assert!(task.reconciled_at.is_some());
    }
}
