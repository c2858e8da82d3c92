//! Lost-node handling.
//!
//! A lost node's shards are unrecoverable. Once the heartbeat is confirmed
//! expired inside the transaction, the node is removed together with every
//! repository, index, replica and task placed on it.

use std::collections::HashSet;

use shardgrid_state::*;
use tracing::{info, warn};

use crate::context::ReconcileContext;
use crate::error::ReconcileResult;
use crate::outcome::WorkerOutcome;

const WORKER: &str = "lost_node";

enum LostNodeAction {
    Missing,
    Recovered,
    Removed {
        indices: usize,
        repositories: usize,
        replicas: usize,
        tasks: usize,
    },
}

pub fn handle_lost_node(
    store: &StateStore,
    ctx: &ReconcileContext,
    node_id: NodeId,
) -> ReconcileResult<WorkerOutcome> {
    let Some(threshold) = ctx.settings.lost_node_threshold() else {
        warn!(node_id, "lost-node threshold unset, node kept");
        return Ok(WorkerOutcome::new(WORKER));
    };
    let threshold_secs = threshold.as_secs();

    let action = store.write(|w| {
        let Some(mut node) = w.get::<Node>(node_id)? else {
            return Ok(LostNodeAction::Missing);
        };
        if !node.heartbeat_expired(ctx.now, threshold_secs) {
            if node.liveness == NodeLiveness::Lost {
                node.liveness = NodeLiveness::Alive;
                w.put(&node)?;
            }
            return Ok(LostNodeAction::Recovered);
        }

        let index_ids: HashSet<IndexId> = w
            .scan(|i: &Index| i.node_id == node_id, None)?
            .into_iter()
            .map(|i| i.id)
            .collect();
        let repo_ids: HashSet<RepositoryId> = w
            .scan(|r: &Repository| index_ids.contains(&r.index_id), None)?
            .into_iter()
            .map(|r| r.id)
            .collect();
        let tasks = w.scan(
            |t: &Task| t.node_id == node_id || repo_ids.contains(&t.repository_id),
            None,
        )?;
        let replicas = w.scan(|p: &Replica| p.node_id == node_id, None)?;

        let task_ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
        let replica_ids: Vec<ReplicaId> = replicas.iter().map(|p| p.id).collect();
        let repo_ids: Vec<RepositoryId> = repo_ids.into_iter().collect();
        let index_ids: Vec<IndexId> = index_ids.into_iter().collect();

        let tasks = w.remove_many::<Task>(&task_ids)?;
        let repositories = w.remove_many::<Repository>(&repo_ids)?;
        let indices = w.remove_many::<Index>(&index_ids)?;
        let replicas = w.remove_many::<Replica>(&replica_ids)?;
        w.remove::<Node>(node_id)?;

        Ok(LostNodeAction::Removed {
            indices,
            repositories,
            replicas,
            tasks,
        })
    })?;

    let outcome = WorkerOutcome::new(WORKER);
    match action {
        LostNodeAction::Missing => Ok(outcome),
        LostNodeAction::Recovered => {
            info!(node_id, "node heartbeat recovered, removal aborted");
            Ok(outcome)
        }
        LostNodeAction::Removed {
            indices,
            repositories,
            replicas,
            tasks,
        } => {
            warn!(
                node_id,
                indices, repositories, replicas, tasks, "lost node removed from fleet"
            );
            Ok(outcome.with_affected(indices + repositories + replicas + tasks + 1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::testing::*;

    #[test]
    fn removes_node_and_everything_on_it() {
        let fleet = Fleet::new();
        let node = fleet.node("node-1", 1_000);
        let other = fleet.node("node-2", 1_000);
        let a = fleet.index_on(&node, 1, 100, IndexState::Ready);
        let b = fleet.index_on(&node, 2, 100, IndexState::Ready);
        let kept = fleet.index_on(&other, 3, 100, IndexState::Ready);
        fleet.repos(&a, 3, RepositoryState::Ready);
        let pending = fleet.repos(&b, 2, RepositoryState::Pending);
        fleet.repos(&kept, 1, RepositoryState::Ready);
        fleet.task(&pending[0], node.id, TaskType::IndexRepo);

        let ctx = fleet.ctx_at(node.last_seen_at + 13 * 60 * 60);
        fleet.heartbeat(other.id, ctx.now);
        let outcome = handle_lost_node(&fleet.store, &ctx, node.id).unwrap();
        assert!(outcome.affected > 0);

        assert!(fleet.store.find::<Node>(node.id).unwrap().is_none());
        assert!(fleet.store.find::<Index>(a.id).unwrap().is_none());
        assert!(fleet.store.find::<Index>(b.id).unwrap().is_none());
        assert_eq!(fleet.store.list::<Repository>().unwrap().len(), 1);
        assert!(fleet.store.list::<Task>().unwrap().is_empty());
        assert!(fleet.store.find::<Index>(kept.id).unwrap().is_some());
    }

    #[test]
    fn recovered_heartbeat_aborts_removal() {
        let fleet = Fleet::new();
        let node = fleet.node("node-1", 1_000);
        fleet.index_on(&node, 1, 100, IndexState::Ready);
        fleet
            .store
            .bulk_update(&[node.id], |n: &mut Node| n.liveness = NodeLiveness::Lost)
            .unwrap();

        let ctx = fleet.ctx_at(node.last_seen_at + 10);
        let outcome = handle_lost_node(&fleet.store, &ctx, node.id).unwrap();
        assert_eq!(outcome.affected, 0);
        let node: Node = fleet.store.get(node.id).unwrap();
        assert_eq!(node.liveness, NodeLiveness::Alive);
        assert_eq!(fleet.store.list::<Index>().unwrap().len(), 1);
    }

    #[test]
    fn second_run_is_noop() {
        let fleet = Fleet::new();
        let node = fleet.node("node-1", 1_000);
        let ctx = fleet.ctx_at(node.last_seen_at + 13 * 60 * 60);
        handle_lost_node(&fleet.store, &ctx, node.id).unwrap();
        let again = handle_lost_node(&fleet.store, &ctx, node.id).unwrap();
        assert_eq!(again.affected, 0);
    }
}
