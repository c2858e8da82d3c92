//! Task dispatcher — binds repositories to their node and queues tasks.
//!
//! Backpressure: before creating anything the dispatcher counts outstanding
//! (pending + processing) tasks. At or above the cluster ceiling it creates
//! nothing and reports [`DispatchOutcome::Deferred`]; the caller re-publishes
//! its wake-up event later. Nodes at their own ceiling are skipped.

use std::collections::{HashMap, HashSet};

use shardgrid_core::LimitSettings;
use shardgrid_events::{EventBus, FleetEvent};
use shardgrid_state::*;
use tracing::{debug, info, warn};

use crate::error::{DispatchError, DispatchResult};

/// Result of one dispatch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Created(usize),
    /// The cluster ceiling was reached; nothing was created.
    Deferred { in_flight: usize },
    /// Indexing is paused or disabled.
    Paused,
}

impl DispatchOutcome {
    pub fn created(&self) -> usize {
        match self {
            DispatchOutcome::Created(n) => *n,
            _ => 0,
        }
    }
}

pub struct TaskDispatcher {
    store: StateStore,
    bus: EventBus,
    limits: LimitSettings,
}

impl TaskDispatcher {
    pub fn new(store: StateStore, bus: EventBus, limits: LimitSettings) -> Self {
        Self { store, bus, limits }
    }

    /// Queue one `task_type` task per repository in `repos`.
    ///
    /// Each repository is re-read inside the transaction and skipped unless
    /// it is still waiting for this kind of work (`pending` for index tasks,
    /// `pending_deletion` for delete tasks) and has no outstanding task.
    /// Index tasks move their repository to `in_progress`. A repository
    /// awaiting deletion whose index no longer exists has nothing left to
    /// delete on any node and is marked `deleted` directly.
    pub fn create_tasks_for(
        &self,
        flags: &FleetFlags,
        repos: &[Repository],
        task_type: TaskType,
        now: u64,
    ) -> DispatchResult<DispatchOutcome> {
        if !flags.indexing_active() {
            debug!(task_type = task_type.as_str(), "indexing paused, dispatch skipped");
            return Ok(DispatchOutcome::Paused);
        }
        if repos.is_empty() {
            return Ok(DispatchOutcome::Created(0));
        }

        let ceiling = self.limits.task_ceiling as usize;
        let per_node_ceiling = self.limits.per_node_task_ceiling as usize;

        let outcome = self.store.write(|w| {
            let outstanding = scopes::outstanding_tasks(w)?;
            if outstanding.len() >= ceiling {
                return Ok(DispatchOutcome::Deferred {
                    in_flight: outstanding.len(),
                });
            }

            let mut per_node: HashMap<NodeId, usize> = HashMap::new();
            let mut busy: HashSet<RepositoryId> = HashSet::new();
            for task in &outstanding {
                *per_node.entry(task.node_id).or_insert(0) += 1;
                busy.insert(task.repository_id);
            }

            let wanted = match task_type {
                TaskType::IndexRepo => RepositoryState::Pending,
                TaskType::DeleteRepo => RepositoryState::PendingDeletion,
            };
            let mut budget = ceiling - outstanding.len();
            let mut created = 0;
            let mut detached = 0;

            for candidate in repos {
                if budget == 0 {
                    break;
                }
                let Some(mut repo) = w.get::<Repository>(candidate.id)? else {
                    continue;
                };
                if repo.state != wanted || busy.contains(&repo.id) {
                    continue;
                }
                let Some(index) = w.get::<Index>(repo.index_id)? else {
                    if task_type == TaskType::DeleteRepo {
                        repo.state = RepositoryState::Deleted;
                        repo.updated_at = now;
                        w.put(&repo)?;
                        detached += 1;
                    }
                    continue;
                };
                let node_load = per_node.entry(index.node_id).or_insert(0);
                if *node_load >= per_node_ceiling {
                    continue;
                }

                w.insert(Task::new(&repo, index.node_id, task_type, now))?;
                if task_type == TaskType::IndexRepo {
                    repo.state = RepositoryState::InProgress;
                    repo.updated_at = now;
                    w.put(&repo)?;
                }
                *node_load += 1;
                busy.insert(repo.id);
                budget -= 1;
                created += 1;
            }

            if detached > 0 {
                debug!(detached, "repositories without index marked deleted");
            }
            Ok(DispatchOutcome::Created(created))
        })?;

        match outcome {
            DispatchOutcome::Deferred { in_flight } => {
                warn!(
                    in_flight,
                    ceiling,
                    task_type = task_type.as_str(),
                    "task ceiling reached, dispatch deferred"
                );
            }
            DispatchOutcome::Created(created) if created > 0 => {
                info!(created, task_type = task_type.as_str(), "tasks created");
            }
            _ => {}
        }
        Ok(outcome)
    }

    // ── Agent lifecycle ────────────────────────────────────────────

    /// Hand up to `limit` due pending tasks of `node_id` to its agent,
    /// moving them to `processing`.
    pub fn claim_tasks(&self, node_id: NodeId, limit: usize, now: u64) -> DispatchResult<Vec<Task>> {
        let claimed = self.store.write(|w| {
            let due = w.scan(
                |t: &Task| t.node_id == node_id && t.state == TaskState::Pending && t.perform_at <= now,
                Some(limit),
            )?;
            let mut claimed = Vec::with_capacity(due.len());
            for mut task in due {
                task.state = TaskState::Processing;
                task.updated_at = now;
                w.put(&task)?;
                claimed.push(task);
            }
            Ok(claimed)
        })?;
        debug!(node_id, claimed = claimed.len(), "tasks claimed");
        Ok(claimed)
    }

    /// Record a finished task and publish `TaskDone`.
    pub fn report_done(&self, task_id: TaskId, size_bytes: i64, now: u64) -> DispatchResult<()> {
        self.finish(task_id, TaskState::Done, now)?;
        self.bus.publish(FleetEvent::TaskDone {
            task_id,
            size_bytes,
        });
        Ok(())
    }

    /// Record a failed task and publish `TaskFailed`.
    pub fn report_failed(&self, task_id: TaskId, now: u64) -> DispatchResult<()> {
        self.finish(task_id, TaskState::Failed, now)?;
        self.bus.publish(FleetEvent::TaskFailed { task_id });
        Ok(())
    }

    /// Move an outstanding task to `state`. Repeating the same report is a
    /// no-op; reporting the opposite outcome is rejected.
    fn finish(&self, task_id: TaskId, state: TaskState, now: u64) -> DispatchResult<()> {
        let previous = self.store.write(|w| {
            let Some(mut task) = w.get::<Task>(task_id)? else {
                return Ok(None);
            };
            let previous = task.state;
            if previous.is_outstanding() {
                task.state = state;
                task.updated_at = now;
                w.put(&task)?;
            }
            Ok(Some(previous))
        })?;

        match previous {
            None => Err(DispatchError::TaskNotFound(task_id)),
            Some(previous) if previous.is_outstanding() || previous == state => {
                debug!(task_id, state = state.as_str(), "task reported");
                Ok(())
            }
            Some(previous) => Err(DispatchError::InvalidTransition {
                task_id,
                state: previous,
            }),
        }
    }
}
