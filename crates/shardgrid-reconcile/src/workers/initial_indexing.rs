//! Initial indexing of a freshly provisioned index.
//!
//! A pending index receives one repository row per project of its
//! namespace, at most `limits.repository_insert_limit` per invocation. Once
//! every project is covered the index moves to `initializing` and the
//! dispatcher takes over.

use std::collections::HashSet;

use shardgrid_events::FleetEvent;
use shardgrid_state::*;
use tracing::{debug, info};

use crate::context::ReconcileContext;
use crate::error::ReconcileResult;
use crate::outcome::{WorkerOutcome, split_batch};

enum Step {
    Skipped,
    Inserted { inserted: usize, more: bool },
}

pub fn initial_indexing(
    store: &StateStore,
    ctx: &ReconcileContext,
    index_id: IndexId,
) -> ReconcileResult<WorkerOutcome> {
    let cap = ctx.limits().repository_insert_limit;
    let retries = ctx.limits().repository_retries;

    let step = store.write(|w| {
        let Some(mut index) = w.get::<Index>(index_id)? else {
            return Ok(Step::Skipped);
        };
        if index.state != IndexState::Pending {
            return Ok(Step::Skipped);
        }
        let enabled = match index.enabled_namespace_id {
            Some(id) => w.get::<EnabledNamespace>(id)?,
            None => None,
        };
        if enabled.is_none() {
            return Ok(Step::Skipped);
        }

        let covered: HashSet<ProjectId> = w
            .scan(|r: &Repository| r.index_id == index.id, None)?
            .into_iter()
            .map(|r| r.project_id)
            .collect();
        let missing = w.scan(
            |p: &Project| p.namespace_id == index.namespace_id && !covered.contains(&p.id),
            Some(cap + 1),
        )?;
        let (projects, more) = split_batch(missing, cap);

        for project in &projects {
            let mut repo = Repository::new(project, &index, retries, ctx.now);
            repo.size_bytes = project.size_bytes;
            w.insert(repo)?;
        }
        if !more {
            index.state = IndexState::Initializing;
            index.updated_at = ctx.now;
            w.put(&index)?;
        }
        Ok(Step::Inserted {
            inserted: projects.len(),
            more,
        })
    })?;

    let outcome = WorkerOutcome::new("initial_indexing");
    match step {
        Step::Skipped => {
            debug!(index_id, "index not awaiting initial indexing");
            Ok(outcome)
        }
        Step::Inserted {
            inserted,
            more: true,
        } => Ok(outcome
            .with_affected(inserted)
            .then(FleetEvent::InitialIndexing { index_id })),
        Step::Inserted {
            inserted,
            more: false,
        } => {
            info!(index_id, inserted, "index initializing");
            Ok(outcome
                .with_affected(inserted)
                .then(FleetEvent::RepoToIndex)
                .then(FleetEvent::MarkIndicesReady))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::testing::*;

    #[test]
    fn inserts_in_capped_steps_then_initializes() {
        let fleet = Fleet::with_settings(|s| s.limits.repository_insert_limit = 2);
        let node = fleet.node("node-1", 1_000_000);
        let index = fleet.index_on(&node, 1, 1_000, IndexState::Pending);
        for _ in 0..5 {
            fleet.project(1, 10);
        }
        fleet.project(2, 10);
        let ctx = fleet.ctx();

        let first = initial_indexing(&fleet.store, &ctx, index.id).unwrap();
        assert_eq!(first.affected, 2);
        assert!(first.chained(&FleetEvent::InitialIndexing { index_id: index.id }));
        assert_eq!(fleet.index(index.id).state, IndexState::Pending);

        initial_indexing(&fleet.store, &ctx, index.id).unwrap();
        let last = initial_indexing(&fleet.store, &ctx, index.id).unwrap();
        assert_eq!(last.affected, 1);
        assert!(last.chained(&FleetEvent::RepoToIndex));
        assert_eq!(fleet.index(index.id).state, IndexState::Initializing);

        let repos = fleet.store.list::<Repository>().unwrap();
        assert_eq!(repos.len(), 5);
        assert!(repos.iter().all(|r| r.state == RepositoryState::Pending));
        assert!(repos.iter().all(|r| r.retries_left == 3 && r.size_bytes == 10));
    }

    #[test]
    fn non_pending_index_is_skipped() {
        let fleet = Fleet::new();
        let node = fleet.node("node-1", 1_000_000);
        let index = fleet.index_on(&node, 1, 1_000, IndexState::Ready);
        fleet.project(1, 10);

        let outcome = initial_indexing(&fleet.store, &fleet.ctx(), index.id).unwrap();
        assert_eq!(outcome.affected, 0);
        assert!(outcome.follow_up.is_empty());
        assert!(fleet.store.list::<Repository>().unwrap().is_empty());
    }

    #[test]
    fn empty_namespace_initializes_immediately() {
        let fleet = Fleet::new();
        let node = fleet.node("node-1", 1_000_000);
        let index = fleet.index_on(&node, 1, 1_000, IndexState::Pending);

        let outcome = initial_indexing(&fleet.store, &fleet.ctx(), index.id).unwrap();
        assert!(outcome.chained(&FleetEvent::MarkIndicesReady));
        assert_eq!(fleet.index(index.id).state, IndexState::Initializing);
    }
}
