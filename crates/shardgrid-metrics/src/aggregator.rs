//! Fleet snapshots.
//!
//! A snapshot is computed from a single read transaction, so every count in
//! it describes the same instant. Nothing here writes to the store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use shardgrid_core::epoch_secs;
use shardgrid_placement::fleet_storage;
use shardgrid_state::*;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskCount {
    pub task_type: TaskType,
    pub state: TaskState,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FleetSnapshot {
    pub taken_at: u64,
    pub nodes_alive: u64,
    pub nodes_lost: u64,
    pub capacity_bytes: i64,
    pub used_bytes: i64,
    pub reserved_bytes: i64,
    pub unclaimed_bytes: i64,
    /// Index count keyed by state name. Every state is present.
    pub indices: BTreeMap<&'static str, u64>,
    /// Repository count keyed by state name. Every state is present.
    pub repositories: BTreeMap<&'static str, u64>,
    pub tasks: Vec<TaskCount>,
    /// Pending plus processing tasks.
    pub queue_depth: u64,
    pub enabled_namespaces: u64,
    /// Ready repositories over repositories not being deleted, 0–100.
    pub percent_complete: f64,
}

impl FleetSnapshot {
    pub fn indices_in(&self, state: IndexState) -> u64 {
        self.indices.get(state.as_str()).copied().unwrap_or(0)
    }

    pub fn repositories_in(&self, state: RepositoryState) -> u64 {
        self.repositories.get(state.as_str()).copied().unwrap_or(0)
    }

    pub fn tasks_in(&self, task_type: TaskType, state: TaskState) -> u64 {
        self.tasks
            .iter()
            .find(|t| t.task_type == task_type && t.state == state)
            .map(|t| t.count)
            .unwrap_or(0)
    }
}

/// Compute a snapshot against any reader.
pub fn collect_snapshot<R: TableReader>(r: &R, now: u64) -> StateResult<FleetSnapshot> {
    let mut snapshot = FleetSnapshot {
        taken_at: now,
        ..FleetSnapshot::default()
    };

    for node in fleet_storage(r)? {
        if node.alive {
            snapshot.nodes_alive += 1;
        } else {
            snapshot.nodes_lost += 1;
        }
        snapshot.capacity_bytes += node.total_bytes;
        snapshot.used_bytes += node.used_bytes;
        snapshot.reserved_bytes += node.reserved_bytes;
        snapshot.unclaimed_bytes += node.unclaimed_bytes();
    }

    snapshot.indices = IndexState::ALL.iter().map(|s| (s.as_str(), 0)).collect();
    for index in r.all::<Index>()? {
        *snapshot.indices.entry(index.state.as_str()).or_default() += 1;
    }

    snapshot.repositories = RepositoryState::ALL
        .iter()
        .map(|s| (s.as_str(), 0))
        .collect();
    let mut ready = 0u64;
    let mut tracked = 0u64;
    for repo in r.all::<Repository>()? {
        *snapshot.repositories.entry(repo.state.as_str()).or_default() += 1;
        match repo.state {
            RepositoryState::PendingDeletion | RepositoryState::Deleted => {}
            RepositoryState::Ready => {
                ready += 1;
                tracked += 1;
            }
            _ => tracked += 1,
        }
    }
    snapshot.percent_complete = if tracked == 0 {
        0.0
    } else {
        ready as f64 * 100.0 / tracked as f64
    };

    let tasks = r.all::<Task>()?;
    for task_type in TaskType::ALL {
        for state in TaskState::ALL {
            let count = tasks
                .iter()
                .filter(|t| t.task_type == task_type && t.state == state)
                .count() as u64;
            snapshot.tasks.push(TaskCount {
                task_type,
                state,
                count,
            });
        }
    }
    snapshot.queue_depth = tasks.iter().filter(|t| t.state.is_outstanding()).count() as u64;

    snapshot.enabled_namespaces = r.all::<EnabledNamespace>()?.len() as u64;
    Ok(snapshot)
}

/// Periodically snapshots the fleet and keeps the latest result.
pub struct MetricsAggregator {
    store: StateStore,
    interval: Duration,
    latest: Arc<RwLock<Option<FleetSnapshot>>>,
}

impl MetricsAggregator {
    pub fn new(store: StateStore, interval: Duration) -> Self {
        Self {
            store,
            interval,
            latest: Arc::new(RwLock::new(None)),
        }
    }

    /// Take a snapshot now and remember it.
    pub async fn snapshot(&self, now: u64) -> anyhow::Result<FleetSnapshot> {
        let snapshot = self.store.read(|r| collect_snapshot(r, now))?;
        debug!(
            queue_depth = snapshot.queue_depth,
            enabled_namespaces = snapshot.enabled_namespaces,
            percent_complete = snapshot.percent_complete,
            "fleet snapshot taken"
        );
        *self.latest.write().await = Some(snapshot.clone());
        Ok(snapshot)
    }

    pub async fn latest(&self) -> Option<FleetSnapshot> {
        self.latest.read().await.clone()
    }

    /// Run the snapshot loop until shutdown signal.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "metrics aggregator started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    match self.snapshot(epoch_secs()).await {
                        Ok(s) => info!(
                            nodes_alive = s.nodes_alive,
                            nodes_lost = s.nodes_lost,
                            queue_depth = s.queue_depth,
                            unclaimed_bytes = s.unclaimed_bytes,
                            percent_complete = s.percent_complete,
                            "fleet metrics"
                        ),
                        Err(e) => error!(error = %e, "metrics snapshot failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("metrics aggregator shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        let alive = store.insert(Node::new("node-1", 1_000, 0)).unwrap();
        let mut lost = Node::new("node-2", 500, 0);
        lost.liveness = NodeLiveness::Lost;
        store.insert(lost).unwrap();

        let enabled = store.insert(EnabledNamespace::new(1, 0)).unwrap();
        let index = store
            .insert(Index::new(&enabled, alive.id, 1, 400, 0))
            .unwrap();
        let mut evicted = Index::new(&enabled, alive.id, 1, 300, 0);
        evicted.state = IndexState::Evicted;
        store.insert(evicted).unwrap();

        let states = [
            RepositoryState::Ready,
            RepositoryState::Ready,
            RepositoryState::Ready,
            RepositoryState::Pending,
            RepositoryState::PendingDeletion,
        ];
        for (i, state) in states.into_iter().enumerate() {
            let project = Project::new(i as u64 + 1, 1, 10, 0);
            let mut repo = Repository::new(&project, &index, 3, 0);
            repo.state = state;
            let repo = store.insert(repo).unwrap();
            if state == RepositoryState::Pending {
                store
                    .insert(Task::new(&repo, alive.id, TaskType::IndexRepo, 0))
                    .unwrap();
            }
        }
        store
    }

    #[test]
    fn counts_by_state() {
        let store = seeded();
        let snapshot = store.read(|r| collect_snapshot(r, 42)).unwrap();

        assert_eq!(snapshot.taken_at, 42);
        assert_eq!(snapshot.nodes_alive, 1);
        assert_eq!(snapshot.nodes_lost, 1);
        assert_eq!(snapshot.indices.len(), IndexState::ALL.len());
        assert_eq!(snapshot.indices_in(IndexState::Pending), 1);
        assert_eq!(snapshot.indices_in(IndexState::Evicted), 1);
        assert_eq!(snapshot.indices_in(IndexState::Ready), 0);
        assert_eq!(snapshot.repositories_in(RepositoryState::Ready), 3);
        assert_eq!(snapshot.tasks.len(), 8);
        assert_eq!(
            snapshot.tasks_in(TaskType::IndexRepo, TaskState::Pending),
            1
        );
        assert_eq!(snapshot.queue_depth, 1);
        assert_eq!(snapshot.enabled_namespaces, 1);
    }

    #[test]
    fn storage_excludes_evicted_reservations() {
        let snapshot = seeded().read(|r| collect_snapshot(r, 0)).unwrap();
        assert_eq!(snapshot.capacity_bytes, 1_500);
        assert_eq!(snapshot.reserved_bytes, 400);
        assert_eq!(snapshot.unclaimed_bytes, 1_100);
    }

    #[test]
    fn percent_complete_ignores_deletions() {
        let snapshot = seeded().read(|r| collect_snapshot(r, 0)).unwrap();
        assert_eq!(snapshot.percent_complete, 75.0);

        let empty = StateStore::open_in_memory().unwrap();
        let snapshot = empty.read(|r| collect_snapshot(r, 0)).unwrap();
        assert_eq!(snapshot.percent_complete, 0.0);
    }

    #[tokio::test]
    async fn aggregator_keeps_latest() {
        let aggregator = MetricsAggregator::new(seeded(), Duration::from_secs(60));
        assert!(aggregator.latest().await.is_none());

        let taken = aggregator.snapshot(7).await.unwrap();
        assert_eq!(aggregator.latest().await, Some(taken));
    }
}
