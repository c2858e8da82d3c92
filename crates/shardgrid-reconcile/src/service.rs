//! Event routing from the bus to the workers.

use std::sync::Arc;
use std::time::Duration;

use shardgrid_core::FleetSettings;
use shardgrid_dispatch::TaskDispatcher;
use shardgrid_events::{EventBus, EventKind, FleetEvent};
use shardgrid_state::StateStore;
use tracing::{debug, warn};

use crate::context::ReconcileContext;
use crate::error::ReconcileResult;
use crate::health::StoreHealth;
use crate::outcome::WorkerOutcome;
use crate::workers::{
    delete_cascade, dispatch, eviction, initial_indexing, lost_node, namespaces, orphans,
    projects, purge, readiness, storage, tasks,
};

/// Subscribes every worker to its event and publishes what the workers ask
/// for next.
pub struct ReconcileService {
    store: StateStore,
    bus: EventBus,
    dispatcher: TaskDispatcher,
    settings: Arc<FleetSettings>,
    health: StoreHealth,
}

impl ReconcileService {
    pub fn new(
        store: StateStore,
        bus: EventBus,
        settings: Arc<FleetSettings>,
        health: StoreHealth,
    ) -> Self {
        let dispatcher = TaskDispatcher::new(store.clone(), bus.clone(), settings.limits.clone());
        Self {
            store,
            bus,
            dispatcher,
            settings,
            health,
        }
    }

    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    /// Subscribe to every event kind.
    pub async fn register(self: &Arc<Self>) {
        for kind in EventKind::ALL {
            let service = Arc::clone(self);
            self.bus
                .subscribe(kind, move |event| {
                    let service = Arc::clone(&service);
                    async move { service.handle(event) }
                })
                .await;
        }
    }

    /// Run the worker owning `event`, unless the store is degraded, in which
    /// case the event comes back after `health.defer_secs`.
    pub fn handle(&self, event: FleetEvent) -> anyhow::Result<()> {
        if self.health.is_degraded() {
            let kind = event.kind();
            warn!(%kind, defer_secs = self.settings.health.defer_secs, "store degraded, event deferred");
            self.bus.publish_after(self.defer_delay(), event);
            return Ok(());
        }

        let ctx = ReconcileContext::load(&self.store, self.settings.clone())?;
        let outcome = self.route(&ctx, event)?;
        outcome.log();
        for follow_up in outcome.follow_up {
            self.bus.publish(follow_up);
        }
        for later in outcome.retry_later {
            debug!(kind = %later.kind(), "event re-published after delay");
            self.bus.publish_after(self.defer_delay(), later);
        }
        Ok(())
    }

    fn defer_delay(&self) -> Duration {
        Duration::from_secs(self.settings.health.defer_secs)
    }

    pub fn route(&self, ctx: &ReconcileContext, event: FleetEvent) -> ReconcileResult<WorkerOutcome> {
        let store = &self.store;
        match event {
            FleetEvent::LostNode { node_id } => lost_node::handle_lost_node(store, ctx, node_id),
            FleetEvent::OrphanedIndex => orphans::mark_orphaned_indices(store, ctx),
            FleetEvent::IndexMarkPendingEviction => {
                eviction::mark_indices_pending_eviction(store, ctx)
            }
            FleetEvent::IndexToEvict => eviction::evict_indices(store, ctx),
            FleetEvent::NodeWithNegativeUnclaimedStorage { node_ids } => {
                eviction::rebalance_node_storage(store, ctx, &node_ids)
            }
            FleetEvent::UpdateIndexUsedStorageBytes => {
                storage::update_index_used_storage_bytes(store, ctx)
            }
            FleetEvent::ForceUpdateOverprovisionedIndex => {
                storage::force_update_overprovisioned(store, ctx)
            }
            FleetEvent::InitialIndexing { index_id } => {
                initial_indexing::initial_indexing(store, ctx, index_id)
            }
            FleetEvent::MarkIndicesReady => readiness::mark_indices_ready(store, ctx),
            FleetEvent::IndexMarkedToDelete => delete_cascade::delete_marked_indices(store, ctx),
            FleetEvent::OrphanedRepo => orphans::mark_orphaned_repos(store, ctx),
            FleetEvent::RepoToIndex => {
                dispatch::dispatch_repos_to_index(store, ctx, &self.dispatcher)
            }
            FleetEvent::RepoToDelete => {
                dispatch::dispatch_repos_to_delete(store, ctx, &self.dispatcher)
            }
            FleetEvent::TaskDone {
                task_id,
                size_bytes,
            } => tasks::task_done(store, ctx, task_id, size_bytes),
            FleetEvent::TaskFailed { task_id } => tasks::task_failed(store, ctx, task_id),
            FleetEvent::ProjectCreated { project_id } => {
                projects::project_created(store, ctx, project_id)
            }
            FleetEvent::ProjectDeleted { project_id } => {
                projects::project_deleted(store, ctx, project_id)
            }
            FleetEvent::ProjectTransferred {
                project_id,
                old_namespace_id,
            } => projects::project_transferred(store, ctx, project_id, old_namespace_id),
            FleetEvent::NamespaceOffboarded { root_namespace_id } => {
                namespaces::namespace_offboarded(store, ctx, root_namespace_id)
            }
            FleetEvent::OffboardIneligibleNamespaces => {
                namespaces::offboard_ineligible_namespaces(store, ctx)
            }
            FleetEvent::AutoIndexRootNamespaces => {
                namespaces::auto_index_root_namespaces(store, ctx)
            }
            FleetEvent::Purge => {
                // Stranded task results are applied first so their tasks
                // become purgeable.
                let replayed = tasks::reconcile_finished_tasks(store, ctx)?;
                let mut outcome = purge::purge(store, ctx)?;
                outcome.affected += replayed.affected;
                outcome.follow_up.extend(replayed.follow_up);
                Ok(outcome)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardgrid_core::BusSettings;
    use shardgrid_state::*;

    struct Harness {
        store: StateStore,
        bus: EventBus,
        health: StoreHealth,
        service: Arc<ReconcileService>,
    }

    async fn harness() -> Harness {
        let store = StateStore::open_in_memory().unwrap();
        let bus = EventBus::new(BusSettings {
            max_deliveries: 3,
            redelivery_delay_ms: 0,
        });
        let settings = Arc::new(FleetSettings::default());
        let health = StoreHealth::new(store.clone(), &settings.health);
        let service = Arc::new(ReconcileService::new(
            store.clone(),
            bus.clone(),
            settings,
            health.clone(),
        ));
        service.register().await;
        Harness {
            store,
            bus,
            health,
            service,
        }
    }

    #[tokio::test]
    async fn initial_indexing_runs_through_to_tasks() {
        let h = harness().await;
        let node = h.store.insert(Node::new("node-1", 1_000_000, 0)).unwrap();
        h.store.put(&Namespace::new(1, "group-1", 100, 0)).unwrap();
        let enabled = h.store.enable_namespace(1, 0).unwrap();
        let replica = h.store.insert(Replica::new(&enabled, node.id, 0)).unwrap();
        let index = h
            .store
            .insert(Index::new(&enabled, node.id, replica.id, 1_000, 0))
            .unwrap();
        h.store.put(&Project::new(10, 1, 50, 0)).unwrap();
        h.store.put(&Project::new(11, 1, 50, 0)).unwrap();

        h.bus.publish(FleetEvent::InitialIndexing { index_id: index.id });
        h.bus.deliver_pending().await;

        let index: Index = h.store.get(index.id).unwrap();
        assert_eq!(index.state, IndexState::Initializing);
        assert_eq!(h.store.list::<Task>().unwrap().len(), 2);
        assert_eq!(
            h.store
                .count(|r: &Repository| r.state == RepositoryState::InProgress)
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn degraded_store_defers_work() {
        let h = harness().await;
        let node = h.store.insert(Node::new("node-1", 1_000, 0)).unwrap();
        h.health.set_degraded(true);

        h.bus.publish(FleetEvent::LostNode { node_id: node.id });
        h.bus.deliver_pending().await;
        assert!(h.store.find::<Node>(node.id).unwrap().is_some());
        assert_eq!(h.bus.stats().failed, 0);
    }

    #[tokio::test]
    async fn route_is_callable_directly() {
        let h = harness().await;
        let ctx = ReconcileContext::load(&h.store, Arc::new(FleetSettings::default())).unwrap();
        let outcome = h.service.route(&ctx, FleetEvent::Purge).unwrap();
        assert_eq!(outcome.affected, 0);
        assert!(outcome.follow_up.is_empty());
    }
}
