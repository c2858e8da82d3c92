//! Control plane — wires the subsystems together and runs their loops.
//!
//! In `run`, the daemon:
//! 1. Registers every worker on the event bus
//! 2. Starts the bus, store-health, scheduling, rollout and metrics loops
//! 3. Waits for Ctrl-C, then flips the shared shutdown signal

use std::sync::Arc;
use std::time::Duration;

use shardgrid_cluster::MembershipManager;
use shardgrid_core::FleetSettings;
use shardgrid_dispatch::TaskDispatcher;
use shardgrid_events::EventBus;
use shardgrid_metrics::MetricsAggregator;
use shardgrid_reconcile::{ReconcileContext, ReconcileService, SchedulingService, StoreHealth};
use shardgrid_rollout::{RetryPolicy, RolloutController, RolloutRunner};
use shardgrid_state::StateStore;
use tokio::sync::watch;
use tracing::{error, info};

pub struct ControlPlane {
    pub store: StateStore,
    pub bus: EventBus,
    pub settings: Arc<FleetSettings>,
    pub health: StoreHealth,
    pub membership: Arc<MembershipManager>,
    pub reconcile: Arc<ReconcileService>,
    pub scheduling: Arc<SchedulingService>,
    pub rollout: Arc<RolloutController>,
    pub metrics: Arc<MetricsAggregator>,
}

impl ControlPlane {
    /// Open the on-disk store under `store.data_dir` and build the subsystems.
    pub fn open(settings: FleetSettings, holder: &str) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&settings.store.data_dir)?;
        let db_path = settings.db_path();
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");
        Ok(Self::new(store, Arc::new(settings), holder))
    }

    pub fn new(store: StateStore, settings: Arc<FleetSettings>, holder: &str) -> Self {
        let bus = EventBus::new(settings.bus.clone());
        let health = StoreHealth::new(store.clone(), &settings.health);

        let mut membership = MembershipManager::new(store.clone());
        if let Some(threshold) = settings.lost_node_threshold() {
            membership = membership.with_lost_threshold(threshold);
        }

        let reconcile = ReconcileService::new(
            store.clone(),
            bus.clone(),
            settings.clone(),
            health.clone(),
        );
        let scheduling =
            SchedulingService::new(store.clone(), bus.clone(), settings.clone(), holder);
        let rollout = RolloutController::new(store.clone(), bus.clone(), settings.clone(), holder);
        let metrics = MetricsAggregator::new(
            store.clone(),
            Duration::from_secs(settings.metrics.interval_secs.max(1)),
        );

        Self {
            store,
            bus,
            settings,
            health,
            membership: Arc::new(membership),
            reconcile: Arc::new(reconcile),
            scheduling: Arc::new(scheduling),
            rollout: Arc::new(rollout),
            metrics: Arc::new(metrics),
        }
    }

    /// The dispatcher node agents claim from and report to.
    pub fn dispatcher(&self) -> &TaskDispatcher {
        self.reconcile.dispatcher()
    }

    /// Subscribe every worker to its events.
    pub async fn register_workers(&self) {
        self.reconcile.register().await;
        info!("reconciliation workers registered");
    }

    /// Deliver everything queued on the bus, including follow-ups.
    pub async fn drain(&self) -> usize {
        self.bus.deliver_pending().await
    }

    /// One scheduling pass followed by a full drain of the bus.
    pub async fn tick(&self) -> anyhow::Result<usize> {
        let ctx = ReconcileContext::load(&self.store, self.settings.clone())?;
        self.scheduling.run_all(&ctx);
        Ok(self.drain().await)
    }

    /// Run every loop until Ctrl-C.
    pub async fn run(self) -> anyhow::Result<()> {
        info!("ShardGrid control plane starting");
        self.register_workers().await;

        // ── Shutdown signal ────────────────────────────────────────

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // ── Background tasks ───────────────────────────────────────

        let bus = self.bus.clone();
        let bus_shutdown = shutdown_rx.clone();
        let bus_handle = tokio::spawn(async move {
            bus.run(bus_shutdown).await;
        });

        let health = self.health.clone();
        let health_interval = Duration::from_secs(self.settings.health.probe_interval_secs.max(1));
        let health_shutdown = shutdown_rx.clone();
        let health_handle = tokio::spawn(async move {
            health.run(health_interval, health_shutdown).await;
        });

        let scheduling = Arc::clone(&self.scheduling);
        let scheduling_shutdown = shutdown_rx.clone();
        let scheduling_handle = tokio::spawn(async move {
            scheduling.run(scheduling_shutdown).await;
        });

        let runner = RolloutRunner::new(
            Arc::clone(&self.rollout),
            RetryPolicy::from_settings(&self.settings.rollout),
            Duration::from_secs(self.settings.scheduling.interval_secs.max(1)),
        );
        let rollout_shutdown = shutdown_rx.clone();
        let rollout_handle = tokio::spawn(async move {
            runner.run(rollout_shutdown).await;
        });

        let metrics = Arc::clone(&self.metrics);
        let metrics_shutdown = shutdown_rx.clone();
        let metrics_handle = tokio::spawn(async move {
            metrics.run(metrics_shutdown).await;
        });

        info!("control plane running, Ctrl-C to stop");
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C, shutting down");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);

        let _ = bus_handle.await;
        let _ = health_handle.await;
        let _ = scheduling_handle.await;
        let _ = rollout_handle.await;
        let _ = metrics_handle.await;

        info!("control plane stopped");
        Ok(())
    }
}
