//! Periodic scheduling checks.
//!
//! Each check evaluates a scope and, when it matches, publishes the wake-up
//! event of the worker that owns the transition. Checks never mutate entity
//! state themselves, with one exception: the lost-node check marks nodes
//! lost before publishing `LostNode`.
//!
//! Checks with a configured period run at most once per period across all
//! hosts: the first host to take the lease `scheduling:<check>:<period>` runs
//! it, and the lease outlives the run until the period is over.

use std::sync::Arc;
use std::time::Duration;

use shardgrid_cluster::MembershipManager;
use shardgrid_core::FleetSettings;
use shardgrid_events::{EventBus, FleetEvent};
use shardgrid_state::*;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::context::ReconcileContext;
use crate::error::ReconcileResult;
use crate::workers::purge;

/// Max mismatched indices listed by the watermark diagnostic.
const WATERMARK_REPORT_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduledCheck {
    LostNodes,
    MarkIndicesAsReady,
    InitialIndexing,
    UpdateIndexUsedStorageBytes,
    IndexShouldBeMarkedAsOrphaned,
    IndexToDelete,
    RepoShouldBeMarkedAsOrphaned,
    RepoToDelete,
    RepoToIndex,
    IndicesToEvict,
    IndexShouldBeMarkedAsPendingEviction,
    NodeWithNegativeUnclaimedStorageBytes,
    ForceUpdateOverprovisionedIndex,
    IndexMismatchedWatermark,
    OffboardIneligibleNamespaces,
    AutoIndexRootNamespaces,
    Purge,
}

impl ScheduledCheck {
    pub const ALL: [ScheduledCheck; 17] = [
        ScheduledCheck::LostNodes,
        ScheduledCheck::MarkIndicesAsReady,
        ScheduledCheck::InitialIndexing,
        ScheduledCheck::UpdateIndexUsedStorageBytes,
        ScheduledCheck::IndexShouldBeMarkedAsOrphaned,
        ScheduledCheck::IndexToDelete,
        ScheduledCheck::RepoShouldBeMarkedAsOrphaned,
        ScheduledCheck::RepoToDelete,
        ScheduledCheck::RepoToIndex,
        ScheduledCheck::IndicesToEvict,
        ScheduledCheck::IndexShouldBeMarkedAsPendingEviction,
        ScheduledCheck::NodeWithNegativeUnclaimedStorageBytes,
        ScheduledCheck::ForceUpdateOverprovisionedIndex,
        ScheduledCheck::IndexMismatchedWatermark,
        ScheduledCheck::OffboardIneligibleNamespaces,
        ScheduledCheck::AutoIndexRootNamespaces,
        ScheduledCheck::Purge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduledCheck::LostNodes => "lost_nodes_check",
            ScheduledCheck::MarkIndicesAsReady => "mark_indices_as_ready",
            ScheduledCheck::InitialIndexing => "initial_indexing",
            ScheduledCheck::UpdateIndexUsedStorageBytes => "update_index_used_storage_bytes",
            ScheduledCheck::IndexShouldBeMarkedAsOrphaned => {
                "index_should_be_marked_as_orphaned_check"
            }
            ScheduledCheck::IndexToDelete => "index_to_delete_check",
            ScheduledCheck::RepoShouldBeMarkedAsOrphaned => {
                "repo_should_be_marked_as_orphaned_check"
            }
            ScheduledCheck::RepoToDelete => "repo_to_delete_check",
            ScheduledCheck::RepoToIndex => "repo_to_index_check",
            ScheduledCheck::IndicesToEvict => "indices_to_evict_check",
            ScheduledCheck::IndexShouldBeMarkedAsPendingEviction => {
                "index_should_be_marked_as_pending_eviction_check"
            }
            ScheduledCheck::NodeWithNegativeUnclaimedStorageBytes => {
                "node_with_negative_unclaimed_storage_bytes_check"
            }
            ScheduledCheck::ForceUpdateOverprovisionedIndex => "force_update_overprovisioned_index",
            ScheduledCheck::IndexMismatchedWatermark => "index_mismatched_watermark_check",
            ScheduledCheck::OffboardIneligibleNamespaces => "offboard_ineligible_namespaces",
            ScheduledCheck::AutoIndexRootNamespaces => "auto_index_root_namespaces",
            ScheduledCheck::Purge => "purge",
        }
    }

    /// Seconds between runs for "execute every" checks. `None` runs on every pass.
    pub fn period(&self, settings: &FleetSettings) -> Option<u64> {
        match self {
            ScheduledCheck::LostNodes => Some(settings.scheduling.lost_nodes_check_period_secs),
            ScheduledCheck::IndexMismatchedWatermark => {
                Some(settings.scheduling.watermark_check_period_secs)
            }
            _ => None,
        }
        .filter(|secs| *secs > 0)
    }
}

/// Result of one check.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub check: ScheduledCheck,
    pub published: Vec<FleetEvent>,
    /// The check did not run: its period lease is held or it is disabled.
    pub skipped: bool,
}

impl CheckOutcome {
    fn skipped(check: ScheduledCheck) -> Self {
        Self {
            check,
            published: Vec::new(),
            skipped: true,
        }
    }

    fn published(check: ScheduledCheck, published: Vec<FleetEvent>) -> Self {
        Self {
            check,
            published,
            skipped: false,
        }
    }
}

pub struct SchedulingService {
    store: StateStore,
    bus: EventBus,
    membership: MembershipManager,
    settings: Arc<FleetSettings>,
    /// Identifies this host in period leases.
    holder: String,
}

impl SchedulingService {
    pub fn new(
        store: StateStore,
        bus: EventBus,
        settings: Arc<FleetSettings>,
        holder: impl Into<String>,
    ) -> Self {
        let mut membership = MembershipManager::new(store.clone());
        if let Some(threshold) = settings.lost_node_threshold() {
            membership = membership.with_lost_threshold(threshold);
        }
        Self {
            store,
            bus,
            membership,
            settings,
            holder: holder.into(),
        }
    }

    /// Run one check and publish whatever it found.
    pub fn execute(
        &self,
        check: ScheduledCheck,
        ctx: &ReconcileContext,
    ) -> ReconcileResult<CheckOutcome> {
        if let Some(period) = check.period(&self.settings) {
            let lease = format!("scheduling:{}:{}", check.as_str(), period);
            let holder = format!("{}@{}", self.holder, ctx.now);
            if !self.store.try_acquire_lease(&lease, &holder, period, ctx.now)? {
                debug!(check = check.as_str(), "check ran within its period, skipped");
                return Ok(CheckOutcome::skipped(check));
            }
        }

        let Some(events) = self.evaluate(check, ctx)? else {
            return Ok(CheckOutcome::skipped(check));
        };
        for event in &events {
            self.bus.publish(event.clone());
        }
        if !events.is_empty() {
            debug!(check = check.as_str(), published = events.len(), "check matched");
        }
        Ok(CheckOutcome::published(check, events))
    }

    /// Events the check wants published, or `None` when it is disabled.
    fn evaluate(
        &self,
        check: ScheduledCheck,
        ctx: &ReconcileContext,
    ) -> ReconcileResult<Option<Vec<FleetEvent>>> {
        let indexing = ctx.flags.indexing_active();
        let wake = |found: bool, event: FleetEvent| if found { vec![event] } else { Vec::new() };

        let events = match check {
            ScheduledCheck::LostNodes => {
                if !ctx.marking_lost_enabled() {
                    return Ok(None);
                }
                self.membership
                    .mark_lost_nodes(ctx.now)?
                    .into_iter()
                    .map(|node_id| FleetEvent::LostNode { node_id })
                    .collect()
            }
            ScheduledCheck::MarkIndicesAsReady => wake(
                self.any(|r| scopes::indices_to_mark_ready(r, 1))?,
                FleetEvent::MarkIndicesReady,
            ),
            ScheduledCheck::InitialIndexing => {
                if !indexing {
                    return Ok(None);
                }
                let per_node = ctx.limits().initial_indexing_per_node;
                self.store
                    .read(|r| scopes::pending_indices_on_alive_nodes(r, per_node))?
                    .into_iter()
                    .map(|index| FleetEvent::InitialIndexing { index_id: index.id })
                    .collect()
            }
            ScheduledCheck::UpdateIndexUsedStorageBytes => wake(
                self.any(|r| scopes::indices_with_stale_used_storage(r, 1))?,
                FleetEvent::UpdateIndexUsedStorageBytes,
            ),
            ScheduledCheck::IndexShouldBeMarkedAsOrphaned => wake(
                self.any(|r| scopes::indices_to_mark_orphaned(r, 1))?,
                FleetEvent::OrphanedIndex,
            ),
            ScheduledCheck::IndexToDelete => wake(
                self.any(|r| scopes::indices_marked_to_delete(r, 1))?,
                FleetEvent::IndexMarkedToDelete,
            ),
            ScheduledCheck::RepoShouldBeMarkedAsOrphaned => wake(
                self.any(|r| scopes::repos_to_mark_orphaned(r, 1))?,
                FleetEvent::OrphanedRepo,
            ),
            ScheduledCheck::RepoToDelete => {
                if !indexing {
                    return Ok(None);
                }
                let found = self.any(|r| scopes::repos_to_delete(r, 1))?
                    || self.any(|r| scopes::repos_to_mark_pending_deletion(r, 1))?;
                wake(found, FleetEvent::RepoToDelete)
            }
            ScheduledCheck::RepoToIndex => {
                if !indexing {
                    return Ok(None);
                }
                wake(
                    self.any(|r| scopes::repos_to_index(r, 1))?,
                    FleetEvent::RepoToIndex,
                )
            }
            ScheduledCheck::IndicesToEvict => wake(
                self.any(|r| scopes::indices_to_evict(r, 1))?,
                FleetEvent::IndexToEvict,
            ),
            ScheduledCheck::IndexShouldBeMarkedAsPendingEviction => wake(
                self.any(|r| scopes::indices_to_mark_pending_eviction(r, 1))?,
                FleetEvent::IndexMarkPendingEviction,
            ),
            ScheduledCheck::NodeWithNegativeUnclaimedStorageBytes => {
                let node_ids: Vec<NodeId> = self
                    .store
                    .read(|r| scopes::nodes_with_negative_unclaimed_storage(r))?
                    .into_iter()
                    .map(|(node, _)| node.id)
                    .collect();
                wake(
                    !node_ids.is_empty(),
                    FleetEvent::NodeWithNegativeUnclaimedStorage { node_ids },
                )
            }
            ScheduledCheck::ForceUpdateOverprovisionedIndex => wake(
                self.any(|r| scopes::overprovisioned_ready_indices(r, 1))?,
                FleetEvent::ForceUpdateOverprovisionedIndex,
            ),
            ScheduledCheck::IndexMismatchedWatermark => {
                let mismatched = self.store.read(|r| {
                    scopes::indices_with_mismatched_watermark(r, WATERMARK_REPORT_LIMIT)
                })?;
                if !mismatched.is_empty() {
                    let index_ids: Vec<IndexId> = mismatched.iter().map(|i| i.id).collect();
                    warn!(
                        count = mismatched.len(),
                        indices = ?index_ids,
                        "indices with mismatched watermark level"
                    );
                }
                Vec::new()
            }
            ScheduledCheck::OffboardIneligibleNamespaces => wake(
                self.any(|r| scopes::enabled_namespaces_to_offboard(r, 1))?,
                FleetEvent::OffboardIneligibleNamespaces,
            ),
            ScheduledCheck::AutoIndexRootNamespaces => {
                if !ctx.flags.auto_index_root_namespaces {
                    return Ok(None);
                }
                wake(
                    self.any(|r| scopes::namespaces_to_onboard(r, 1))?,
                    FleetEvent::AutoIndexRootNamespaces,
                )
            }
            ScheduledCheck::Purge => {
                let retention = ctx.limits().task_retention_secs;
                let found = self.store.read(|r| {
                    Ok(purge::has_work(r, ctx.now, retention)?
                        || !scopes::unreconciled_finished_tasks(r, 1)?.is_empty())
                })?;
                wake(found, FleetEvent::Purge)
            }
        };
        Ok(Some(events))
    }

    fn any<T>(
        &self,
        scope: impl FnOnce(&ReadScope) -> StateResult<Vec<T>>,
    ) -> StateResult<bool> {
        Ok(!self.store.read(scope)?.is_empty())
    }

    /// Run every check once. Failures are logged and do not stop the pass.
    pub fn run_all(&self, ctx: &ReconcileContext) -> Vec<CheckOutcome> {
        let mut outcomes = Vec::with_capacity(ScheduledCheck::ALL.len());
        for check in ScheduledCheck::ALL {
            match self.execute(check, ctx) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(check = check.as_str(), error = %e, "scheduling check failed"),
            }
        }
        outcomes
    }

    /// Run a full pass every `scheduling.interval_secs` until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.settings.scheduling.interval_secs.max(1));
        debug!(interval_secs = interval.as_secs(), "scheduling loop starting");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match ReconcileContext::load(&self.store, self.settings.clone()) {
                        Ok(ctx) => {
                            let published: usize =
                                self.run_all(&ctx).iter().map(|o| o.published.len()).sum();
                            debug!(published, "scheduling pass finished");
                        }
                        Err(e) => error!(error = %e, "scheduling pass skipped"),
                    }
                }
                _ = shutdown.changed() => {
                    debug!("scheduling loop shutting down");
                    break;
                }
            }
        }
    }
}
