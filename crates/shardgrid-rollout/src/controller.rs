//! Rollout controller — one onboarding pass over the catalogue.
//!
//! ```text
//!   namespaces_to_onboard ──(≤ batch)──▶ EnabledNamespace
//!                                             │
//!   enabled_namespaces_without_indices ◀──────┘
//!        │ plan_index_placement
//!        ├── fits ────▶ Replica + Index(pending) ──▶ InitialIndexing
//!        └── no node ─▶ last_rollout_failed_at = now
//! ```
//!
//! The candidate scan reaches `batch + buffer` rows so the pass can tell
//! whether anything is left for the next one.

use std::sync::Arc;

use serde::Serialize;
use shardgrid_core::{FleetSettings, RolloutSettings};
use shardgrid_events::{EventBus, FleetEvent};
use shardgrid_placement::{fleet_storage, plan_index_placement, required_reservation};
use shardgrid_state::*;
use tracing::{debug, info, warn};

use crate::error::{RolloutError, RolloutResult};

/// Name of the single-flight lease guarding rollout passes.
pub const ROLLOUT_LEASE: &str = "rollout";

/// One change made (or, in a dry run, planned) by a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum RolloutChange {
    Enabled {
        root_namespace_id: NamespaceId,
    },
    Provisioned {
        enabled_namespace_id: EnabledNamespaceId,
        namespace_id: NamespaceId,
        node_id: NodeId,
        reserved_bytes: i64,
    },
    NoCapacity {
        enabled_namespace_id: EnabledNamespaceId,
        namespace_id: NamespaceId,
        required_bytes: i64,
    },
}

/// Outcome of [`RolloutController::execute`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RolloutReport {
    pub message: String,
    pub changes: Vec<RolloutChange>,
    /// More candidates exist than this pass inserted.
    pub re_enqueue: bool,
}

impl RolloutReport {
    pub fn enabled(&self) -> usize {
        self.count(|c| matches!(c, RolloutChange::Enabled { .. }))
    }

    pub fn provisioned(&self) -> usize {
        self.count(|c| matches!(c, RolloutChange::Provisioned { .. }))
    }

    pub fn without_capacity(&self) -> usize {
        self.count(|c| matches!(c, RolloutChange::NoCapacity { .. }))
    }

    fn count(&self, f: impl Fn(&RolloutChange) -> bool) -> usize {
        self.changes.iter().filter(|c| f(c)).count()
    }
}

#[derive(Debug)]
struct Provision {
    enabled: EnabledNamespace,
    required_bytes: i64,
    node_id: Option<NodeId>,
}

pub struct RolloutController {
    store: StateStore,
    bus: EventBus,
    settings: Arc<FleetSettings>,
    holder: String,
}

impl RolloutController {
    pub fn new(
        store: StateStore,
        bus: EventBus,
        settings: Arc<FleetSettings>,
        holder: impl Into<String>,
    ) -> Self {
        Self {
            store,
            bus,
            settings,
            holder: holder.into(),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Run one pass. `batch_size` overrides `rollout.batch_size`.
    ///
    /// Fails with [`RolloutError::LeaseHeld`] while another host runs a pass.
    pub fn execute(
        &self,
        dry_run: bool,
        batch_size: Option<usize>,
        now: u64,
    ) -> RolloutResult<RolloutReport> {
        let batch = batch_size.unwrap_or(self.settings.rollout.batch_size);
        let ttl = self.settings.rollout.lease_ttl_secs;

        if !self
            .store
            .try_acquire_lease(ROLLOUT_LEASE, &self.holder, ttl, now)?
        {
            let holder = self
                .store
                .lease(ROLLOUT_LEASE)?
                .map(|lease| lease.holder)
                .unwrap_or_default();
            debug!(%holder, "rollout lease held elsewhere");
            return Err(RolloutError::LeaseHeld { holder });
        }

        let result = self.run_pass(dry_run, batch, now);

        if let Err(e) = self.store.release_lease(ROLLOUT_LEASE, &self.holder) {
            warn!(error = %e, "failed to release rollout lease");
        }
        result
    }

    fn run_pass(&self, dry_run: bool, batch: usize, now: u64) -> RolloutResult<RolloutReport> {
        let rollout = &self.settings.rollout;
        // One row past the batch is enough to tell whether a backlog remains.
        let scan_limit = batch.saturating_add(rollout.buffer.max(1));

        let (candidates, roots) = if dry_run {
            self.store
                .read(|r| select_onboarding(r, scan_limit, batch))?
        } else {
            self.store.write(|w| {
                let (candidates, roots) = select_onboarding(w, scan_limit, batch)?;
                for root in &roots {
                    w.insert(EnabledNamespace::new(*root, now))?;
                }
                Ok((candidates, roots))
            })?
        };

        let mut changes: Vec<RolloutChange> = roots
            .iter()
            .map(|root| RolloutChange::Enabled {
                root_namespace_id: *root,
            })
            .collect();

        let mut wake = Vec::new();
        let plans = if dry_run {
            self.store
                .read(|r| plan_provisioning(r, rollout, batch, now))?
        } else {
            self.store.write(|w| {
                let plans = plan_provisioning(w, rollout, batch, now)?;
                for plan in &plans {
                    match plan.node_id {
                        Some(node_id) => {
                            let replica = w.insert(Replica::new(&plan.enabled, node_id, now))?;
                            let index = w.insert(Index::new(
                                &plan.enabled,
                                node_id,
                                replica.id,
                                plan.required_bytes,
                                now,
                            ))?;
                            wake.push(index.id);
                        }
                        None => {
                            let mut enabled = plan.enabled.clone();
                            enabled.last_rollout_failed_at = Some(now);
                            enabled.updated_at = now;
                            w.put(&enabled)?;
                        }
                    }
                }
                Ok(plans)
            })?
        };

        for plan in &plans {
            changes.push(match plan.node_id {
                Some(node_id) => RolloutChange::Provisioned {
                    enabled_namespace_id: plan.enabled.id,
                    namespace_id: plan.enabled.root_namespace_id,
                    node_id,
                    reserved_bytes: plan.required_bytes,
                },
                None => RolloutChange::NoCapacity {
                    enabled_namespace_id: plan.enabled.id,
                    namespace_id: plan.enabled.root_namespace_id,
                    required_bytes: plan.required_bytes,
                },
            });
        }

        for index_id in wake {
            self.bus.publish(FleetEvent::InitialIndexing { index_id });
        }

        let report = RolloutReport {
            message: String::new(),
            changes,
            re_enqueue: candidates > roots.len(),
        };
        let verb = if dry_run { "would enable" } else { "enabled" };
        let message = format!(
            "{verb} {} namespaces, provisioned {} indices, {} without capacity",
            report.enabled(),
            report.provisioned(),
            report.without_capacity()
        );

        info!(
            dry_run,
            candidates,
            enabled = report.enabled(),
            provisioned = report.provisioned(),
            without_capacity = report.without_capacity(),
            re_enqueue = report.re_enqueue,
            "rollout pass finished"
        );
        Ok(RolloutReport { message, ..report })
    }
}

/// Candidate count and the first `batch` root namespace ids to enable.
fn select_onboarding<R: TableReader>(
    r: &R,
    scan_limit: usize,
    batch: usize,
) -> StateResult<(usize, Vec<NamespaceId>)> {
    let candidates = scopes::namespaces_to_onboard(r, scan_limit)?;
    let roots = candidates.iter().take(batch).map(|ns| ns.id).collect();
    Ok((candidates.len(), roots))
}

/// Plan one index per unplaced enabled namespace. Each placement is charged
/// against the fleet view before the next one is planned.
fn plan_provisioning<R: TableReader>(
    r: &R,
    rollout: &RolloutSettings,
    limit: usize,
    now: u64,
) -> StateResult<Vec<Provision>> {
    let unplaced =
        scopes::enabled_namespaces_without_indices(r, now, rollout.failed_retry_secs, limit)?;
    if unplaced.is_empty() {
        return Ok(Vec::new());
    }

    let mut fleet = fleet_storage(r)?;
    let mut plans = Vec::with_capacity(unplaced.len());
    for enabled in unplaced {
        let storage = r
            .get::<Namespace>(enabled.root_namespace_id)?
            .map(|ns| ns.storage_bytes)
            .unwrap_or(0);
        let required_bytes = required_reservation(storage, rollout.min_reservation_bytes);
        let node_id = plan_index_placement(&fleet, required_bytes);
        if let Some(node_id) = node_id
            && let Some(node) = fleet.iter_mut().find(|n| n.node_id == node_id)
        {
            node.reserved_bytes += required_bytes;
        }
        plans.push(Provision {
            enabled,
            required_bytes,
            node_id,
        });
    }
    Ok(plans)
}
