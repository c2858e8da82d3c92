//! Namespace onboarding and offboarding.

use shardgrid_events::FleetEvent;
use shardgrid_state::*;
use tracing::info;

use crate::context::ReconcileContext;
use crate::error::ReconcileResult;
use crate::outcome::{WorkerOutcome, split_batch};
use crate::workers::orphans::{mark_orphaned_indices, mark_orphaned_repos};

/// Delete `EnabledNamespace` rows whose catalogue namespace is gone or no
/// longer eligible. Their indices and repositories are then orphaned.
pub fn offboard_ineligible_namespaces(
    store: &StateStore,
    ctx: &ReconcileContext,
) -> ReconcileResult<WorkerOutcome> {
    let cap = ctx.limits().orphan_batch;
    let (removed, more) = store.write(|w| {
        let (batch, more) = split_batch(scopes::enabled_namespaces_to_offboard(w, cap + 1)?, cap);
        let ids: Vec<EnabledNamespaceId> = batch.iter().map(|e| e.id).collect();
        Ok((w.remove_many::<EnabledNamespace>(&ids)?, more))
    })?;
    if removed > 0 {
        info!(removed, "ineligible namespaces offboarded");
    }
    Ok(WorkerOutcome::new("offboard_ineligible_namespaces")
        .with_affected(removed)
        .then_if(removed > 0, FleetEvent::OrphanedIndex)
        .then_if(removed > 0, FleetEvent::OrphanedRepo)
        .then_if(more, FleetEvent::OffboardIneligibleNamespaces))
}

/// A namespace was offboarded out of band: drop its `EnabledNamespace` if
/// still present and orphan what it left behind.
pub fn namespace_offboarded(
    store: &StateStore,
    ctx: &ReconcileContext,
    root_namespace_id: NamespaceId,
) -> ReconcileResult<WorkerOutcome> {
    let removed = store.write(|w| {
        let ids: Vec<EnabledNamespaceId> = w
            .scan(
                |e: &EnabledNamespace| e.root_namespace_id == root_namespace_id,
                None,
            )?
            .into_iter()
            .map(|e| e.id)
            .collect();
        w.remove_many::<EnabledNamespace>(&ids)
    })?;

    let indices = mark_orphaned_indices(store, ctx)?;
    let repos = mark_orphaned_repos(store, ctx)?;
    let mut outcome = WorkerOutcome::new("namespace_offboarded")
        .with_affected(removed + indices.affected + repos.affected);
    outcome.follow_up.extend(indices.follow_up);
    outcome.follow_up.extend(repos.follow_up);
    Ok(outcome)
}

/// With `auto_index_root_namespaces` set, enable eligible namespaces that
/// are not on the fleet yet. Provisioning is left to the rollout controller.
pub fn auto_index_root_namespaces(
    store: &StateStore,
    ctx: &ReconcileContext,
) -> ReconcileResult<WorkerOutcome> {
    let outcome = WorkerOutcome::new("auto_index_root_namespaces");
    if !ctx.flags.auto_index_root_namespaces || !ctx.flags.indexing_active() {
        return Ok(outcome);
    }
    let cap = ctx.settings.rollout.batch_size;
    let (enabled, more) = store.write(|w| {
        let (batch, more) = split_batch(scopes::namespaces_to_onboard(w, cap + 1)?, cap);
        for namespace in &batch {
            w.insert(EnabledNamespace::new(namespace.id, ctx.now))?;
        }
        Ok((batch.len(), more))
    })?;
    if enabled > 0 {
        info!(enabled, "root namespaces enabled");
    }
    Ok(outcome
        .with_affected(enabled)
        .then_if(more, FleetEvent::AutoIndexRootNamespaces))
}
