//! Per-invocation worker context.

use std::sync::Arc;

use shardgrid_core::{FleetSettings, LimitSettings, epoch_secs};
use shardgrid_state::{FleetFlags, StateResult, StateStore};

/// Everything a worker may consult besides the store: settings, the
/// operator flags as read at the start of the invocation, and the clock.
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    pub settings: Arc<FleetSettings>,
    pub flags: FleetFlags,
    /// Unix timestamp (seconds) of this invocation.
    pub now: u64,
}

impl ReconcileContext {
    pub fn new(settings: Arc<FleetSettings>, flags: FleetFlags, now: u64) -> Self {
        Self {
            settings,
            flags,
            now,
        }
    }

    /// Read the current flags from the store and stamp the wall clock.
    pub fn load(store: &StateStore, settings: Arc<FleetSettings>) -> StateResult<Self> {
        Ok(Self::new(settings, store.flags()?, epoch_secs()))
    }

    pub fn limits(&self) -> &LimitSettings {
        &self.settings.limits
    }

    /// Lost-node marking needs active indexing and a configured threshold.
    pub fn marking_lost_enabled(&self) -> bool {
        self.flags.indexing_active() && self.settings.lost_node_threshold().is_some()
    }
}
