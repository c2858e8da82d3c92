//! Storage-pressure eviction selection.
//!
//! When a node's reservations exceed its capacity, indices are chosen
//! greedily, largest reservation first, until the freed bytes cover the
//! deficit or `max_indices` is reached. Equal reservations keep id order.

use shardgrid_state::{Index, IndexId, IndexState};

/// Indices chosen for eviction on one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionSelection {
    pub index_ids: Vec<IndexId>,
    pub freed_bytes: i64,
}

impl EvictionSelection {
    pub fn covers(&self, deficit_bytes: i64) -> bool {
        self.freed_bytes >= deficit_bytes
    }
}

/// Select indices from `candidates` (one node's indices, in id order) whose
/// eviction frees at least `deficit_bytes`.
///
/// Indices that no longer hold a reservation or are already pending
/// eviction are skipped.
pub fn select_for_eviction(
    candidates: &[Index],
    deficit_bytes: i64,
    max_indices: usize,
) -> EvictionSelection {
    let mut selection = EvictionSelection::default();
    if deficit_bytes <= 0 || max_indices == 0 {
        return selection;
    }

    let mut eligible: Vec<&Index> = candidates
        .iter()
        .filter(|i| i.holds_reservation() && i.state != IndexState::PendingEviction)
        .collect();
    // sort_by is stable: equal reservations stay in id order.
    eligible.sort_by(|a, b| b.reserved_storage_bytes.cmp(&a.reserved_storage_bytes));

    for index in eligible {
        selection.index_ids.push(index.id);
        selection.freed_bytes += index.reserved_storage_bytes;
        if selection.covers(deficit_bytes) || selection.index_ids.len() >= max_indices {
            break;
        }
    }
    selection
}
