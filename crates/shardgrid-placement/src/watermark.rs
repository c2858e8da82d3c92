//! Reservation sizing.
//!
//! An index aims to keep `used / reserved` at the ideal ratio. Growth is
//! bounded by what the node has left; shrinking only happens for ready
//! indices that are overprovisioned.

pub use shardgrid_state::ideal_reservation;
use shardgrid_state::{DEFAULT_USED_STORAGE_BYTES, Index, IndexState, WatermarkLevel};

/// Reservation for a namespace being provisioned, never below `min_bytes`.
pub fn required_reservation(namespace_storage_bytes: i64, min_bytes: i64) -> i64 {
    ideal_reservation(namespace_storage_bytes).max(min_bytes)
}

/// The index's reservation after observing `used_bytes`.
///
/// `node_unclaimed` is the hosting node's unclaimed storage; only its
/// positive part is available for growth.
pub fn refreshed_reservation(index: &Index, used_bytes: i64, node_unclaimed: i64) -> i64 {
    let used = if used_bytes <= 0 {
        DEFAULT_USED_STORAGE_BYTES
    } else {
        used_bytes
    };
    let ideal = ideal_reservation(used);
    let current = index.reserved_storage_bytes;

    if ideal > current {
        let growth = (ideal - current).min(node_unclaimed.max(0));
        return current + growth;
    }

    let overprovisioned =
        WatermarkLevel::for_usage(used, current) == WatermarkLevel::Overprovisioned;
    if index.state == IndexState::Ready && overprovisioned {
        return ideal;
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardgrid_state::EnabledNamespace;

    fn index_with(reserved: i64, state: IndexState) -> Index {
        let enabled = EnabledNamespace::new(1, 0);
        let mut index = Index::new(&enabled, 1, 1, reserved, 0);
        index.state = state;
        index
    }

    #[test]
    fn ideal_puts_usage_at_forty_percent() {
        assert_eq!(ideal_reservation(40), 100);
        assert_eq!(ideal_reservation(0), 0);
        assert_eq!(required_reservation(40, 500), 500);
        assert_eq!(required_reservation(4_000, 500), 10_000);
    }

    #[test]
    fn grows_within_unclaimed() {
        let index = index_with(100, IndexState::Initializing);
        assert_eq!(refreshed_reservation(&index, 80, 1_000), 200);
        assert_eq!(refreshed_reservation(&index, 80, 30), 130);
        assert_eq!(refreshed_reservation(&index, 80, -50), 100);
    }

    #[test]
    fn shrinks_only_when_ready() {
        let ready = index_with(1_000, IndexState::Ready);
        assert_eq!(refreshed_reservation(&ready, 100, 0), 250);

        let initializing = index_with(1_000, IndexState::Initializing);
        assert_eq!(refreshed_reservation(&initializing, 100, 0), 1_000);
    }

    #[test]
    fn empty_index_counts_default_size() {
        let index = index_with(0, IndexState::Pending);
        assert_eq!(
            refreshed_reservation(&index, 0, 1_000_000),
            ideal_reservation(DEFAULT_USED_STORAGE_BYTES)
        );
    }
}
