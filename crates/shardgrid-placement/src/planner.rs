//! Node planning for newly provisioned indices.

use shardgrid_state::NodeId;
use tracing::debug;

use crate::convert::NodeStorage;

/// Pick the alive node with the most unclaimed storage that can take
/// `required_bytes`. Ties go to the lowest node id. `None` when no node fits.
pub fn plan_index_placement(nodes: &[NodeStorage], required_bytes: i64) -> Option<NodeId> {
    let chosen = nodes
        .iter()
        .filter(|n| n.alive && n.unclaimed_bytes() >= required_bytes)
        .max_by(|a, b| {
            a.unclaimed_bytes()
                .cmp(&b.unclaimed_bytes())
                .then_with(|| b.node_id.cmp(&a.node_id))
        })
        .map(|n| n.node_id);
    debug!(required_bytes, ?chosen, candidates = nodes.len(), "index placement planned");
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: NodeId, total: i64, reserved: i64, alive: bool) -> NodeStorage {
        NodeStorage {
            node_id: id,
            name: format!("node-{id}"),
            alive,
            total_bytes: total,
            used_bytes: 0,
            reserved_bytes: reserved,
        }
    }

    #[test]
    fn picks_most_unclaimed() {
        let nodes = vec![node(1, 100, 50, true), node(2, 100, 10, true), node(3, 100, 30, true)];
        assert_eq!(plan_index_placement(&nodes, 20), Some(2));
    }

    #[test]
    fn skips_lost_nodes() {
        let nodes = vec![node(1, 100, 50, true), node(2, 1_000, 0, false)];
        assert_eq!(plan_index_placement(&nodes, 20), Some(1));
    }

    #[test]
    fn ties_go_to_lowest_id() {
        let nodes = vec![node(4, 100, 0, true), node(2, 100, 0, true)];
        assert_eq!(plan_index_placement(&nodes, 10), Some(2));
    }

    #[test]
    fn none_when_nothing_fits() {
        let nodes = vec![node(1, 100, 90, true)];
        assert_eq!(plan_index_placement(&nodes, 20), None);
        assert_eq!(plan_index_placement(&[], 1), None);
    }
}
