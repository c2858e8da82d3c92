//! Node storage views derived from the entity store.
//!
//! Reservations are summed from indices that still hold one, so evicted
//! indices free their node's storage as soon as they are marked.

use shardgrid_state::{Node, NodeId, NodeLiveness, StateResult, TableReader, scopes};

/// Capacity accounting for a single node.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeStorage {
    pub node_id: NodeId,
    pub name: String,
    pub alive: bool,
    pub total_bytes: i64,
    pub used_bytes: i64,
    pub reserved_bytes: i64,
}

impl NodeStorage {
    /// Capacity minus committed reservations. Negative means over-committed.
    pub fn unclaimed_bytes(&self) -> i64 {
        self.total_bytes - self.reserved_bytes
    }
}

/// Build a [`NodeStorage`] from a node and its summed reservations.
pub fn node_storage(node: &Node, reserved_bytes: i64) -> NodeStorage {
    NodeStorage {
        node_id: node.id,
        name: node.name.clone(),
        alive: node.liveness == NodeLiveness::Alive,
        total_bytes: node.total_bytes,
        used_bytes: node.used_bytes,
        reserved_bytes,
    }
}

/// Storage view of every node, in node id order.
pub fn fleet_storage<R: TableReader>(r: &R) -> StateResult<Vec<NodeStorage>> {
    let reserved = scopes::node_reserved_bytes(r)?;
    Ok(r.all::<Node>()?
        .iter()
        .map(|node| node_storage(node, reserved.get(&node.id).copied().unwrap_or(0)))
        .collect())
}
