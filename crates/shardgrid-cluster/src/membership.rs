//! Membership manager — tracks search node state.
//!
//! Persists nodes to the `StateStore` and derives each member's status
//! from its last heartbeat.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use shardgrid_state::*;

/// Status of a node as seen by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Ready,
    /// Heartbeat expired but the node is not marked lost yet.
    Unresponsive,
    Lost,
}

/// View of a search node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub node_id: NodeId,
    pub name: String,
    pub status: MemberStatus,
    pub total_bytes: i64,
    pub used_bytes: i64,
    pub last_seen_at: u64,
}

pub struct MembershipManager {
    state: StateStore,
    /// Heartbeat age after which a node is lost.
    lost_threshold: Duration,
}

impl MembershipManager {
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            lost_threshold: Duration::from_secs(12 * 60 * 60),
        }
    }

    pub fn with_lost_threshold(mut self, threshold: Duration) -> Self {
        self.lost_threshold = threshold;
        self
    }

    /// Register a node, or refresh it if one with the same name exists.
    pub fn join(&self, name: &str, total_bytes: i64, now: u64) -> StateResult<NodeId> {
        let node_id = self.state.write(|w| {
            let existing = w.scan(|n: &Node| n.name == name, Some(1))?;
            match existing.into_iter().next() {
                Some(mut node) => {
                    node.total_bytes = total_bytes;
                    node.last_seen_at = now;
                    node.liveness = NodeLiveness::Alive;
                    w.put(&node)?;
                    Ok(node.id)
                }
                None => Ok(w.insert(Node::new(name, total_bytes, now))?.id),
            }
        })?;
        info!(node_id, %name, total_bytes, "node joined fleet");
        Ok(node_id)
    }

    /// Record a heartbeat. Returns false for unknown nodes.
    pub fn heartbeat(&self, node_id: NodeId, used_bytes: i64, now: u64) -> StateResult<bool> {
        let recovered = self.state.write(|w| {
            let Some(mut node) = w.get::<Node>(node_id)? else {
                return Ok(None);
            };
            let recovered = node.liveness == NodeLiveness::Lost;
            node.used_bytes = used_bytes;
            node.last_seen_at = now;
            node.liveness = NodeLiveness::Alive;
            w.put(&node)?;
            Ok(Some(recovered))
        })?;

        match recovered {
            Some(true) => {
                info!(node_id, "lost node recovered");
                Ok(true)
            }
            Some(false) => {
                debug!(node_id, used_bytes, "heartbeat received");
                Ok(true)
            }
            None => {
                warn!(node_id, "heartbeat from unknown node");
                Ok(false)
            }
        }
    }

    /// Take a node out of service. It is marked lost with an expired
    /// heartbeat so the lost-node worker cleans it up.
    pub fn leave(&self, node_id: NodeId) -> StateResult<bool> {
        let updated = self.state.bulk_update(&[node_id], |n: &mut Node| {
            n.liveness = NodeLiveness::Lost;
            n.last_seen_at = 0;
        })?;
        if updated > 0 {
            info!(node_id, "node left fleet");
        }
        Ok(updated > 0)
    }

    fn status_of(&self, node: &Node, now: u64) -> MemberStatus {
        if node.liveness == NodeLiveness::Lost {
            MemberStatus::Lost
        } else if node.heartbeat_expired(now, self.lost_threshold.as_secs()) {
            MemberStatus::Unresponsive
        } else {
            MemberStatus::Ready
        }
    }

    fn to_member(&self, node: Node, now: u64) -> Member {
        Member {
            status: self.status_of(&node, now),
            node_id: node.id,
            name: node.name,
            total_bytes: node.total_bytes,
            used_bytes: node.used_bytes,
            last_seen_at: node.last_seen_at,
        }
    }

    pub fn list_members(&self, now: u64) -> StateResult<Vec<Member>> {
        Ok(self
            .state
            .list::<Node>()?
            .into_iter()
            .map(|n| self.to_member(n, now))
            .collect())
    }

    pub fn get_member(&self, node_id: NodeId, now: u64) -> StateResult<Option<Member>> {
        Ok(self
            .state
            .find::<Node>(node_id)?
            .map(|n| self.to_member(n, now)))
    }

    /// Mark every node with an expired heartbeat as lost.
    ///
    /// Returns the ids of all lost nodes, including ones marked earlier
    /// that have not been cleaned up yet.
    pub fn mark_lost_nodes(&self, now: u64) -> StateResult<Vec<NodeId>> {
        let threshold = self.lost_threshold.as_secs();
        let lost = self
            .state
            .read(|r| scopes::lost_nodes(r, now, threshold))?;
        let newly_lost: Vec<NodeId> = lost
            .iter()
            .filter(|n| n.liveness == NodeLiveness::Alive)
            .map(|n| n.id)
            .collect();
        if !newly_lost.is_empty() {
            self.state.bulk_update(&newly_lost, |n: &mut Node| {
                n.liveness = NodeLiveness::Lost;
            })?;
            warn!(count = newly_lost.len(), nodes = ?newly_lost, "nodes marked lost");
        }
        Ok(lost.into_iter().map(|n| n.id).collect())
    }

    pub fn ready_count(&self, now: u64) -> StateResult<usize> {
        let members = self.list_members(now)?;
        Ok(members.iter().filter(|m| m.status == MemberStatus::Ready).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    fn manager(state: &StateStore) -> MembershipManager {
        MembershipManager::new(state.clone()).with_lost_threshold(Duration::from_secs(60))
    }

    #[test]
    fn join_creates_node() {
        let mgr = manager(&test_state());
        let node_id = mgr.join("node-1", 1_000, 100).unwrap();
        let member = mgr.get_member(node_id, 100).unwrap().unwrap();
        assert_eq!(member.name, "node-1");
        assert_eq!(member.total_bytes, 1_000);
        assert_eq!(member.status, MemberStatus::Ready);
    }

    #[test]
    fn rejoin_reuses_node() {
        let mgr = manager(&test_state());
        let first = mgr.join("node-1", 1_000, 100).unwrap();
        let second = mgr.join("node-1", 2_000, 200).unwrap();
        assert_eq!(first, second);
        assert_eq!(mgr.list_members(200).unwrap().len(), 1);
        assert_eq!(mgr.get_member(first, 200).unwrap().unwrap().total_bytes, 2_000);
    }

    #[test]
    fn heartbeat_updates_usage() {
        let mgr = manager(&test_state());
        let node_id = mgr.join("node-1", 1_000, 100).unwrap();
        assert!(mgr.heartbeat(node_id, 250, 150).unwrap());
        let member = mgr.get_member(node_id, 150).unwrap().unwrap();
        assert_eq!(member.used_bytes, 250);
        assert_eq!(member.last_seen_at, 150);
    }

    #[test]
    fn heartbeat_unknown_node_returns_false() {
        let mgr = manager(&test_state());
        assert!(!mgr.heartbeat(42, 0, 0).unwrap());
    }

    #[test]
    fn expired_heartbeat_marks_lost() {
        let mgr = manager(&test_state());
        let stale = mgr.join("node-1", 1_000, 100).unwrap();
        let fresh = mgr.join("node-2", 1_000, 150).unwrap();

        assert_eq!(
            mgr.get_member(stale, 200).unwrap().unwrap().status,
            MemberStatus::Unresponsive
        );
        assert_eq!(mgr.mark_lost_nodes(200).unwrap(), vec![stale]);
        assert_eq!(
            mgr.get_member(stale, 200).unwrap().unwrap().status,
            MemberStatus::Lost
        );
        assert_eq!(mgr.ready_count(200).unwrap(), 1);
        assert_eq!(
            mgr.get_member(fresh, 200).unwrap().unwrap().status,
            MemberStatus::Ready
        );
        // Still reported until cleaned up.
        assert_eq!(mgr.mark_lost_nodes(201).unwrap(), vec![stale]);
    }

    #[test]
    fn heartbeat_recovers_lost_node() {
        let mgr = manager(&test_state());
        let node_id = mgr.join("node-1", 1_000, 100).unwrap();
        mgr.mark_lost_nodes(500).unwrap();
        assert!(mgr.heartbeat(node_id, 0, 501).unwrap());
        assert_eq!(
            mgr.get_member(node_id, 501).unwrap().unwrap().status,
            MemberStatus::Ready
        );
    }

    #[test]
    fn leave_marks_node_lost() {
        let mgr = manager(&test_state());
        let node_id = mgr.join("node-1", 1_000, 100).unwrap();
        assert!(mgr.leave(node_id).unwrap());
        assert_eq!(mgr.mark_lost_nodes(100).unwrap(), vec![node_id]);
        assert!(!mgr.leave(99).unwrap());
    }
}
