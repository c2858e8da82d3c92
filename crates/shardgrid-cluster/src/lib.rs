//! shardgrid-cluster — search node membership.
//!
//! Node agents register with the control plane and heartbeat periodically.
//! A node whose heartbeat is older than the lost-node threshold is marked
//! `lost`; the lost-node reconciliation worker then tears down everything
//! placed on it. A heartbeat from a lost node that has not been torn down
//! yet brings it back.

pub mod membership;

pub use membership::{Member, MemberStatus, MembershipManager};
