//! shardd — the ShardGrid daemon.
//!
//! Assembles every ShardGrid subsystem around one state store:
//! - Event bus and reconciliation workers
//! - Store-health gate
//! - Scheduling checks
//! - Rollout runner
//! - Metrics aggregator
//!
//! The operator commands in [`admin`] work directly on the store, so they
//! can run from a second process next to a live daemon.

pub mod admin;
pub mod control_plane;

pub use control_plane::ControlPlane;
