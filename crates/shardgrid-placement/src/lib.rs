//! ShardGrid placement — reservation sizing, node planning, eviction selection.
//!
//! This crate makes storage decisions only. It never writes to the store:
//! callers (rollout controller, reconciliation workers) apply the plans it
//! returns inside their own transactions.
//!
//! # Components
//!
//! - **`watermark`** — Reservation sizing from observed usage
//! - **`planner`** — Pick the node that hosts a new index
//! - **`pressure`** — Greedy eviction selection for over-committed nodes
//! - **`convert`** — Node storage views built from state store types

pub mod convert;
pub mod planner;
pub mod pressure;
pub mod watermark;

pub use convert::{NodeStorage, fleet_storage, node_storage};
pub use planner::plan_index_placement;
pub use pressure::{EvictionSelection, select_for_eviction};
pub use watermark::{ideal_reservation, refreshed_reservation, required_reservation};
