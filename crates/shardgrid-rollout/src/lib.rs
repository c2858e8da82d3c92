//! ShardGrid rollout — batched onboarding of namespaces onto the fleet.
//!
//! Each pass enables a bounded batch of eligible namespaces and provisions
//! an index for enabled namespaces that have none. Passes are single-flight
//! cluster-wide through the `rollout` lease, and the runner chains passes
//! while work remains, backing off exponentially when it does not.
//!
//! # Components
//!
//! - **`controller`** — One rollout pass (`execute`)
//! - **`strategy`** — Retry policy and the pass-chaining runner

pub mod controller;
pub mod error;
pub mod strategy;

pub use controller::{ROLLOUT_LEASE, RolloutChange, RolloutController, RolloutReport};
pub use error::{RolloutError, RolloutResult};
pub use strategy::{NextRun, RetryPolicy, RolloutRunner};
