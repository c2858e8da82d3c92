//! shardgrid-reconcile — the reconciliation workers.
//!
//! Each worker owns one state transition. It reads a bounded batch through a
//! named scope, applies the transition in one transaction, and asks for the
//! same event again when the batch was truncated, so large backlogs drain
//! over several short cycles.
//!
//! # Architecture
//!
//! ```text
//!  SchedulingService ──checks──▶ EventBus ──▶ ReconcileService ──▶ workers::*
//!        ▲                          ▲              │                  │
//!        │ interval                 └── follow-up ─┘                  ▼
//!        │                                                      StateStore
//!  StoreHealth ── probe latency ──▶ defers events while degraded
//! ```
//!
//! Workers are plain functions over `(&StateStore, &ReconcileContext)` and
//! return a [`WorkerOutcome`]; they never publish themselves. The service
//! turns outcomes into bus traffic.

pub mod context;
pub mod error;
pub mod health;
pub mod outcome;
pub mod scheduling;
pub mod service;
pub mod workers;

pub use context::ReconcileContext;
pub use error::{ReconcileError, ReconcileResult};
pub use health::StoreHealth;
pub use outcome::WorkerOutcome;
pub use scheduling::{CheckOutcome, ScheduledCheck, SchedulingService};
pub use service::ReconcileService;
