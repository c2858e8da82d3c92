//! shardgrid-events — domain events and the event bus.
//!
//! Producers publish [`FleetEvent`]s; reconciliation workers subscribe by
//! [`EventKind`]. Delivery is at-least-once: a failing handler sees the event
//! again, so handlers re-read current state instead of trusting payloads.

pub mod bus;
pub mod event;

pub use bus::{BusStats, EventBus, Handler, HandlerFuture};
pub use event::{EventKind, FleetEvent};
