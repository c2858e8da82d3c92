//! shardgrid-metrics — read-only observability over the entity store.
//!
//! # Architecture
//!
//! ```text
//! MetricsAggregator
//!   ├── snapshot() → FleetSnapshot from one read transaction
//!   ├── latest()   → last snapshot taken by the loop
//!   └── run()      → periodic snapshot loop, errors logged
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain shardgrid_* gauges
//! ```

pub mod aggregator;
pub mod prometheus;

pub use aggregator::{FleetSnapshot, MetricsAggregator, TaskCount, collect_snapshot};
pub use prometheus::render_prometheus;
