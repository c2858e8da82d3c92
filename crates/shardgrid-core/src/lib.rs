//! shardgrid-core — settings and small helpers shared by every ShardGrid crate.
//!
//! `FleetSettings` is parsed from `shardgrid.toml` and handed explicitly to
//! every component; nothing in the workspace reads ambient global config.

pub mod config;
pub mod time;

pub use config::{
    BusSettings, FleetSettings, HealthSettings, LimitSettings, MetricsSettings, RolloutSettings,
    SchedulingSettings, StoreSettings,
};
pub use time::epoch_secs;

/// One kibibyte.
pub const KIB: i64 = 1024;
/// One gibibyte.
pub const GIB: i64 = 1024 * 1024 * 1024;
