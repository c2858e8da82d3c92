//! shardgrid.toml configuration parser.
//!
//! Every section and every field has a default, so an empty file (or no
//! file at all) yields a working single-host configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::GIB;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSettings {
    pub store: StoreSettings,
    pub limits: LimitSettings,
    pub scheduling: SchedulingSettings,
    pub rollout: RolloutSettings,
    pub metrics: MetricsSettings,
    pub health: HealthSettings,
    pub bus: BusSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Directory holding `shardgrid.redb`.
    pub data_dir: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/shardgrid"),
        }
    }
}

/// Batch caps and ceilings for the reconciliation workers and dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    /// Cluster-wide ceiling of pending + processing tasks.
    pub task_ceiling: u64,
    /// Per-node ceiling of pending + processing tasks.
    pub per_node_task_ceiling: u64,
    pub dispatch_batch: usize,
    pub orphan_batch: usize,
    pub pending_eviction_batch: usize,
    pub eviction_batch: usize,
    pub ready_batch: usize,
    pub storage_refresh_batch: usize,
    pub delete_cascade_batch: usize,
    pub purge_batch: usize,
    /// Max repository rows inserted per initial-indexing cycle.
    pub repository_insert_limit: usize,
    /// Max indices marked per node by storage-pressure rebalancing.
    pub max_indices_to_evict: usize,
    /// Max pending indices woken per node by the initial-indexing check.
    pub initial_indexing_per_node: usize,
    /// Retries granted to a repository when it is created.
    pub repository_retries: u32,
    /// Finished tasks older than this are purged.
    pub task_retention_secs: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            task_ceiling: 5_000,
            per_node_task_ceiling: 1_000,
            dispatch_batch: 1_000,
            orphan_batch: 1_000,
            pending_eviction_batch: 1_000,
            eviction_batch: 500,
            ready_batch: 1_000,
            storage_refresh_batch: 1_000,
            delete_cascade_batch: 1_000,
            purge_batch: 10_000,
            repository_insert_limit: 10_000,
            max_indices_to_evict: 100,
            initial_indexing_per_node: 10,
            repository_retries: 3,
            task_retention_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingSettings {
    /// Seconds between scheduling passes.
    pub interval_secs: u64,
    /// A node unseen for longer than this is lost. `None` disables marking.
    pub lost_node_threshold_secs: Option<u64>,
    pub lost_nodes_check_period_secs: u64,
    pub watermark_check_period_secs: u64,
}

impl Default for SchedulingSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            lost_node_threshold_secs: Some(12 * 60 * 60),
            lost_nodes_check_period_secs: 10 * 60,
            watermark_check_period_secs: 10 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutSettings {
    pub batch_size: usize,
    /// Extra candidates scanned beyond `batch_size` to detect remaining work.
    pub buffer: usize,
    pub initial_backoff_secs: u64,
    pub max_retries: u32,
    pub lease_ttl_secs: u64,
    /// Namespaces whose provisioning failed are skipped for this long.
    pub failed_retry_secs: u64,
    /// Smallest reservation handed to a newly provisioned index.
    pub min_reservation_bytes: i64,
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self {
            batch_size: 2_000,
            buffer: 500,
            initial_backoff_secs: 30,
            max_retries: 5,
            lease_ttl_secs: 10 * 60,
            failed_retry_secs: 24 * 60 * 60,
            min_reservation_bytes: GIB,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub interval_secs: u64,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

/// Store health gate used for worker backpressure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub store_latency_threshold_ms: u64,
    pub probe_interval_secs: u64,
    /// How long a deferred event waits before it is re-published.
    pub defer_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            store_latency_threshold_ms: 500,
            probe_interval_secs: 10,
            defer_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    pub max_deliveries: u32,
    pub redelivery_delay_ms: u64,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            max_deliveries: 5,
            redelivery_delay_ms: 1_000,
        }
    }
}

impl FleetSettings {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: FleetSettings = toml::from_str(&content)?;
        Ok(settings)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Path of the redb database file.
    pub fn db_path(&self) -> PathBuf {
        self.store.data_dir.join("shardgrid.redb")
    }

    pub fn lost_node_threshold(&self) -> Option<Duration> {
        self.scheduling
            .lost_node_threshold_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}
