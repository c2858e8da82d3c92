//! Domain types for the ShardGrid entity store.
//!
//! These types represent the persisted state of the fleet: nodes, replicas,
//! indices, repositories, tasks and enabled namespaces, plus the catalogue of
//! namespaces and projects mirrored from the account subsystem. All types are
//! serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

use crate::tables::{self, Record};

pub type NodeId = u64;
pub type ReplicaId = u64;
pub type IndexId = u64;
pub type RepositoryId = u64;
pub type TaskId = u64;
pub type EnabledNamespaceId = u64;
pub type NamespaceId = u64;
pub type ProjectId = u64;

/// Size assumed for an index whose repositories report no size yet.
pub const DEFAULT_USED_STORAGE_BYTES: i64 = 1024;

macro_rules! impl_record {
    ($ty:ty, $table:expr, $kind:literal) => {
        impl Record for $ty {
            const TABLE: redb::TableDefinition<'static, u64, &'static [u8]> = $table;
            const KIND: &'static str = $kind;

            fn id(&self) -> u64 {
                self.id
            }

            fn set_id(&mut self, id: u64) {
                self.id = id;
            }
        }
    };
}

// ── Node ───────────────────────────────────────────────────────────

/// A search-serving host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    /// Storage capacity in bytes.
    pub total_bytes: i64,
    /// Bytes in use on disk as last reported by the node agent.
    pub used_bytes: i64,
    /// Unix timestamp (seconds) of the last heartbeat.
    pub last_seen_at: u64,
    pub liveness: NodeLiveness,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeLiveness {
    Alive,
    Lost,
}

impl Node {
    pub fn new(name: impl Into<String>, total_bytes: i64, now: u64) -> Self {
        Self {
            id: 0,
            name: name.into(),
            total_bytes,
            used_bytes: 0,
            last_seen_at: now,
            liveness: NodeLiveness::Alive,
            created_at: now,
        }
    }

    /// True when the last heartbeat is strictly older than `threshold_secs`.
    pub fn heartbeat_expired(&self, now: u64, threshold_secs: u64) -> bool {
        now.saturating_sub(self.last_seen_at) > threshold_secs
    }
}

impl_record!(Node, tables::NODES, "node");

// ── Replica ────────────────────────────────────────────────────────

/// A placement group of indices for one enabled namespace on one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Replica {
    pub id: ReplicaId,
    pub enabled_namespace_id: EnabledNamespaceId,
    pub namespace_id: NamespaceId,
    pub node_id: NodeId,
    pub created_at: u64,
}

impl Replica {
    pub fn new(enabled: &EnabledNamespace, node_id: NodeId, now: u64) -> Self {
        Self {
            id: 0,
            enabled_namespace_id: enabled.id,
            namespace_id: enabled.root_namespace_id,
            node_id,
            created_at: now,
        }
    }
}

impl_record!(Replica, tables::REPLICAS, "replica");

// ── Index ──────────────────────────────────────────────────────────

/// The searchable shard of one namespace on one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Index {
    pub id: IndexId,
    pub namespace_id: NamespaceId,
    pub enabled_namespace_id: Option<EnabledNamespaceId>,
    pub node_id: NodeId,
    pub replica_id: Option<ReplicaId>,
    pub reserved_storage_bytes: i64,
    pub used_storage_bytes: i64,
    pub used_storage_bytes_updated_at: u64,
    /// Unix timestamp (seconds) of the last completed indexing task.
    pub last_indexed_at: u64,
    /// Set when a repository finishes indexing, cleared by the storage refresh.
    #[serde(default)]
    pub used_storage_stale: bool,
    pub watermark_level: WatermarkLevel,
    pub state: IndexState,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    Pending,
    Initializing,
    Ready,
    Orphaned,
    PendingEviction,
    Evicted,
    MarkedToDelete,
}

impl IndexState {
    pub const ALL: [IndexState; 7] = [
        IndexState::Pending,
        IndexState::Initializing,
        IndexState::Ready,
        IndexState::Orphaned,
        IndexState::PendingEviction,
        IndexState::Evicted,
        IndexState::MarkedToDelete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexState::Pending => "pending",
            IndexState::Initializing => "initializing",
            IndexState::Ready => "ready",
            IndexState::Orphaned => "orphaned",
            IndexState::PendingEviction => "pending_eviction",
            IndexState::Evicted => "evicted",
            IndexState::MarkedToDelete => "marked_to_delete",
        }
    }
}

impl Index {
    pub fn new(
        enabled: &EnabledNamespace,
        node_id: NodeId,
        replica_id: ReplicaId,
        reserved_storage_bytes: i64,
        now: u64,
    ) -> Self {
        Self {
            id: 0,
            namespace_id: enabled.root_namespace_id,
            enabled_namespace_id: Some(enabled.id),
            node_id,
            replica_id: Some(replica_id),
            reserved_storage_bytes,
            used_storage_bytes: 0,
            used_storage_bytes_updated_at: 0,
            last_indexed_at: 0,
            used_storage_stale: false,
            watermark_level: WatermarkLevel::Healthy,
            state: IndexState::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Evicted and marked-to-delete indices no longer count against their node.
    pub fn holds_reservation(&self) -> bool {
        !matches!(self.state, IndexState::Evicted | IndexState::MarkedToDelete)
    }

    /// Indices an operator would consider serving or about to serve.
    pub fn is_live(&self) -> bool {
        matches!(
            self.state,
            IndexState::Pending | IndexState::Initializing | IndexState::Ready
        )
    }

    pub fn appropriate_watermark_level(&self) -> WatermarkLevel {
        WatermarkLevel::for_usage(self.used_storage_bytes, self.reserved_storage_bytes)
    }

    /// Reservation above what its usage needs at the ideal ratio.
    pub fn is_overprovisioned(&self) -> bool {
        let used = self.used_storage_bytes.max(DEFAULT_USED_STORAGE_BYTES);
        self.reserved_storage_bytes > ideal_reservation(used)
    }
}

impl_record!(Index, tables::INDICES, "index");

// ── Watermark ──────────────────────────────────────────────────────

/// Usage ratio below which an index is overprovisioned.
pub const STORAGE_IDEAL_PERCENT_USED: f64 = 0.4;
pub const STORAGE_LOW_WATERMARK: f64 = 0.6;
pub const STORAGE_HIGH_WATERMARK: f64 = 0.7;
pub const STORAGE_CRITICAL_WATERMARK: f64 = 0.85;

/// Index fill level relative to its reservation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkLevel {
    Overprovisioned,
    Healthy,
    LowWatermarkExceeded,
    HighWatermarkExceeded,
    CriticalWatermarkExceeded,
}

impl WatermarkLevel {
    /// Classify `used / reserved`. A zero reservation with any usage is critical.
    pub fn for_usage(used: i64, reserved: i64) -> Self {
        let ratio = storage_ratio(used, reserved);
        if ratio < STORAGE_IDEAL_PERCENT_USED {
            WatermarkLevel::Overprovisioned
        } else if ratio < STORAGE_LOW_WATERMARK {
            WatermarkLevel::Healthy
        } else if ratio < STORAGE_HIGH_WATERMARK {
            WatermarkLevel::LowWatermarkExceeded
        } else if ratio < STORAGE_CRITICAL_WATERMARK {
            WatermarkLevel::HighWatermarkExceeded
        } else {
            WatermarkLevel::CriticalWatermarkExceeded
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WatermarkLevel::Overprovisioned => "overprovisioned",
            WatermarkLevel::Healthy => "healthy",
            WatermarkLevel::LowWatermarkExceeded => "low_watermark_exceeded",
            WatermarkLevel::HighWatermarkExceeded => "high_watermark_exceeded",
            WatermarkLevel::CriticalWatermarkExceeded => "critical_watermark_exceeded",
        }
    }
}

/// Reservation that puts `used_bytes` exactly at the ideal ratio.
pub fn ideal_reservation(used_bytes: i64) -> i64 {
    (used_bytes.max(0) as f64 / STORAGE_IDEAL_PERCENT_USED).ceil() as i64
}

fn storage_ratio(used: i64, reserved: i64) -> f64 {
    if reserved <= 0 {
        return if used > 0 { f64::INFINITY } else { 0.0 };
    }
    used as f64 / reserved as f64
}

// ── Repository ─────────────────────────────────────────────────────

/// One project's code assigned to an index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Repository {
    pub id: RepositoryId,
    pub project_id: ProjectId,
    pub index_id: IndexId,
    pub namespace_id: NamespaceId,
    pub state: RepositoryState,
    pub retries_left: u32,
    pub size_bytes: i64,
    pub indexed_at: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryState {
    Pending,
    InProgress,
    Ready,
    Orphaned,
    PendingDeletion,
    Deleted,
    Failed,
}

impl RepositoryState {
    pub const ALL: [RepositoryState; 7] = [
        RepositoryState::Pending,
        RepositoryState::InProgress,
        RepositoryState::Ready,
        RepositoryState::Orphaned,
        RepositoryState::PendingDeletion,
        RepositoryState::Deleted,
        RepositoryState::Failed,
    ];

    /// Ready, failed and deleted repositories no longer block index readiness.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            RepositoryState::Ready | RepositoryState::Failed | RepositoryState::Deleted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RepositoryState::Pending => "pending",
            RepositoryState::InProgress => "in_progress",
            RepositoryState::Ready => "ready",
            RepositoryState::Orphaned => "orphaned",
            RepositoryState::PendingDeletion => "pending_deletion",
            RepositoryState::Deleted => "deleted",
            RepositoryState::Failed => "failed",
        }
    }
}

impl Repository {
    pub fn new(project: &Project, index: &Index, retries_left: u32, now: u64) -> Self {
        Self {
            id: 0,
            project_id: project.id,
            index_id: index.id,
            namespace_id: index.namespace_id,
            state: RepositoryState::Pending,
            retries_left,
            size_bytes: 0,
            indexed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl_record!(Repository, tables::REPOSITORIES, "repository");

// ── Task ───────────────────────────────────────────────────────────

/// A dispatched unit of indexing or deletion work for one repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub state: TaskState,
    pub repository_id: RepositoryId,
    pub project_id: ProjectId,
    pub index_id: IndexId,
    pub node_id: NodeId,
    /// Copied from the repository when the task is created.
    pub retries_left: u32,
    pub perform_at: u64,
    /// Set once a worker has applied the task's outcome to its repository.
    pub reconciled_at: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    IndexRepo,
    DeleteRepo,
}

impl TaskType {
    pub const ALL: [TaskType; 2] = [TaskType::IndexRepo, TaskType::DeleteRepo];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::IndexRepo => "index_repo",
            TaskType::DeleteRepo => "delete_repo",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Processing,
    Done,
    Failed,
}

impl TaskState {
    pub const ALL: [TaskState; 4] = [
        TaskState::Pending,
        TaskState::Processing,
        TaskState::Done,
        TaskState::Failed,
    ];

    pub fn is_outstanding(&self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Processing => "processing",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
        }
    }
}

impl Task {
    pub fn new(repo: &Repository, node_id: NodeId, task_type: TaskType, now: u64) -> Self {
        Self {
            id: 0,
            task_type,
            state: TaskState::Pending,
            repository_id: repo.id,
            project_id: repo.project_id,
            index_id: repo.index_id,
            node_id,
            retries_left: repo.retries_left,
            perform_at: now,
            reconciled_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl_record!(Task, tables::TASKS, "task");

// ── EnabledNamespace ───────────────────────────────────────────────

/// A root namespace opted in to the fleet. Unique by `root_namespace_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnabledNamespace {
    pub id: EnabledNamespaceId,
    pub root_namespace_id: NamespaceId,
    /// Set when provisioning found no node able to host the namespace.
    pub last_rollout_failed_at: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl EnabledNamespace {
    pub fn new(root_namespace_id: NamespaceId, now: u64) -> Self {
        Self {
            id: 0,
            root_namespace_id,
            last_rollout_failed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True while a failed rollout is still inside its retry window.
    pub fn rollout_recently_failed(&self, now: u64, retry_secs: u64) -> bool {
        self.last_rollout_failed_at
            .is_some_and(|at| now.saturating_sub(at) < retry_secs)
    }
}

impl_record!(EnabledNamespace, tables::ENABLED_NAMESPACES, "enabled_namespace");

// ── Catalogue ──────────────────────────────────────────────────────

/// A root namespace as known to the account subsystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Namespace {
    pub id: NamespaceId,
    pub name: String,
    /// Whether the licensing gate allows this namespace onto the fleet.
    pub eligible: bool,
    /// Total repository storage of the namespace.
    pub storage_bytes: i64,
    pub created_at: u64,
}

impl Namespace {
    pub fn new(id: NamespaceId, name: impl Into<String>, storage_bytes: i64, now: u64) -> Self {
        Self {
            id,
            name: name.into(),
            eligible: true,
            storage_bytes,
            created_at: now,
        }
    }
}

impl_record!(Namespace, tables::NAMESPACES, "namespace");

/// A project under a root namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: ProjectId,
    pub namespace_id: NamespaceId,
    pub size_bytes: i64,
    pub created_at: u64,
}

impl Project {
    pub fn new(id: ProjectId, namespace_id: NamespaceId, size_bytes: i64, now: u64) -> Self {
        Self {
            id,
            namespace_id,
            size_bytes,
            created_at: now,
        }
    }
}

impl_record!(Project, tables::PROJECTS, "project");

// ── Auxiliary ──────────────────────────────────────────────────────

/// Operator flags shared by every control-plane host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FleetFlags {
    pub indexing_paused: bool,
    pub indexing_enabled: bool,
    pub auto_index_root_namespaces: bool,
}

impl Default for FleetFlags {
    fn default() -> Self {
        Self {
            indexing_paused: false,
            indexing_enabled: true,
            auto_index_root_namespaces: false,
        }
    }
}

impl FleetFlags {
    /// Dispatch and lost-node marking only run while this holds.
    pub fn indexing_active(&self) -> bool {
        self.indexing_enabled && !self.indexing_paused
    }
}

/// A named mutual-exclusion lease with a time-to-live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lease {
    pub name: String,
    pub holder: String,
    pub expires_at: u64,
}
