//! The domain event catalogue.
//!
//! Most events carry no payload and only wake the owning worker, which then
//! finds its work through a query scope.

use std::fmt;

use serde::{Deserialize, Serialize};
use shardgrid_state::{IndexId, NamespaceId, NodeId, ProjectId, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    /// A node's heartbeat expired.
    LostNode { node_id: NodeId },
    OrphanedIndex,
    IndexMarkPendingEviction,
    IndexToEvict,
    NodeWithNegativeUnclaimedStorage { node_ids: Vec<NodeId> },
    UpdateIndexUsedStorageBytes,
    ForceUpdateOverprovisionedIndex,
    /// A pending index needs its repository rows.
    InitialIndexing { index_id: IndexId },
    MarkIndicesReady,
    IndexMarkedToDelete,
    OrphanedRepo,
    RepoToIndex,
    RepoToDelete,
    /// Reported by a node agent.
    TaskDone { task_id: TaskId, size_bytes: i64 },
    /// Reported by a node agent.
    TaskFailed { task_id: TaskId },
    ProjectCreated { project_id: ProjectId },
    ProjectDeleted { project_id: ProjectId },
    ProjectTransferred {
        project_id: ProjectId,
        old_namespace_id: NamespaceId,
    },
    /// An `EnabledNamespace` was removed.
    NamespaceOffboarded { root_namespace_id: NamespaceId },
    OffboardIneligibleNamespaces,
    AutoIndexRootNamespaces,
    Purge,
}

/// Payload-free discriminant of [`FleetEvent`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LostNode,
    OrphanedIndex,
    IndexMarkPendingEviction,
    IndexToEvict,
    NodeWithNegativeUnclaimedStorage,
    UpdateIndexUsedStorageBytes,
    ForceUpdateOverprovisionedIndex,
    InitialIndexing,
    MarkIndicesReady,
    IndexMarkedToDelete,
    OrphanedRepo,
    RepoToIndex,
    RepoToDelete,
    TaskDone,
    TaskFailed,
    ProjectCreated,
    ProjectDeleted,
    ProjectTransferred,
    NamespaceOffboarded,
    OffboardIneligibleNamespaces,
    AutoIndexRootNamespaces,
    Purge,
}

impl FleetEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            FleetEvent::LostNode { .. } => EventKind::LostNode,
            FleetEvent::OrphanedIndex => EventKind::OrphanedIndex,
            FleetEvent::IndexMarkPendingEviction => EventKind::IndexMarkPendingEviction,
            FleetEvent::IndexToEvict => EventKind::IndexToEvict,
            FleetEvent::NodeWithNegativeUnclaimedStorage { .. } => {
                EventKind::NodeWithNegativeUnclaimedStorage
            }
            FleetEvent::UpdateIndexUsedStorageBytes => EventKind::UpdateIndexUsedStorageBytes,
            FleetEvent::ForceUpdateOverprovisionedIndex => {
                EventKind::ForceUpdateOverprovisionedIndex
            }
            FleetEvent::InitialIndexing { .. } => EventKind::InitialIndexing,
            FleetEvent::MarkIndicesReady => EventKind::MarkIndicesReady,
            FleetEvent::IndexMarkedToDelete => EventKind::IndexMarkedToDelete,
            FleetEvent::OrphanedRepo => EventKind::OrphanedRepo,
            FleetEvent::RepoToIndex => EventKind::RepoToIndex,
            FleetEvent::RepoToDelete => EventKind::RepoToDelete,
            FleetEvent::TaskDone { .. } => EventKind::TaskDone,
            FleetEvent::TaskFailed { .. } => EventKind::TaskFailed,
            FleetEvent::ProjectCreated { .. } => EventKind::ProjectCreated,
            FleetEvent::ProjectDeleted { .. } => EventKind::ProjectDeleted,
            FleetEvent::ProjectTransferred { .. } => EventKind::ProjectTransferred,
            FleetEvent::NamespaceOffboarded { .. } => EventKind::NamespaceOffboarded,
            FleetEvent::OffboardIneligibleNamespaces => EventKind::OffboardIneligibleNamespaces,
            FleetEvent::AutoIndexRootNamespaces => EventKind::AutoIndexRootNamespaces,
            FleetEvent::Purge => EventKind::Purge,
        }
    }
}

impl EventKind {
    pub const ALL: [EventKind; 22] = [
        EventKind::LostNode,
        EventKind::OrphanedIndex,
        EventKind::IndexMarkPendingEviction,
        EventKind::IndexToEvict,
        EventKind::NodeWithNegativeUnclaimedStorage,
        EventKind::UpdateIndexUsedStorageBytes,
        EventKind::ForceUpdateOverprovisionedIndex,
        EventKind::InitialIndexing,
        EventKind::MarkIndicesReady,
        EventKind::IndexMarkedToDelete,
        EventKind::OrphanedRepo,
        EventKind::RepoToIndex,
        EventKind::RepoToDelete,
        EventKind::TaskDone,
        EventKind::TaskFailed,
        EventKind::ProjectCreated,
        EventKind::ProjectDeleted,
        EventKind::ProjectTransferred,
        EventKind::NamespaceOffboarded,
        EventKind::OffboardIneligibleNamespaces,
        EventKind::AutoIndexRootNamespaces,
        EventKind::Purge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::LostNode => "lost_node",
            EventKind::OrphanedIndex => "orphaned_index",
            EventKind::IndexMarkPendingEviction => "index_mark_pending_eviction",
            EventKind::IndexToEvict => "index_to_evict",
            EventKind::NodeWithNegativeUnclaimedStorage => "node_with_negative_unclaimed_storage",
            EventKind::UpdateIndexUsedStorageBytes => "update_index_used_storage_bytes",
            EventKind::ForceUpdateOverprovisionedIndex => "force_update_overprovisioned_index",
            EventKind::InitialIndexing => "initial_indexing",
            EventKind::MarkIndicesReady => "mark_indices_ready",
            EventKind::IndexMarkedToDelete => "index_marked_to_delete",
            EventKind::OrphanedRepo => "orphaned_repo",
            EventKind::RepoToIndex => "repo_to_index",
            EventKind::RepoToDelete => "repo_to_delete",
            EventKind::TaskDone => "task_done",
            EventKind::TaskFailed => "task_failed",
            EventKind::ProjectCreated => "project_created",
            EventKind::ProjectDeleted => "project_deleted",
            EventKind::ProjectTransferred => "project_transferred",
            EventKind::NamespaceOffboarded => "namespace_offboarded",
            EventKind::OffboardIneligibleNamespaces => "offboard_ineligible_namespaces",
            EventKind::AutoIndexRootNamespaces => "auto_index_root_namespaces",
            EventKind::Purge => "purge",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
