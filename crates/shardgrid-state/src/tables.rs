//! redb table definitions for the ShardGrid entity store.
//!
//! Entity tables use `u64` keys and `&[u8]` values (JSON-serialized records).
//! Auxiliary tables are keyed by name.

use redb::TableDefinition;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Search nodes keyed by node id.
pub const NODES: TableDefinition<u64, &[u8]> = TableDefinition::new("nodes");

/// Replicas keyed by replica id.
pub const REPLICAS: TableDefinition<u64, &[u8]> = TableDefinition::new("replicas");

/// Indices keyed by index id.
pub const INDICES: TableDefinition<u64, &[u8]> = TableDefinition::new("indices");

/// Repositories keyed by repository id.
pub const REPOSITORIES: TableDefinition<u64, &[u8]> = TableDefinition::new("repositories");

/// Tasks keyed by task id.
pub const TASKS: TableDefinition<u64, &[u8]> = TableDefinition::new("tasks");

/// Enabled namespaces keyed by enabled-namespace id.
pub const ENABLED_NAMESPACES: TableDefinition<u64, &[u8]> =
    TableDefinition::new("enabled_namespaces");

/// Catalogue of root namespaces keyed by namespace id.
pub const NAMESPACES: TableDefinition<u64, &[u8]> = TableDefinition::new("namespaces");

/// Catalogue of projects keyed by project id.
pub const PROJECTS: TableDefinition<u64, &[u8]> = TableDefinition::new("projects");

/// Last allocated id per record kind.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Named leases keyed by lease name.
pub const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");

/// Operator flags keyed by setting name.
pub const SETTINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("settings");

/// A record persisted in one of the entity tables.
pub trait Record: Serialize + DeserializeOwned {
    const TABLE: TableDefinition<'static, u64, &'static [u8]>;
    /// Name used for logging and as the id sequence key.
    const KIND: &'static str;

    fn id(&self) -> u64;
    fn set_id(&mut self, id: u64);
}
