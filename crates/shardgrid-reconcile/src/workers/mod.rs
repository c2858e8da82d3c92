//! Reconciliation workers, one module per state machine edge family.
//!
//! Every worker is idempotent: its batch comes from a scope over current
//! state, so a repeated or overlapping invocation finds nothing left to do.

pub mod delete_cascade;
pub mod dispatch;
pub mod eviction;
pub mod initial_indexing;
pub mod lost_node;
pub mod namespaces;
pub mod orphans;
pub mod projects;
pub mod purge;
pub mod readiness;
pub mod storage;
pub mod tasks;

#[cfg(test)]
pub(crate) mod testing;
