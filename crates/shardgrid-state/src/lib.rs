//! shardgrid-state — the entity store for the ShardGrid fleet manager.
//!
//! Backed by [redb](https://docs.rs/redb), it persists nodes, replicas,
//! indices, repositories, tasks and enabled namespaces, together with the
//! namespace/project catalogue mirrored from the account subsystem.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns under
//! `u64` keys, so a table scan always returns rows in id order. Multi-table
//! units of work go through [`StateStore::write`], which commits when the
//! closure returns `Ok` and aborts otherwise.
//!
//! Query scopes live in [`scopes`]: each one is a named predicate and is the
//! transition guard of the state machine it feeds. Scopes take any
//! [`TableReader`], so they run the same inside a read snapshot or inside a
//! write transaction that must re-check a precondition before acting.

/// Wrap a redb or serde_json error, tagged with the step that failed.
macro_rules! map_err {
    (open) => {
        |e| $crate::error::StateError::Open(e.to_string())
    };
    (encode) => {
        |e| $crate::error::StateError::Codec {
            op: "encode",
            message: e.to_string(),
        }
    };
    (decode) => {
        |e| $crate::error::StateError::Codec {
            op: "decode",
            message: e.to_string(),
        }
    };
    ($op:ident) => {
        |e| $crate::error::StateError::Storage {
            op: stringify!($op),
            message: e.to_string(),
        }
    };
}

pub mod error;
pub mod scopes;
pub mod store;
pub mod tables;
pub mod txn;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use tables::Record;
pub use txn::{ReadScope, TableReader, WriteScope};
pub use types::*;
