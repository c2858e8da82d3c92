//! StateStore — redb-backed entity store for ShardGrid.
//!
//! Provides typed CRUD and bulk operations over every entity table, named
//! leases and the shared operator flags. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::txn::{ReadScope, TableReader, WriteScope, decode, encode};
use crate::types::*;

const FLAGS_KEY: &str = "flags";

/// Thread-safe entity store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(NODES).map_err(map_err!(table))?;
        txn.open_table(REPLICAS).map_err(map_err!(table))?;
        txn.open_table(INDICES).map_err(map_err!(table))?;
        txn.open_table(REPOSITORIES).map_err(map_err!(table))?;
        txn.open_table(TASKS).map_err(map_err!(table))?;
        txn.open_table(ENABLED_NAMESPACES).map_err(map_err!(table))?;
        txn.open_table(NAMESPACES).map_err(map_err!(table))?;
        txn.open_table(PROJECTS).map_err(map_err!(table))?;
        txn.open_table(SEQUENCES).map_err(map_err!(table))?;
        txn.open_table(LEASES).map_err(map_err!(table))?;
        txn.open_table(SETTINGS).map_err(map_err!(table))?;
        txn.commit().map_err(map_err!(transaction))?;
        Ok(())
    }

    // ── Units of work ──────────────────────────────────────────────

    /// Run `f` against a consistent snapshot.
    pub fn read<R>(&self, f: impl FnOnce(&ReadScope) -> StateResult<R>) -> StateResult<R> {
        let txn = self.db.begin_read().map_err(map_err!(transaction))?;
        f(&ReadScope::new(txn))
    }

    /// Run `f` inside one write transaction. Commits when `f` returns `Ok`,
    /// aborts otherwise.
    pub fn write<R>(&self, f: impl FnOnce(&WriteScope) -> StateResult<R>) -> StateResult<R> {
        let txn = self.db.begin_write().map_err(map_err!(transaction))?;
        let scope = WriteScope::new(txn);
        match f(&scope) {
            Ok(value) => {
                scope
                    .into_inner()
                    .commit()
                    .map_err(map_err!(transaction))?;
                Ok(value)
            }
            Err(e) => {
                scope.into_inner().abort().map_err(map_err!(transaction))?;
                Err(e)
            }
        }
    }

    // ── Single-table helpers ───────────────────────────────────────

    pub fn find<T: Record>(&self, id: u64) -> StateResult<Option<T>> {
        self.read(|r| r.get(id))
    }

    /// Like [`find`](Self::find) but a missing row is an error.
    pub fn get<T: Record>(&self, id: u64) -> StateResult<T> {
        self.find(id)?
            .ok_or(StateError::NotFound { kind: T::KIND, id })
    }

    pub fn list<T: Record>(&self) -> StateResult<Vec<T>> {
        self.read(|r| r.all())
    }

    /// Up to `limit` rows matching `predicate`, in id order.
    pub fn batch<T: Record>(
        &self,
        predicate: impl FnMut(&T) -> bool,
        limit: usize,
    ) -> StateResult<Vec<T>> {
        self.read(|r| r.scan(predicate, Some(limit)))
    }

    pub fn exists<T: Record>(&self, predicate: impl FnMut(&T) -> bool) -> StateResult<bool> {
        Ok(!self.batch(predicate, 1)?.is_empty())
    }

    pub fn count<T: Record>(&self, predicate: impl FnMut(&T) -> bool) -> StateResult<usize> {
        Ok(self.read(|r| r.scan(predicate, None))?.len())
    }

    pub fn insert<T: Record>(&self, row: T) -> StateResult<T> {
        let row = self.write(|w| w.insert(row))?;
        debug!(kind = T::KIND, id = row.id(), "row inserted");
        Ok(row)
    }

    pub fn put<T: Record>(&self, row: &T) -> StateResult<()> {
        self.write(|w| w.put(row))
    }

    /// Delete a row by id. Returns true if it existed.
    pub fn delete<T: Record>(&self, id: u64) -> StateResult<bool> {
        let existed = self.write(|w| w.remove::<T>(id))?;
        debug!(kind = T::KIND, id, existed, "row deleted");
        Ok(existed)
    }

    /// Insert all rows in one transaction. Returns the inserted count.
    pub fn bulk_insert<T: Record>(&self, rows: Vec<T>) -> StateResult<usize> {
        self.write(|w| {
            let mut inserted = 0;
            for row in rows {
                w.insert(row)?;
                inserted += 1;
            }
            Ok(inserted)
        })
    }

    /// Apply `mutate` to the listed rows in one transaction. Returns the count.
    pub fn bulk_update<T: Record>(
        &self,
        ids: &[u64],
        mutate: impl FnMut(&mut T),
    ) -> StateResult<usize> {
        self.write(|w| w.update_many(ids, mutate))
    }

    /// Insert the `EnabledNamespace` for a root namespace, rejecting duplicates.
    pub fn enable_namespace(
        &self,
        root_namespace_id: NamespaceId,
        now: u64,
    ) -> StateResult<EnabledNamespace> {
        self.write(|w| {
            let existing = w.scan(
                |e: &EnabledNamespace| e.root_namespace_id == root_namespace_id,
                Some(1),
            )?;
            if !existing.is_empty() {
                return Err(StateError::AlreadyEnabled(root_namespace_id));
            }
            w.insert(EnabledNamespace::new(root_namespace_id, now))
        })
    }

    // ── Flags ──────────────────────────────────────────────────────

    pub fn flags(&self) -> StateResult<FleetFlags> {
        let txn = self.db.begin_read().map_err(map_err!(transaction))?;
        let table = txn.open_table(SETTINGS).map_err(map_err!(table))?;
        match table.get(FLAGS_KEY).map_err(map_err!(read))? {
            Some(guard) => decode(guard.value()),
            None => Ok(FleetFlags::default()),
        }
    }

    pub fn put_flags(&self, flags: &FleetFlags) -> StateResult<()> {
        let value = encode(flags)?;
        self.write(|w| {
            let mut table = w.txn().open_table(SETTINGS).map_err(map_err!(table))?;
            table
                .insert(FLAGS_KEY, value.as_slice())
                .map_err(map_err!(write))?;
            Ok(())
        })?;
        debug!(?flags, "fleet flags stored");
        Ok(())
    }

    // ── Leases ─────────────────────────────────────────────────────

    /// Take the named lease for `holder` unless another holder owns an
    /// unexpired one. Re-acquiring an owned lease extends it.
    pub fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl_secs: u64,
        now: u64,
    ) -> StateResult<bool> {
        self.write(|w| {
            let mut table = w.txn().open_table(LEASES).map_err(map_err!(table))?;
            let current: Option<Lease> = match table.get(name).map_err(map_err!(read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            if let Some(lease) = current
                && lease.holder != holder
                && lease.expires_at > now
            {
                return Ok(false);
            }
            let lease = Lease {
                name: name.to_string(),
                holder: holder.to_string(),
                expires_at: now + ttl_secs,
            };
            let value = encode(&lease)?;
            table
                .insert(name, value.as_slice())
                .map_err(map_err!(write))?;
            Ok(true)
        })
    }

    /// Release a lease held by `holder`. Returns false if someone else holds it.
    pub fn release_lease(&self, name: &str, holder: &str) -> StateResult<bool> {
        self.write(|w| {
            let mut table = w.txn().open_table(LEASES).map_err(map_err!(table))?;
            let current: Option<Lease> = match table.get(name).map_err(map_err!(read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            match current {
                Some(lease) if lease.holder == holder => {
                    table.remove(name).map_err(map_err!(write))?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    pub fn lease(&self, name: &str) -> StateResult<Option<Lease>> {
        let txn = self.db.begin_read().map_err(map_err!(transaction))?;
        let table = txn.open_table(LEASES).map_err(map_err!(table))?;
        match table.get(name).map_err(map_err!(read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    // ── Health ─────────────────────────────────────────────────────

    /// Time a small read round trip. Feeds the store-health gate.
    pub fn probe(&self) -> StateResult<Duration> {
        let started = Instant::now();
        self.read(|r| r.scan(|_: &Node| true, Some(1)))?;
        Ok(started.elapsed())
    }
}
