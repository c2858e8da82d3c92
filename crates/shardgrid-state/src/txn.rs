//! Transaction scopes over the entity tables.
//!
//! [`ReadScope`] wraps a redb read snapshot, [`WriteScope`] a write
//! transaction. Both implement [`TableReader`], so query scopes can be
//! evaluated against either.

use redb::{ReadTransaction, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StateResult;
use crate::tables::{Record, SEQUENCES};

/// Typed row access shared by read and write scopes. Rows come back in id order.
pub trait TableReader {
    fn get<T: Record>(&self, id: u64) -> StateResult<Option<T>>;

    /// Rows matching `filter`, stopping after `limit` matches when given.
    fn scan<T: Record>(
        &self,
        filter: impl FnMut(&T) -> bool,
        limit: Option<usize>,
    ) -> StateResult<Vec<T>>;

    fn all<T: Record>(&self) -> StateResult<Vec<T>> {
        self.scan(|_: &T| true, None)
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(encode))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(decode))
}

fn get_row<T: Record>(
    table: &impl ReadableTable<u64, &'static [u8]>,
    id: u64,
) -> StateResult<Option<T>> {
    match table.get(id).map_err(map_err!(read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

fn scan_rows<T: Record>(
    table: &impl ReadableTable<u64, &'static [u8]>,
    mut filter: impl FnMut(&T) -> bool,
    limit: Option<usize>,
) -> StateResult<Vec<T>> {
    let mut rows = Vec::new();
    if limit == Some(0) {
        return Ok(rows);
    }
    for entry in table.iter().map_err(map_err!(read))? {
        let (_, value) = entry.map_err(map_err!(read))?;
        let row: T = decode(value.value())?;
        if filter(&row) {
            rows.push(row);
            if limit.is_some_and(|limit| rows.len() >= limit) {
                break;
            }
        }
    }
    Ok(rows)
}

// ── Read ───────────────────────────────────────────────────────────

/// A consistent read-only snapshot.
pub struct ReadScope {
    txn: ReadTransaction,
}

impl ReadScope {
    pub(crate) fn new(txn: ReadTransaction) -> Self {
        Self { txn }
    }
}

impl TableReader for ReadScope {
    fn get<T: Record>(&self, id: u64) -> StateResult<Option<T>> {
        let table = self.txn.open_table(T::TABLE).map_err(map_err!(table))?;
        get_row(&table, id)
    }

    fn scan<T: Record>(
        &self,
        filter: impl FnMut(&T) -> bool,
        limit: Option<usize>,
    ) -> StateResult<Vec<T>> {
        let table = self.txn.open_table(T::TABLE).map_err(map_err!(table))?;
        scan_rows(&table, filter, limit)
    }
}

// ── Write ──────────────────────────────────────────────────────────

/// An open write transaction. Committed by [`crate::StateStore::write`]
/// when the unit of work succeeds, aborted otherwise.
pub struct WriteScope {
    txn: WriteTransaction,
}

impl WriteScope {
    pub(crate) fn new(txn: WriteTransaction) -> Self {
        Self { txn }
    }

    pub(crate) fn into_inner(self) -> WriteTransaction {
        self.txn
    }

    fn next_id(&self, kind: &str) -> StateResult<u64> {
        let mut table = self.txn.open_table(SEQUENCES).map_err(map_err!(table))?;
        let current = table
            .get(kind)
            .map_err(map_err!(read))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        let next = current + 1;
        table.insert(kind, next).map_err(map_err!(write))?;
        Ok(next)
    }

    /// Insert a new row, allocating its id from the record's sequence.
    pub fn insert<T: Record>(&self, mut row: T) -> StateResult<T> {
        row.set_id(self.next_id(T::KIND)?);
        self.put(&row)?;
        Ok(row)
    }

    /// Insert or overwrite a row under its current id.
    pub fn put<T: Record>(&self, row: &T) -> StateResult<()> {
        let value = encode(row)?;
        let mut table = self.txn.open_table(T::TABLE).map_err(map_err!(table))?;
        table
            .insert(row.id(), value.as_slice())
            .map_err(map_err!(write))?;
        Ok(())
    }

    /// Delete a row. Returns true if it existed.
    pub fn remove<T: Record>(&self, id: u64) -> StateResult<bool> {
        let mut table = self.txn.open_table(T::TABLE).map_err(map_err!(table))?;
        let existed = table.remove(id).map_err(map_err!(write))?.is_some();
        Ok(existed)
    }

    pub fn remove_many<T: Record>(&self, ids: &[u64]) -> StateResult<usize> {
        let mut table = self.txn.open_table(T::TABLE).map_err(map_err!(table))?;
        let mut removed = 0;
        for id in ids {
            if table.remove(*id).map_err(map_err!(write))?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Apply `mutate` to every listed row that still exists. Returns the count.
    pub fn update_many<T: Record>(
        &self,
        ids: &[u64],
        mut mutate: impl FnMut(&mut T),
    ) -> StateResult<usize> {
        let mut table = self.txn.open_table(T::TABLE).map_err(map_err!(table))?;
        let mut updated = 0;
        for id in ids {
            let mut row: T = match get_row(&table, *id)? {
                Some(row) => row,
                None => continue,
            };
            mutate(&mut row);
            let value = encode(&row)?;
            table
                .insert(*id, value.as_slice())
                .map_err(map_err!(write))?;
            updated += 1;
        }
        Ok(updated)
    }

    pub(crate) fn txn(&self) -> &WriteTransaction {
        &self.txn
    }
}

impl TableReader for WriteScope {
    fn get<T: Record>(&self, id: u64) -> StateResult<Option<T>> {
        let table = self.txn.open_table(T::TABLE).map_err(map_err!(table))?;
        get_row(&table, id)
    }

    fn scan<T: Record>(
        &self,
        filter: impl FnMut(&T) -> bool,
        limit: Option<usize>,
    ) -> StateResult<Vec<T>> {
        let table = self.txn.open_table(T::TABLE).map_err(map_err!(table))?;
        scan_rows(&table, filter, limit)
    }
}
