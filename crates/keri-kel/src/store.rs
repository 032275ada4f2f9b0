//! Ordered key-value storage contract
//!
//! The KEL layer persists through [`KvStore`]: named tables of byte keys in
//! lexicographic order, point reads, prefix scans, and an atomic
//! [`KvStore::commit`] of a [`WriteBatch`]. Each dispatcher step commits
//! exactly one batch, so a step's writes land together or not at all.

use crate::error::{KelError, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One buffered mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert or overwrite
    Put {
        /// Table name
        table: &'static str,
        /// Key
        key: Vec<u8>,
        /// Value
        value: Vec<u8>,
    },
    /// Remove if present
    Delete {
        /// Table name
        table: &'static str,
        /// Key
        key: Vec<u8>,
    },
}

/// Mutations applied together by [`KvStore::commit`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer an insert
    pub fn put(&mut self, table: &'static str, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Put {
            table,
            key: key.into(),
            value: value.into(),
        });
    }

    /// Buffer a removal
    pub fn delete(&mut self, table: &'static str, key: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Delete {
            table,
            key: key.into(),
        });
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of buffered mutations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Buffered mutations in order
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Take the buffered mutations
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    /// Value this batch will leave at `(table, key)`, if it touches it
    pub fn pending(&self, table: &str, key: &[u8]) -> Option<Option<&[u8]>> {
        self.ops.iter().rev().find_map(|op| match op {
            WriteOp::Put { table: t, key: k, value } if *t == table && k == key => {
                Some(Some(value.as_slice()))
            }
            WriteOp::Delete { table: t, key: k } if *t == table && k == key => Some(None),
            _ => None,
        })
    }
}

/// Ordered key-value store
pub trait KvStore: Send + Sync {
    /// Point read
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Every entry whose key starts with `prefix`, in key order
    fn scan_prefix(&self, table: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply every mutation in `batch` atomically
    fn commit(&self, batch: WriteBatch) -> Result<()>;
}

impl<T: KvStore + ?Sized> KvStore for Arc<T> {
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        (**self).get(table, key)
    }

    fn scan_prefix(&self, table: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        (**self).scan_prefix(table, prefix)
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        (**self).commit(batch)
    }
}

type Tables = BTreeMap<String, BTreeMap<Vec<u8>, Vec<u8>>>;

/// In-memory [`KvStore`] over ordered maps
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in `table`
    pub fn len(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, BTreeMap::len)
    }

    /// Whether every table is empty
    pub fn is_empty(&self) -> bool {
        self.tables.read().values().all(BTreeMap::is_empty)
    }
}

impl KvStore for MemoryStore {
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|t| t.get(key))
            .cloned())
    }

    fn scan_prefix(&self, table: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let tables = self.tables.read();
        let Some(t) = tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(t.range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut tables = self.tables.write();
        for op in batch.into_ops() {
            match op {
                WriteOp::Put { table, key, value } => {
                    tables.entry(table.to_string()).or_default().insert(key, value);
                }
                WriteOp::Delete { table, key } => {
                    if let Some(t) = tables.get_mut(table) {
                        t.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Store that rejects every commit, for exercising storage failure paths
#[derive(Debug, Clone, Default)]
pub struct ReadOnlyStore<S> {
    inner: S,
}

impl<S: KvStore> ReadOnlyStore<S> {
    /// Wrap `inner`
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: KvStore> KvStore for ReadOnlyStore<S> {
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(table, key)
    }

    fn scan_prefix(&self, table: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner.scan_prefix(table, prefix)
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        Err(KelError::storage("store is read-only"))
    }
}
