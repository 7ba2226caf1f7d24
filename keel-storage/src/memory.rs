//! In-memory [`Store`] for tests and local development.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use keel_core::{Identifier, KeelError, KeelResult, StorageError};
use tokio::sync::Mutex;

use crate::store::{Properties, Query, Store, TransactionBody};

/// Calls that reached the store, for asserting cache effectiveness.
#[derive(Debug, Default)]
pub struct StoreCallCounts {
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
    queries: AtomicU64,
}

impl StoreCallCounts {
    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }
}

/// Store backed by a `BTreeMap`.
///
/// Transactions are serialized through a single async lock and roll back by
/// restoring a snapshot taken on entry. Writes made outside any transaction
/// while one is running are lost if it rolls back, which is fine for a test
/// double.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Arc<RwLock<BTreeMap<Identifier, Properties>>>,
    next_id: AtomicI64,
    transaction_lock: Mutex<()>,
    calls: StoreCallCounts,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a record directly, bypassing key assignment. Useful for seeding
    /// records written by an older schema.
    pub fn insert_raw(&self, key: Identifier, properties: Properties) -> KeelResult<()> {
        self.reserve(&key);
        self.write()?.insert(key, properties);
        Ok(())
    }

    /// Read a record directly, without counting the call.
    pub fn peek(&self, key: &Identifier) -> KeelResult<Option<Properties>> {
        Ok(self.read()?.get(key).cloned())
    }

    pub fn len(&self) -> usize {
        self.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all stored data.
    pub fn clear(&self) -> KeelResult<()> {
        self.write()?.clear();
        Ok(())
    }

    pub fn calls(&self) -> &StoreCallCounts {
        &self.calls
    }

    fn read(&self) -> KeelResult<RwLockReadGuard<'_, BTreeMap<Identifier, Properties>>> {
        self.records
            .read()
            .map_err(|_| KeelError::Storage(StorageError::LockPoisoned))
    }

    fn write(&self) -> KeelResult<RwLockWriteGuard<'_, BTreeMap<Identifier, Properties>>> {
        self.records
            .write()
            .map_err(|_| KeelError::Storage(StorageError::LockPoisoned))
    }

    fn complete(&self, key: &Identifier) -> KeelResult<Identifier> {
        if key.is_zero() {
            return Err(StorageError::IncompleteKey {
                kind: String::new(),
            }
            .into());
        }
        if key.is_incomplete() {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            return Ok(key.complete_with(id));
        }
        self.reserve(key);
        Ok(key.clone())
    }

    /// Keep the allocator past an int id chosen by the caller.
    fn reserve(&self, key: &Identifier) {
        if key.int_id() > 0 {
            self.next_id.fetch_max(key.int_id(), Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &Identifier) -> KeelResult<Properties> {
        self.calls.gets.fetch_add(1, Ordering::Relaxed);
        self.read()?
            .get(key)
            .cloned()
            .ok_or_else(|| KeelError::no_such_entity(key.kind(), key.clone()))
    }

    async fn get_multi(&self, keys: &[Identifier]) -> KeelResult<Vec<KeelResult<Properties>>> {
        self.calls.gets.fetch_add(1, Ordering::Relaxed);
        let records = self.read()?;
        Ok(keys
            .iter()
            .map(|key| {
                records
                    .get(key)
                    .cloned()
                    .ok_or_else(|| KeelError::no_such_entity(key.kind(), key.clone()))
            })
            .collect())
    }

    async fn put(&self, key: &Identifier, properties: Properties) -> KeelResult<Identifier> {
        self.calls.puts.fetch_add(1, Ordering::Relaxed);
        let key = self.complete(key)?;
        self.write()?.insert(key.clone(), properties);
        Ok(key)
    }

    async fn put_multi(&self, entries: Vec<(Identifier, Properties)>) -> KeelResult<Vec<Identifier>> {
        self.calls.puts.fetch_add(1, Ordering::Relaxed);
        let completed = entries
            .into_iter()
            .map(|(key, properties)| Ok((self.complete(&key)?, properties)))
            .collect::<KeelResult<Vec<_>>>()?;

        let mut records = self.write()?;
        let mut keys = Vec::with_capacity(completed.len());
        for (key, properties) in completed {
            records.insert(key.clone(), properties);
            keys.push(key);
        }
        Ok(keys)
    }

    async fn delete(&self, key: &Identifier) -> KeelResult<()> {
        self.calls.deletes.fetch_add(1, Ordering::Relaxed);
        self.write()?.remove(key);
        Ok(())
    }

    async fn delete_multi(&self, keys: &[Identifier]) -> KeelResult<()> {
        self.calls.deletes.fetch_add(1, Ordering::Relaxed);
        let mut records = self.write()?;
        for key in keys {
            records.remove(key);
        }
        Ok(())
    }

    async fn query(&self, query: &Query) -> KeelResult<Vec<(Identifier, Properties)>> {
        self.calls.queries.fetch_add(1, Ordering::Relaxed);
        let records = self.read()?;
        let matches = records
            .iter()
            .filter(|(key, properties)| query.matches(key, properties))
            .map(|(key, properties)| (key.clone(), properties.clone()));
        Ok(match query.max_results() {
            Some(limit) => matches.take(limit).collect(),
            None => matches.collect(),
        })
    }

    async fn run_in_transaction<'a>(
        &'a self,
        cross_group: bool,
        body: TransactionBody<'a>,
    ) -> KeelResult<()> {
        let _guard = self.transaction_lock.lock().await;
        tracing::trace!(cross_group, "memory store transaction started");
        let snapshot = self.read()?.clone();

        match body().await {
            Ok(()) => Ok(()),
            Err(err) => {
                *self.write()? = snapshot;
                tracing::debug!(error = %err, "memory store transaction rolled back");
                Err(err)
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
