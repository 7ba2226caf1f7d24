//! Cache backend trait and item types.
//!
//! Backends are byte-oriented key/value stores in the memcache mould: no
//! types, no namespaces, just keys, opaque values, flags and an optional
//! expiry. [`super::ReadThroughCache`] layers serialization, namespacing and
//! retries on top.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bitflags::bitflags;
use keel_core::KeelResult;

bitflags! {
    /// Per-item flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ItemFlags: u32 {
        /// The generator found nothing; the value is empty.
        const NIL = 1;
    }
}

/// One cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheItem {
    pub key: String,
    pub value: Vec<u8>,
    pub flags: ItemFlags,
    /// Relative expiry; `None` never expires.
    pub expiration: Option<Duration>,
    /// Version token returned by reads, checked by compare-and-swap.
    pub cas: u64,
}

impl CacheItem {
    pub fn new(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value,
            flags: ItemFlags::empty(),
            expiration: None,
            cas: 0,
        }
    }

    /// Negative-cache marker.
    pub fn nil(key: impl Into<String>) -> Self {
        Self {
            flags: ItemFlags::NIL,
            ..Self::new(key, Vec::new())
        }
    }

    pub fn with_expiration(mut self, expiration: Option<Duration>) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn is_nil(&self) -> bool {
        self.flags.contains(ItemFlags::NIL)
    }
}

/// Outcome of [`CacheBackend::compare_and_swap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Swapped,
    /// The entry changed since it was read.
    Conflict,
    NotFound,
}

/// Cache backend trait for pluggable cache implementations.
///
/// Errors that are worth retrying must be reported as
/// `CacheError::Backend`; the facade retries only those.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> KeelResult<Option<CacheItem>>;

    /// Fetch several keys. Absent keys are missing from the map.
    async fn get_multi(&self, keys: &[String]) -> KeelResult<HashMap<String, CacheItem>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(item) = self.get(key).await? {
                found.insert(key.clone(), item);
            }
        }
        Ok(found)
    }

    /// Store unconditionally.
    async fn set(&self, item: CacheItem) -> KeelResult<()>;

    async fn set_multi(&self, items: Vec<CacheItem>) -> KeelResult<()> {
        for item in items {
            self.set(item).await?;
        }
        Ok(())
    }

    /// Store only if the key is absent. Returns whether the item was stored.
    async fn add(&self, item: CacheItem) -> KeelResult<bool>;

    /// Delete several keys, reporting per key. A missing key is
    /// `CacheError::Miss`.
    async fn delete_multi(&self, keys: &[String]) -> KeelResult<Vec<KeelResult<()>>>;

    /// Replace `item.key` if its version still equals `item.cas`.
    async fn compare_and_swap(&self, item: CacheItem) -> KeelResult<CasOutcome>;

    /// Add `delta` to a decimal counter, creating it at `initial` if absent.
    /// Decrements stop at zero.
    async fn increment(&self, key: &str, delta: i64, initial: u64) -> KeelResult<u64>;

    /// Get cache statistics.
    async fn stats(&self) -> KeelResult<CacheStats>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Approximate memory usage in bytes.
    pub memory_bytes: u64,
    /// Entries dropped because they expired.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
