//! In-process cache backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockWriteGuard};

use async_trait::async_trait;
use keel_core::{CacheError, KeelError, KeelResult, StorageError};
use tokio::time::Instant;

use super::backend::{CacheBackend, CacheItem, CacheStats, CasOutcome, ItemFlags};

#[derive(Debug, Clone)]
struct Slot {
    value: Vec<u8>,
    flags: ItemFlags,
    expires_at: Option<Instant>,
    cas: u64,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    fn to_item(&self, key: &str) -> CacheItem {
        CacheItem {
            key: key.to_string(),
            value: self.value.clone(),
            flags: self.flags,
            expiration: None,
            cas: self.cas,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// HashMap-backed [`CacheBackend`].
///
/// Expiry follows tokio's clock, so paused-time tests can advance past a TTL.
/// [`MemoryCacheBackend::fail_next`] makes the next calls fail with a
/// retryable error.
#[derive(Debug, Default)]
pub struct MemoryCacheBackend {
    entries: RwLock<HashMap<String, Slot>>,
    next_cas: AtomicU64,
    counters: Counters,
    pending_failures: AtomicU32,
    calls: AtomicU64,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` backend calls with `CacheError::Backend`.
    pub fn fail_next(&self, n: u32) {
        self.pending_failures.store(n, Ordering::SeqCst);
    }

    /// Total backend calls, failed ones included.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Whether a live entry exists under `key`. Does not touch stats.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .read()
            .map(|entries| entries.get(key).map(|s| !s.is_expired(now)).unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn enter(&self) -> KeelResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CacheError::Backend {
                reason: "injected failure".to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn write(&self) -> KeelResult<RwLockWriteGuard<'_, HashMap<String, Slot>>> {
        self.entries
            .write()
            .map_err(|_| KeelError::Storage(StorageError::LockPoisoned))
    }

    fn slot_for(&self, item: &CacheItem, now: Instant) -> Slot {
        Slot {
            value: item.value.clone(),
            flags: item.flags,
            expires_at: item.expiration.map(|ttl| now + ttl),
            cas: self.next_cas.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }

    /// Live slot under `key`, dropping it if it has expired.
    fn live<'a>(
        &self,
        entries: &'a mut HashMap<String, Slot>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut Slot> {
        if entries.get(key).map(|s| s.is_expired(now)).unwrap_or(false) {
            entries.remove(key);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        entries.get_mut(key)
    }

    fn lookup(&self, entries: &mut HashMap<String, Slot>, key: &str, now: Instant) -> Option<CacheItem> {
        match self.live(entries, key, now) {
            Some(slot) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(slot.to_item(key))
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> KeelResult<Option<CacheItem>> {
        self.enter()?;
        let now = Instant::now();
        let mut entries = self.write()?;
        Ok(self.lookup(&mut entries, key, now))
    }

    async fn get_multi(&self, keys: &[String]) -> KeelResult<HashMap<String, CacheItem>> {
        self.enter()?;
        let now = Instant::now();
        let mut entries = self.write()?;
        Ok(keys
            .iter()
            .filter_map(|key| self.lookup(&mut entries, key, now).map(|i| (key.clone(), i)))
            .collect())
    }

    async fn set(&self, item: CacheItem) -> KeelResult<()> {
        self.enter()?;
        let slot = self.slot_for(&item, Instant::now());
        self.write()?.insert(item.key, slot);
        Ok(())
    }

    async fn set_multi(&self, items: Vec<CacheItem>) -> KeelResult<()> {
        self.enter()?;
        let now = Instant::now();
        let mut entries = self.write()?;
        for item in items {
            let slot = self.slot_for(&item, now);
            entries.insert(item.key, slot);
        }
        Ok(())
    }

    async fn add(&self, item: CacheItem) -> KeelResult<bool> {
        self.enter()?;
        let now = Instant::now();
        let mut entries = self.write()?;
        if self.live(&mut entries, &item.key, now).is_some() {
            return Ok(false);
        }
        let slot = self.slot_for(&item, now);
        entries.insert(item.key, slot);
        Ok(true)
    }

    async fn delete_multi(&self, keys: &[String]) -> KeelResult<Vec<KeelResult<()>>> {
        self.enter()?;
        let now = Instant::now();
        let mut entries = self.write()?;
        Ok(keys
            .iter()
            .map(|key| {
                let live = self.live(&mut entries, key, now).is_some();
                entries.remove(key);
                if live {
                    Ok(())
                } else {
                    Err(CacheError::Miss.into())
                }
            })
            .collect())
    }

    async fn compare_and_swap(&self, item: CacheItem) -> KeelResult<CasOutcome> {
        self.enter()?;
        let now = Instant::now();
        let mut entries = self.write()?;
        let current = match self.live(&mut entries, &item.key, now) {
            Some(slot) => slot.cas,
            None => return Ok(CasOutcome::NotFound),
        };
        if current != item.cas {
            return Ok(CasOutcome::Conflict);
        }
        let slot = self.slot_for(&item, now);
        entries.insert(item.key, slot);
        Ok(CasOutcome::Swapped)
    }

    async fn increment(&self, key: &str, delta: i64, initial: u64) -> KeelResult<u64> {
        self.enter()?;
        let now = Instant::now();
        let mut entries = self.write()?;
        let current = match self.live(&mut entries, key, now) {
            Some(slot) => std::str::from_utf8(&slot.value)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| CacheError::Serialization {
                    reason: format!("value under {key} is not a decimal counter"),
                })?,
            None => initial,
        };
        let next = if delta >= 0 {
            current.wrapping_add(delta.unsigned_abs())
        } else {
            current.saturating_sub(delta.unsigned_abs())
        };

        let expires_at = entries.get(key).and_then(|s| s.expires_at);
        let slot = Slot {
            value: next.to_string().into_bytes(),
            flags: ItemFlags::empty(),
            expires_at,
            cas: self.next_cas.fetch_add(1, Ordering::SeqCst) + 1,
        };
        entries.insert(key.to_string(), slot);
        Ok(next)
    }

    async fn stats(&self) -> KeelResult<CacheStats> {
        self.enter()?;
        let entries = self
            .entries
            .read()
            .map_err(|_| KeelError::Storage(StorageError::LockPoisoned))?;
        Ok(CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            entry_count: entries.len() as u64,
            memory_bytes: entries
                .iter()
                .map(|(k, s)| (k.len() + s.value.len()) as u64)
                .sum(),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn item(key: &str, value: &str) -> CacheItem {
        CacheItem::new(key, value.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let cache = MemoryCacheBackend::new();
        cache.set(item("a", "1")).await.unwrap();

        let found = cache.get("a").await.unwrap().unwrap();
        assert_eq!(found.value, b"1".to_vec());
        assert!(cache.get("b").await.unwrap().is_none());

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
    }

    #[tokio::test]
    async fn test_add_only_when_absent() {
        let cache = MemoryCacheBackend::new();
        assert!(cache.add(item("a", "1")).await.unwrap());
        assert!(!cache.add(item("a", "2")).await.unwrap());
        assert_eq!(cache.get("a").await.unwrap().unwrap().value, b"1".to_vec());
    }

    #[tokio::test]
    async fn test_delete_multi_reports_misses() {
        let cache = MemoryCacheBackend::new();
        cache.set(item("a", "1")).await.unwrap();
        let results = cache
            .delete_multi(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert!(results[0].is_ok());
        assert!(results[1].as_ref().unwrap_err().is_cache_miss());
        assert!(!cache.contains("a"));
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let cache = MemoryCacheBackend::new();
        cache.set(item("a", "1")).await.unwrap();
        let read = cache.get("a").await.unwrap().unwrap();

        let mut stale = read.clone();
        stale.value = b"2".to_vec();
        assert_eq!(
            cache.compare_and_swap(stale.clone()).await.unwrap(),
            CasOutcome::Swapped
        );
        assert_eq!(
            cache.compare_and_swap(stale).await.unwrap(),
            CasOutcome::Conflict
        );
        assert_eq!(
            cache.compare_and_swap(item("missing", "x")).await.unwrap(),
            CasOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_increment() {
        let cache = MemoryCacheBackend::new();
        assert_eq!(cache.increment("n", 1, 10).await.unwrap(), 11);
        assert_eq!(cache.increment("n", 5, 0).await.unwrap(), 16);
        assert_eq!(cache.increment("n", -20, 0).await.unwrap(), 0);

        cache.set(item("text", "abc")).await.unwrap();
        assert!(cache.increment("text", 1, 0).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = MemoryCacheBackend::new();
        cache
            .set(item("a", "1").with_expiration(Some(Duration::from_secs(5))))
            .await
            .unwrap();
        assert!(cache.contains("a"));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!cache.contains("a"));
        assert!(cache.get("a").await.unwrap().is_none());
        assert_eq!(cache.stats().await.unwrap().evictions, 1);
    }

    #[tokio::test]
    async fn test_fail_next_injects_transient_errors() {
        let cache = MemoryCacheBackend::new();
        cache.fail_next(2);
        assert!(cache.get("a").await.unwrap_err().is_transient());
        assert!(cache.set(item("a", "1")).await.unwrap_err().is_transient());
        assert!(cache.set(item("a", "1")).await.is_ok());
        assert_eq!(cache.call_count(), 3);
    }
}
