//! Read-through cache facade.
//!
//! Wraps a byte-oriented [`CacheBackend`] with:
//!
//! - JSON value encoding, so callers work with typed values
//! - namespaced, hashed keys (see [`super::keys`])
//! - exponential backoff on transient backend errors
//! - transaction awareness: inside a transaction reads and writes bypass the
//!   cache, and deletions are deferred until the transaction commits
//! - memoization with optional negative caching
//!
//! # Example
//!
//! ```ignore
//! let cache = ReadThroughCache::new(Arc::new(MemoryCacheBackend::new()), CacheConfig::default());
//!
//! let zones: Vec<SoundZone> = cache
//!     .memoize(&ctx, "zones/lobby", None, || async { load_zones().await })
//!     .await?;
//! ```

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::FutureExt;
use keel_core::{CacheConfig, CacheError, KeelResult, RetryConfig};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use super::backend::{CacheBackend, CacheItem, CacheStats, CasOutcome, ItemFlags};
use super::keys;
use super::retry::with_backoff;
use crate::context::Context;

/// Outcome of a cache read.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Hit(T),
    /// A negative-cache marker: the value is known not to exist.
    Nil,
    Miss,
}

impl<T> Lookup<T> {
    pub fn hit(self) -> Option<T> {
        match self {
            Lookup::Hit(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Lookup::Nil)
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, Lookup::Miss)
    }
}

/// Typed, namespaced, retrying view of a [`CacheBackend`].
#[derive(Clone)]
pub struct ReadThroughCache {
    backend: Arc<dyn CacheBackend>,
    config: CacheConfig,
}

impl ReadThroughCache {
    /// Create a new read-through cache.
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        Self { backend, config }
    }

    /// Create a new read-through cache with default configuration.
    pub fn with_defaults(backend: Arc<dyn CacheBackend>) -> Self {
        Self::new(backend, CacheConfig::default())
    }

    /// Get the cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get a reference to the cache backend.
    pub fn backend(&self) -> &dyn CacheBackend {
        self.backend.as_ref()
    }

    /// Backend key for a raw key.
    pub fn backend_key(&self, raw: &str) -> String {
        keys::backend_key(&self.config.namespace, raw)
    }

    /// False when the cache is disabled or `ctx` is inside a transaction.
    pub fn is_active(&self, ctx: &Context) -> bool {
        self.config.enabled && !ctx.in_transaction()
    }

    pub async fn get<T: DeserializeOwned>(&self, ctx: &Context, key: &str) -> KeelResult<Lookup<T>> {
        if !self.is_active(ctx) {
            return Ok(Lookup::Miss);
        }
        let backend = &self.backend;
        let backend_key = self.backend_key(key);
        let key_ref = backend_key.as_str();
        let item = with_backoff(&self.config.retry, "get", move || backend.get(key_ref)).await?;

        match item {
            None => Ok(Lookup::Miss),
            Some(item) if item.is_nil() => Ok(Lookup::Nil),
            Some(item) => decode(&item.value).map(Lookup::Hit),
        }
    }

    /// Look up several keys in one backend call. Entries that fail to decode
    /// are reported as misses.
    pub async fn get_multi<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        keys: &[String],
    ) -> KeelResult<Vec<Lookup<T>>> {
        if !self.is_active(ctx) {
            return Ok(keys.iter().map(|_| Lookup::Miss).collect());
        }
        let backend = &self.backend;
        let backend_keys: Vec<String> = keys.iter().map(|k| self.backend_key(k)).collect();
        let keys_ref = backend_keys.as_slice();
        let mut found =
            with_backoff(&self.config.retry, "get_multi", move || backend.get_multi(keys_ref))
                .await?;

        Ok(backend_keys
            .iter()
            .zip(keys)
            .map(|(backend_key, key)| match found.remove(backend_key) {
                None => Lookup::Miss,
                Some(item) if item.is_nil() => Lookup::Nil,
                Some(item) => match decode(&item.value) {
                    Ok(value) => Lookup::Hit(value),
                    Err(err) => {
                        tracing::warn!(ctx = ctx.label(), key = %key, error = %err, "Discarding undecodable cache entry");
                        Lookup::Miss
                    }
                },
            })
            .collect())
    }

    /// Store `value` under `key`. `ttl` of `None` uses the configured default.
    pub async fn put<T: Serialize>(
        &self,
        ctx: &Context,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> KeelResult<()> {
        if !self.is_active(ctx) {
            return Ok(());
        }
        let item = CacheItem::new(self.backend_key(key), encode(value)?)
            .with_expiration(ttl.or(self.config.default_ttl));
        let backend = &self.backend;
        with_backoff(&self.config.retry, "set", move || backend.set(item.clone())).await
    }

    pub async fn put_multi<T: Serialize>(
        &self,
        ctx: &Context,
        entries: &[(String, T)],
        ttl: Option<Duration>,
    ) -> KeelResult<()> {
        if !self.is_active(ctx) || entries.is_empty() {
            return Ok(());
        }
        let expiration = ttl.or(self.config.default_ttl);
        let items = entries
            .iter()
            .map(|(key, value)| {
                Ok(CacheItem::new(self.backend_key(key), encode(value)?).with_expiration(expiration))
            })
            .collect::<KeelResult<Vec<_>>>()?;
        self.set_items(items).await
    }

    /// Delete keys. A key that is not cached counts as deleted.
    ///
    /// Inside a transaction the deletion is queued on the context and runs
    /// after commit; an aborted transaction leaves the keys in place.
    pub async fn delete(&self, ctx: &Context, keys: &[String]) -> KeelResult<()> {
        if !self.config.enabled || keys.is_empty() {
            return Ok(());
        }
        let backend_keys: Vec<String> = keys.iter().map(|k| self.backend_key(k)).collect();

        if ctx.in_transaction() {
            tracing::debug!(
                ctx = ctx.label(),
                count = backend_keys.len(),
                "Deferring cache deletion until commit"
            );
            let backend = self.backend.clone();
            let retry = self.config.retry.clone();
            return ctx.after_transaction(async move {
                delete_now(backend.as_ref(), &retry, &backend_keys).await
            });
        }

        delete_now(self.backend.as_ref(), &self.config.retry, &backend_keys).await
    }

    /// Replace the value under `key` with `replacement`, but only if it still
    /// holds `expected`. Returns `false` on any conflict or when the key is
    /// absent.
    pub async fn compare_and_swap<T: Serialize>(
        &self,
        ctx: &Context,
        key: &str,
        expected: &T,
        replacement: &T,
    ) -> KeelResult<bool> {
        if !self.is_active(ctx) {
            return Ok(false);
        }
        let backend = &self.backend;
        let backend_key = self.backend_key(key);
        let key_ref = backend_key.as_str();
        let current = with_backoff(&self.config.retry, "get", move || backend.get(key_ref)).await?;

        let mut item = match current {
            Some(item) if !item.is_nil() && item.value == encode(expected)? => item,
            _ => return Ok(false),
        };
        item.value = encode(replacement)?;
        item.flags = ItemFlags::empty();
        item.expiration = self.config.default_ttl;

        let outcome = with_backoff(&self.config.retry, "cas", move || {
            backend.compare_and_swap(item.clone())
        })
        .await?;
        Ok(outcome == CasOutcome::Swapped)
    }

    /// Add `delta` to the counter under `key`, starting from `initial`.
    ///
    /// Counters live only in the cache; with the cache disabled this is a
    /// `CacheError::Miss`.
    pub async fn increment(&self, key: &str, delta: i64, initial: u64) -> KeelResult<u64> {
        if !self.config.enabled {
            return Err(CacheError::Miss.into());
        }
        let backend = &self.backend;
        let backend_key = self.backend_key(key);
        let key_ref = backend_key.as_str();
        with_backoff(&self.config.retry, "increment", move || {
            backend.increment(key_ref, delta, initial)
        })
        .await
    }

    /// Return the cached value under `key`, or run `generator` and cache its
    /// result.
    ///
    /// A generator result of "not found" (`NoSuchEntity` or `CacheError::Miss`)
    /// is cached as a nil marker when `cache_nil` is set; later calls then
    /// return `CacheError::Miss` without running the generator. Other errors
    /// are returned and nothing is cached. A backend failure on either side
    /// degrades to calling the generator.
    pub async fn memoize<T, F, Fut>(
        &self,
        ctx: &Context,
        key: &str,
        ttl: Option<Duration>,
        generator: F,
    ) -> KeelResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = KeelResult<T>>,
    {
        self.memoize_multi(ctx, vec![(key.to_string(), generator)], ttl)
            .await
            .into_iter()
            .next()
            .unwrap_or_else(|| Err(CacheError::Miss.into()))
    }

    /// Batch form of [`ReadThroughCache::memoize`].
    ///
    /// Cached keys are read in one backend call. Generators for the missing
    /// keys run concurrently; results come back in input order. A panicking
    /// generator does not disturb its siblings: once all of them have
    /// finished, its slot holds `CacheError::GeneratorPanicked`.
    pub async fn memoize_multi<T, F, Fut>(
        &self,
        ctx: &Context,
        entries: Vec<(String, F)>,
        ttl: Option<Duration>,
    ) -> Vec<KeelResult<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = KeelResult<T>>,
    {
        let active = self.is_active(ctx);
        let mut slots: Vec<Option<KeelResult<T>>> = entries.iter().map(|_| None).collect();
        let mut pending = Vec::new();

        if active {
            let raw_keys: Vec<String> = entries.iter().map(|(k, _)| k.clone()).collect();
            let cached = match self.get_multi::<T>(ctx, &raw_keys).await {
                Ok(cached) => cached,
                Err(err) => {
                    tracing::warn!(
                        ctx = ctx.label(),
                        count = raw_keys.len(),
                        error = %err,
                        "Cache read failed, falling back to generators"
                    );
                    raw_keys.iter().map(|_| Lookup::Miss).collect()
                }
            };
            for (index, ((key, generator), lookup)) in entries.into_iter().zip(cached).enumerate() {
                match lookup {
                    Lookup::Hit(value) => slots[index] = Some(Ok(value)),
                    Lookup::Nil => slots[index] = Some(Err(CacheError::Miss.into())),
                    Lookup::Miss => pending.push((index, key, generator)),
                }
            }
        } else {
            pending.extend(
                entries
                    .into_iter()
                    .enumerate()
                    .map(|(index, (key, generator))| (index, key, generator)),
            );
        }

        let generated = join_all(pending.into_iter().map(|(index, key, generator)| async move {
            let outcome = AssertUnwindSafe(async move { generator().await })
                .catch_unwind()
                .await;
            let result = outcome.unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                tracing::error!(key = %key, panic = %message, "Cache generator panicked");
                Err(CacheError::GeneratorPanicked {
                    key: key.clone(),
                    message,
                }
                .into())
            });
            (index, key, result)
        }))
        .await;

        if active {
            let expiration = ttl.or(self.config.default_ttl);
            let mut items = Vec::new();
            for (_, key, result) in &generated {
                match result {
                    Ok(value) => match encode(value) {
                        Ok(bytes) => items.push(
                            CacheItem::new(self.backend_key(key), bytes).with_expiration(expiration),
                        ),
                        Err(err) => {
                            tracing::warn!(key = %key, error = %err, "Not caching unencodable value")
                        }
                    },
                    Err(err) if self.config.cache_nil && (err.is_no_such_entity() || err.is_cache_miss()) => {
                        items.push(CacheItem::nil(self.backend_key(key)).with_expiration(expiration));
                    }
                    Err(_) => {}
                }
            }
            if let Err(err) = self.set_items(items).await {
                tracing::warn!(ctx = ctx.label(), error = %err, "Cache write failed after generating values");
            }
        }

        for (index, _, result) in generated {
            slots[index] = Some(result);
        }
        slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(CacheError::Miss.into())))
            .collect()
    }

    /// Memoize `key` under the current epoch of `super_key`.
    ///
    /// Deleting `super_key` starts a new epoch, which invalidates every key
    /// memoized under it at once.
    pub async fn memoize_super<T, F, Fut>(
        &self,
        ctx: &Context,
        super_key: &str,
        key: &str,
        ttl: Option<Duration>,
        generator: F,
    ) -> KeelResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = KeelResult<T>>,
    {
        if !self.is_active(ctx) {
            return generator().await;
        }
        match self.epoch(super_key).await {
            Ok(epoch) => {
                self.memoize(ctx, &format!("{key}@{epoch}"), ttl, generator)
                    .await
            }
            Err(err) => {
                tracing::warn!(ctx = ctx.label(), super_key, error = %err, "Super key unavailable, bypassing cache");
                generator().await
            }
        }
    }

    /// Get cache statistics.
    pub async fn stats(&self) -> KeelResult<CacheStats> {
        self.backend.stats().await
    }

    async fn epoch(&self, super_key: &str) -> KeelResult<String> {
        let backend = &self.backend;
        let backend_key = self.backend_key(super_key);
        let key_ref = backend_key.as_str();

        if let Some(item) =
            with_backoff(&self.config.retry, "get", move || backend.get(key_ref)).await?
        {
            if !item.is_nil() {
                return epoch_from(item);
            }
        }

        let candidate = Uuid::now_v7().simple().to_string();
        let item = CacheItem::new(backend_key.clone(), candidate.clone().into_bytes());
        let added = with_backoff(&self.config.retry, "add", move || backend.add(item.clone())).await?;
        if added {
            return Ok(candidate);
        }

        // Another writer started the epoch first.
        match with_backoff(&self.config.retry, "get", move || backend.get(key_ref)).await? {
            Some(item) if !item.is_nil() => epoch_from(item),
            _ => Ok(candidate),
        }
    }

    async fn set_items(&self, items: Vec<CacheItem>) -> KeelResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let backend = &self.backend;
        with_backoff(&self.config.retry, "set_multi", move || {
            backend.set_multi(items.clone())
        })
        .await
    }
}

impl fmt::Debug for ReadThroughCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadThroughCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

async fn delete_now(backend: &dyn CacheBackend, retry: &RetryConfig, keys: &[String]) -> KeelResult<()> {
    with_backoff(retry, "delete", move || async move {
        let results = backend.delete_multi(keys).await?;
        match results
            .into_iter()
            .filter_map(Result::err)
            .find(|err| !err.is_cache_miss())
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    })
    .await
}

fn encode<T: Serialize>(value: &T) -> KeelResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| {
        CacheError::Serialization {
            reason: e.to_string(),
        }
        .into()
    })
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> KeelResult<T> {
    serde_json::from_slice(bytes).map_err(|e| {
        CacheError::Serialization {
            reason: e.to_string(),
        }
        .into()
    })
}

fn epoch_from(item: CacheItem) -> KeelResult<String> {
    String::from_utf8(item.value).map_err(|e| {
        CacheError::Serialization {
            reason: format!("super key epoch is not UTF-8: {e}"),
        }
        .into()
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// =============================================================================
// TESTS
// =============================================================================
