//! Cache layer.
//!
//! [`CacheBackend`] is the byte-level contract a memcache-like service
//! fulfils; [`MemoryCacheBackend`] is the in-process implementation.
//! [`ReadThroughCache`] is what the rest of keel talks to: typed values,
//! namespaced keys, retries, negative caching and transaction-aware deletes.
//!
//! # Consistency
//!
//! The cache is never written ahead of the store. Writers persist first and
//! then delete every key that could describe the old or new state, so a
//! reader that misses always repopulates from committed data.

pub mod backend;
pub mod keys;
pub mod memory;
pub mod read_through;
pub mod retry;

pub use backend::{CacheBackend, CacheItem, CacheStats, CasOutcome, ItemFlags};
pub use keys::{backend_key, entity_cache_key, finder_cache_key};
pub use memory::MemoryCacheBackend;
pub use read_through::{Lookup, ReadThroughCache};
pub use retry::with_backoff;
