//! keel Storage - Cached Persistence Engine
//!
//! Defines the store and cache abstractions, their in-memory
//! implementations, lifecycle hooks, finders, and [`CachedStore`], which ties
//! them together.

pub mod cache;
pub mod context;
pub mod entity;
pub mod finder;
pub mod hooks;
pub mod memory;
pub mod persistence;
pub mod store;

pub use cache::{
    backend_key, entity_cache_key, finder_cache_key, with_backoff, CacheBackend, CacheItem,
    CacheStats, CasOutcome, ItemFlags, Lookup, MemoryCacheBackend, ReadThroughCache,
};
pub use context::{Context, DeferredAction};
pub use entity::{apply_update, field_names, from_properties, to_properties, Decoded, Entity};
pub use finder::{AncestorFinder, Finder, FinderRegistry, FinderSpec};
pub use hooks::{run_hook, Hook, Lifecycle, LifecycleObserver, NoopObserver};
pub use memory::{MemoryStore, StoreCallCounts};
pub use persistence::CachedStore;
pub use store::{Properties, Query, Store, TransactionBody};

// Re-export core types so most callers need only this crate.
pub use keel_core::{
    CacheConfig, CacheError, HookError, Identifier, KeelError, KeelResult, MultiError,
    RetryConfig, StorageError,
};
