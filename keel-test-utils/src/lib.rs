//! keel Test Utilities
//!
//! Shared test infrastructure for the keel workspace:
//! - Fixture entities modelled on a small multi-tenant schema
//! - An in-memory engine harness
//! - A lifecycle observer that records every hook
//! - Proptest generators
//! - Custom assertions

use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// Re-export the pieces almost every test touches
pub use keel_core::{
    CacheConfig, CacheError, HookError, Identifier, KeelError, KeelResult, MultiError,
    RetryConfig, StorageError,
};
pub use keel_storage::{
    CachedStore, Context, Entity, FinderRegistry, Hook, Lifecycle, LifecycleObserver,
    MemoryCacheBackend, MemoryStore, ReadThroughCache,
};

/// Install a fmt subscriber honouring `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// FIXTURE ENTITIES
// ============================================================================

/// Tenant root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    #[serde(default)]
    pub id: Identifier,
    pub name: String,
    pub plan: String,
}

impl Lifecycle for Account {}

impl Entity for Account {
    const KIND: &'static str = "Account";

    fn id(&self) -> &Identifier {
        &self.id
    }

    fn set_id(&mut self, id: Identifier) {
        self.id = id;
    }
}

/// A zone of speakers inside an account. Refuses to save without a name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SoundZone {
    #[serde(default)]
    pub id: Identifier,
    pub name: String,
    pub volume: u8,
    /// Set by `after_load`; never stored.
    #[serde(skip)]
    pub loaded: bool,
}

#[async_trait]
impl Lifecycle for SoundZone {
    async fn before_save(&mut self, _ctx: &Context, _previous: Option<&Self>) -> KeelResult<()> {
        if self.name.trim().is_empty() {
            return Err(HookError::Rejected {
                hook: Hook::BeforeSave.to_string(),
                reason: "sound zone needs a name".to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn after_load(&mut self, _ctx: &Context) -> KeelResult<()> {
        self.loaded = true;
        Ok(())
    }
}

impl Entity for SoundZone {
    const KIND: &'static str = "SoundZone";

    fn id(&self) -> &Identifier {
        &self.id
    }

    fn set_id(&mut self, id: Identifier) {
        self.id = id;
    }
}

/// A playback schedule, stored under its sound zone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub id: Identifier,
    pub name: String,
    pub day: String,
    pub enabled: bool,
    /// How many times this copy went through an update.
    #[serde(default)]
    pub revision: u32,
}

#[async_trait]
impl Lifecycle for Schedule {
    async fn before_update(&mut self, _ctx: &Context, previous: &Self) -> KeelResult<()> {
        self.revision = previous.revision + 1;
        Ok(())
    }
}

impl Entity for Schedule {
    const KIND: &'static str = "Schedule";

    fn id(&self) -> &Identifier {
        &self.id
    }

    fn set_id(&mut self, id: Identifier) {
        self.id = id;
    }
}

/// Minimal two-field entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Person {
    #[serde(default)]
    pub id: Identifier,
    pub name: String,
    pub age: u32,
}

impl Lifecycle for Person {}

impl Entity for Person {
    const KIND: &'static str = "Person";

    fn id(&self) -> &Identifier {
        &self.id
    }

    fn set_id(&mut self, id: Identifier) {
        self.id = id;
    }
}

// ============================================================================
// RECORDING OBSERVER
// ============================================================================

/// Observer that records `(hook, kind)` for every hook it sees, and can be
/// told to reject one hook.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<(Hook, String)>>,
    reject: Mutex<Option<Hook>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail every later `hook` with `HookError::Rejected`.
    pub fn reject(&self, hook: Hook) {
        if let Ok(mut reject) = self.reject.lock() {
            *reject = Some(hook);
        }
    }

    pub fn events(&self) -> Vec<(Hook, String)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Hooks seen for `kind`, in order.
    pub fn hooks_for(&self, kind: &str) -> Vec<Hook> {
        self.events()
            .into_iter()
            .filter(|(_, k)| k == kind)
            .map(|(hook, _)| hook)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

#[async_trait]
impl LifecycleObserver for RecordingObserver {
    async fn on_hook(&self, _ctx: &Context, hook: Hook, kind: &str, _id: &Identifier) -> KeelResult<()> {
        if let Ok(mut events) = self.events.lock() {
            events.push((hook, kind.to_string()));
        }
        let rejected = self.reject.lock().map(|r| *r == Some(hook)).unwrap_or(false);
        if rejected {
            return Err(HookError::Rejected {
                hook: hook.to_string(),
                reason: "rejected by observer".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

// ============================================================================
// ENGINE HARNESS
// ============================================================================

/// A [`CachedStore`] over fresh in-memory backends, with handles to both so
/// tests can inspect what reached the store and the cache.
#[derive(Debug, Clone)]
pub struct TestEngine {
    pub store: Arc<MemoryStore>,
    pub backend: Arc<MemoryCacheBackend>,
    pub engine: CachedStore,
}

impl TestEngine {
    pub fn new(config: CacheConfig, finders: FinderRegistry) -> Self {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(MemoryCacheBackend::new());
        let engine = CachedStore::new(
            store.clone(),
            ReadThroughCache::new(backend.clone(), config),
            Arc::new(finders),
        );
        Self {
            store,
            backend,
            engine,
        }
    }

    /// Default cache config, no finders.
    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default(), FinderRegistry::new())
    }

    /// Whether the backend holds a live entry for the raw (unhashed) key.
    pub fn is_cached(&self, raw_key: &str) -> bool {
        self.backend
            .contains(&self.engine.cache().backend_key(raw_key))
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keel types.

    use super::*;
    use proptest::prelude::*;

    /// A kind name: a capitalised ASCII word.
    pub fn arb_kind() -> impl Strategy<Value = String> {
        "[A-Z][a-zA-Z]{0,11}"
    }

    /// One complete identifier level under an optional parent.
    fn arb_level(parent: Option<Identifier>) -> impl Strategy<Value = Identifier> {
        let named = {
            let parent = parent.clone();
            (arb_kind(), "[a-z0-9_./-]{1,16}")
                .prop_map(move |(kind, name)| Identifier::with_name(kind, name, parent.clone()))
        };
        let numbered = (arb_kind(), 1i64..i64::MAX)
            .prop_map(move |(kind, id)| Identifier::with_int(kind, id, parent.clone()));
        prop_oneof![named, numbered]
    }

    /// A complete identifier with up to four levels.
    pub fn arb_identifier() -> impl Strategy<Value = Identifier> {
        arb_level(None).prop_recursive(3, 4, 1, |inner| {
            inner.prop_flat_map(|parent| arb_level(Some(parent)))
        })
    }

    /// Either a complete identifier, an incomplete one, or zero.
    pub fn arb_any_identifier() -> impl Strategy<Value = Identifier> {
        prop_oneof![
            6 => arb_identifier(),
            2 => (arb_kind(), proptest::option::of(arb_identifier()))
                .prop_map(|(kind, parent)| Identifier::incomplete(kind, parent)),
            1 => Just(Identifier::default()),
        ]
    }

    pub fn arb_person() -> impl Strategy<Value = Person> {
        ("[a-z ]{1,12}", 0u32..120).prop_map(|(name, age)| Person {
            id: Identifier::default(),
            name,
            age,
        })
    }

    pub fn arb_retry_config() -> impl Strategy<Value = RetryConfig> {
        (1u32..8, 1u64..50, 1u64..20, 1.0f32..4.0).prop_map(
            |(max_attempts, initial_ms, factor, multiplier)| RetryConfig {
                max_attempts,
                initial_backoff: std::time::Duration::from_millis(initial_ms),
                max_backoff: std::time::Duration::from_millis(initial_ms * factor),
                backoff_multiplier: multiplier,
            },
        )
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for keel results.

    use super::*;

    #[track_caller]
    pub fn assert_no_such_entity<T: std::fmt::Debug>(result: &KeelResult<T>) {
        match result {
            Err(err) if err.is_no_such_entity() => {}
            other => panic!("Expected NoSuchEntity, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_hook_rejected<T: std::fmt::Debug>(result: &KeelResult<T>) {
        match result {
            Err(KeelError::Hook(HookError::Rejected { .. })) => {}
            other => panic!("Expected a rejected hook, got: {:?}", other),
        }
    }

    /// Assert a batch failed exactly at `positions`.
    #[track_caller]
    pub fn assert_failed_at<T: std::fmt::Debug>(result: &KeelResult<T>, positions: &[usize]) {
        match result {
            Err(KeelError::Multi(multi)) => {
                let failed: Vec<usize> = multi.failures().map(|(i, _)| i).collect();
                assert_eq!(failed, positions, "Wrong failed positions in {multi}");
            }
            other => panic!("Expected a multi error, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
