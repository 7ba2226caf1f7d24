//! Persistence engine.
//!
//! [`CachedStore`] is the entry point applications use. It combines a
//! [`Store`], a [`ReadThroughCache`] and a [`FinderRegistry`]:
//!
//! - reads go through the cache and fall back to the store
//! - writes persist to the store first, then delete every cache key that
//!   describes the old or the new state of the entity: its own key plus the
//!   result sets of every ancestor finder registered for its kind, under
//!   every ancestor of its identifier
//! - lifecycle hooks run around every read and write
//!
//! Cache failures after a store write are logged and swallowed: the write
//! is committed and cannot be rolled back.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use keel_core::{
    CacheError, FieldScopes, Identifier, KeelError, KeelResult, MultiError, StorageError,
};
use serde_json::Value;

use crate::cache::keys::entity_cache_key;
use crate::cache::read_through::{Lookup, ReadThroughCache};
use crate::context::Context;
use crate::entity::{self, Entity};
use crate::finder::FinderRegistry;
use crate::hooks::{self, Hook};
use crate::store::{Properties, Query, Store};

/// Cached, hook-aware access to a [`Store`].
#[derive(Clone)]
pub struct CachedStore {
    /// The source of truth.
    store: Arc<dyn Store>,
    /// The read-through cache.
    cache: ReadThroughCache,
    /// Ancestor finders whose result sets writes must invalidate.
    finders: Arc<FinderRegistry>,
}

impl CachedStore {
    pub fn new(store: Arc<dyn Store>, cache: ReadThroughCache, finders: Arc<FinderRegistry>) -> Self {
        Self {
            store,
            cache,
            finders,
        }
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn cache(&self) -> &ReadThroughCache {
        &self.cache
    }

    pub fn finders(&self) -> &FinderRegistry {
        &self.finders
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Load one entity, running `AfterLoad`.
    pub async fn get<T: Entity>(&self, ctx: &Context, id: &Identifier) -> KeelResult<T> {
        let mut entity = self.fetch::<T>(ctx, id).await?;
        hooks::run_hook(ctx, &mut entity, Hook::AfterLoad, None).await?;
        Ok(entity)
    }

    /// Reload `entity` in place from its own id.
    pub async fn load<T: Entity>(&self, ctx: &Context, entity: &mut T) -> KeelResult<()> {
        let id = entity.id().clone();
        *entity = self.get(ctx, &id).await?;
        Ok(())
    }

    /// Load several entities. Cache hits are served in one backend call and
    /// the rest in one store call.
    ///
    /// Fails with a [`MultiError`] aligned with `ids` if any entry failed.
    pub async fn get_multi<T: Entity>(&self, ctx: &Context, ids: &[Identifier]) -> KeelResult<Vec<T>> {
        for id in ids {
            check_loadable::<T>(id)?;
        }
        let keys: Vec<String> = ids.iter().map(entity_cache_key).collect();
        let lookups = match self.cache.get_multi::<T>(ctx, &keys).await {
            Ok(lookups) => lookups,
            Err(err) => {
                tracing::warn!(ctx = ctx.label(), kind = T::KIND, error = %err, "Cache read failed, using store");
                keys.iter().map(|_| Lookup::Miss).collect()
            }
        };

        let mut slots: Vec<Option<KeelResult<T>>> = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for (index, lookup) in lookups.into_iter().enumerate() {
            match lookup {
                Lookup::Hit(mut entity) => {
                    entity.set_id(ids[index].clone());
                    slots.push(Some(Ok(entity)));
                }
                Lookup::Nil => slots.push(Some(Err(KeelError::no_such_entity(
                    T::KIND,
                    ids[index].clone(),
                )))),
                Lookup::Miss => {
                    slots.push(None);
                    missing.push(index);
                }
            }
        }

        if !missing.is_empty() {
            let missing_ids: Vec<Identifier> = missing.iter().map(|&i| ids[i].clone()).collect();
            let fetched = self.store.get_multi(&missing_ids).await?;
            let mut to_cache = Vec::new();
            for (&index, outcome) in missing.iter().zip(fetched) {
                let result = outcome.and_then(|properties| decode::<T>(&ids[index], properties));
                if let Ok(entity) = &result {
                    to_cache.push((keys[index].clone(), entity.clone()));
                }
                slots[index] = Some(result);
            }
            if let Err(err) = self.cache.put_multi(ctx, &to_cache, None).await {
                tracing::warn!(ctx = ctx.label(), kind = T::KIND, error = %err, "Failed to populate cache");
            }
        }

        let mut results: Vec<KeelResult<T>> = slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(CacheError::Miss.into())))
            .collect();
        for result in results.iter_mut() {
            if let Ok(entity) = result {
                if let Err(err) = hooks::run_hook(ctx, entity, Hook::AfterLoad, None).await {
                    *result = Err(err);
                }
            }
        }

        let failures = MultiError::from_results(&results);
        if failures.has_failures() {
            return Err(KeelError::Multi(failures));
        }
        Ok(results.into_iter().flatten().collect())
    }

    /// Run a query, running `AfterLoad` on every result. Not cached.
    pub async fn get_query<T: Entity>(&self, ctx: &Context, query: &Query) -> KeelResult<Vec<T>> {
        let entities = self.fetch_query::<T>(query).await?;
        self.finish_load(ctx, entities).await
    }

    /// Every entity of `T`, optionally under `ancestor`.
    pub async fn get_all<T: Entity>(&self, ctx: &Context, ancestor: Option<&Identifier>) -> KeelResult<Vec<T>> {
        self.get_query(ctx, &kind_query::<T>(ancestor)).await
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Create or update `entity`.
    ///
    /// A zero or incomplete id creates; the store assigns the id, which is
    /// written back into `entity`. A complete id updates when a stored version
    /// exists and creates otherwise.
    pub async fn put<T: Entity>(&self, ctx: &Context, entity: &mut T) -> KeelResult<()> {
        let id = entity.storage_id();
        check_kind::<T>(&id)?;
        entity.set_id(id.clone());

        let previous = self.previous_version::<T>(ctx, &id).await?;
        let mut stale = BTreeSet::new();
        if let Some(previous) = &previous {
            stale.extend(self.invalidation_keys::<T>(&id, &entity::to_properties(previous)?));
        }

        hooks::before_put(ctx, entity, previous.as_ref()).await?;
        let properties = entity::to_properties(entity)?;
        let final_id = self.store.put(&id, properties.clone()).await?;
        entity.set_id(final_id.clone());
        stale.extend(self.invalidation_keys::<T>(&final_id, &properties));
        self.invalidate(ctx, stale).await;

        hooks::after_put(ctx, entity, previous.as_ref()).await
    }

    /// Batch form of [`CachedStore::put`]: one store read for the previous
    /// versions, one store write, one invalidation pass.
    pub async fn put_multi<T: Entity>(&self, ctx: &Context, entities: &mut [T]) -> KeelResult<()> {
        if entities.is_empty() {
            return Ok(());
        }
        let mut ids = Vec::with_capacity(entities.len());
        for entity in entities.iter_mut() {
            let id = entity.storage_id();
            check_kind::<T>(&id)?;
            entity.set_id(id.clone());
            ids.push(id);
        }

        let existing: Vec<usize> = (0..ids.len()).filter(|&i| !ids[i].is_incomplete()).collect();
        let mut previous: Vec<Option<T>> = vec![None; ids.len()];
        if !existing.is_empty() {
            let existing_ids: Vec<Identifier> = existing.iter().map(|&i| ids[i].clone()).collect();
            let loaded = self.store.get_multi(&existing_ids).await?;
            for (&index, outcome) in existing.iter().zip(loaded) {
                match outcome {
                    Ok(properties) => previous[index] = Some(decode::<T>(&ids[index], properties)?),
                    Err(err) if err.is_no_such_entity() => {}
                    Err(err) => return Err(err),
                }
            }
        }

        let mut stale = BTreeSet::new();
        for (id, prev) in ids.iter().zip(&previous) {
            if let Some(prev) = prev {
                stale.extend(self.invalidation_keys::<T>(id, &entity::to_properties(prev)?));
            }
        }

        for (entity, prev) in entities.iter_mut().zip(&previous) {
            hooks::before_put(ctx, entity, prev.as_ref()).await?;
        }
        let batch = entities
            .iter()
            .zip(&ids)
            .map(|(entity, id)| Ok((id.clone(), entity::to_properties(entity)?)))
            .collect::<KeelResult<Vec<_>>>()?;
        let final_ids = self.store.put_multi(batch.clone()).await?;
        if final_ids.len() != entities.len() {
            return Err(StorageError::InsertFailed {
                kind: T::KIND.to_string(),
                reason: format!(
                    "store returned {} keys for {} entities",
                    final_ids.len(),
                    entities.len()
                ),
            }
            .into());
        }

        for ((entity, final_id), (_, properties)) in entities.iter_mut().zip(&final_ids).zip(&batch) {
            entity.set_id(final_id.clone());
            stale.extend(self.invalidation_keys::<T>(final_id, properties));
        }
        self.invalidate(ctx, stale).await;

        for (entity, prev) in entities.iter_mut().zip(&previous) {
            hooks::after_put(ctx, entity, prev.as_ref()).await?;
        }
        Ok(())
    }

    /// Apply a JSON patch to the stored entity under a field policy and save
    /// it. Returns the saved entity.
    pub async fn update_fields<T: Entity>(
        &self,
        ctx: &Context,
        id: &Identifier,
        patch: &Value,
        scope: &str,
        policy: &FieldScopes,
    ) -> KeelResult<T> {
        let current = self.get::<T>(ctx, id).await?;
        let mut updated = entity::apply_update(&current, patch, scope, policy)?;
        self.put(ctx, &mut updated).await?;
        Ok(updated)
    }

    /// Delete one entity. Deleting something that does not exist succeeds
    /// without running hooks.
    pub async fn delete<T: Entity>(&self, ctx: &Context, id: &Identifier) -> KeelResult<()> {
        if id.is_zero() || id.is_incomplete() {
            return Ok(());
        }
        check_kind::<T>(id)?;
        let Some(mut current) = self.previous_version::<T>(ctx, id).await? else {
            return Ok(());
        };
        let properties = entity::to_properties(&current)?;

        hooks::run_hook(ctx, &mut current, Hook::BeforeDelete, None).await?;
        self.store.delete(id).await?;
        self.invalidate(ctx, self.invalidation_keys::<T>(id, &properties))
            .await;
        hooks::run_hook(ctx, &mut current, Hook::AfterDelete, None).await
    }

    /// Delete several entities in one store call. Missing ones are skipped.
    pub async fn delete_multi<T: Entity>(&self, ctx: &Context, ids: &[Identifier]) -> KeelResult<()> {
        let targets: Vec<Identifier> = ids
            .iter()
            .filter(|id| !id.is_zero() && !id.is_incomplete())
            .cloned()
            .collect();
        for id in &targets {
            check_kind::<T>(id)?;
        }
        if targets.is_empty() {
            return Ok(());
        }

        let loaded = self.store.get_multi(&targets).await?;
        let mut found = Vec::new();
        for (id, outcome) in targets.into_iter().zip(loaded) {
            match outcome {
                Ok(properties) => {
                    let entity = decode::<T>(&id, properties)?;
                    found.push((id, entity));
                }
                Err(err) if err.is_no_such_entity() => {}
                Err(err) => return Err(err),
            }
        }
        self.delete_loaded(ctx, found).await.map(|_| ())
    }

    /// Delete every entity a query returns, returning how many were deleted.
    pub async fn del_query<T: Entity>(&self, ctx: &Context, query: &Query) -> KeelResult<usize> {
        let entities = self.fetch_query::<T>(query).await?;
        let found = entities
            .into_iter()
            .map(|entity| (entity.id().clone(), entity))
            .collect();
        self.delete_loaded(ctx, found).await
    }

    /// Delete every entity of `T`, optionally under `ancestor`.
    pub async fn del_all<T: Entity>(&self, ctx: &Context, ancestor: Option<&Identifier>) -> KeelResult<usize> {
        self.del_query::<T>(ctx, &kind_query::<T>(ancestor)).await
    }

    // ========================================================================
    // TRANSACTIONS
    // ========================================================================

    /// Run `body` in a store transaction.
    ///
    /// `body` receives a transactional context: reads through it bypass the
    /// cache and cache deletions are queued until commit. If `ctx` is already
    /// transactional the body joins that transaction. On commit the queued
    /// deletions run once, in order; on abort they are dropped.
    pub async fn run_in_transaction<F, Fut, R>(&self, ctx: &Context, cross_group: bool, body: F) -> KeelResult<R>
    where
        F: FnOnce(Context) -> Fut + Send,
        Fut: Future<Output = KeelResult<R>> + Send,
        R: Send,
    {
        if ctx.in_transaction() {
            return body(ctx.clone()).await;
        }

        let (txn_ctx, state) = ctx.begin_transaction();
        let mut output = None;
        let slot = &mut output;
        let result = self
            .store
            .run_in_transaction(
                cross_group,
                Box::new(move || {
                    async move {
                        *slot = Some(body(txn_ctx).await?);
                        Ok::<(), KeelError>(())
                    }
                    .boxed()
                }),
            )
            .await;

        match result {
            Ok(()) => {
                state.run_deferred(ctx.label()).await;
                output.ok_or_else(|| {
                    StorageError::TransactionFailed {
                        reason: "transaction body did not run".to_string(),
                    }
                    .into()
                })
            }
            Err(err) => {
                let dropped = state.discard();
                tracing::debug!(ctx = ctx.label(), dropped, error = %err, "Transaction aborted, dropping deferred cache work");
                Err(err)
            }
        }
    }

    // ========================================================================
    // INVALIDATION
    // ========================================================================

    /// Every raw cache key that can hold a copy of, or a result set
    /// containing, the entity at `id` with `properties`.
    pub fn invalidation_keys<T: Entity>(&self, id: &Identifier, properties: &Properties) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        keys.insert(entity_cache_key(id));
        keys.extend(self.finders.invalidation_keys(T::KIND, id, properties));
        keys
    }

    async fn invalidate(&self, ctx: &Context, keys: BTreeSet<String>) {
        let keys: Vec<String> = keys.into_iter().collect();
        if let Err(err) = self.cache.delete(ctx, &keys).await {
            tracing::error!(
                ctx = ctx.label(),
                count = keys.len(),
                error = %err,
                "Cache invalidation failed after store write"
            );
        }
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    /// Memoized load without hooks.
    async fn fetch<T: Entity>(&self, ctx: &Context, id: &Identifier) -> KeelResult<T> {
        check_loadable::<T>(id)?;
        let key = entity_cache_key(id);
        let result = self
            .cache
            .memoize(ctx, &key, None, || self.load_uncached::<T>(id))
            .await;
        match result {
            Ok(mut entity) => {
                entity.set_id(id.clone());
                Ok(entity)
            }
            Err(err) if err.is_cache_miss() => Err(KeelError::no_such_entity(T::KIND, id.clone())),
            Err(err) => Err(err),
        }
    }

    async fn load_uncached<T: Entity>(&self, id: &Identifier) -> KeelResult<T> {
        let properties = self.store.get(id).await?;
        decode::<T>(id, properties)
    }

    async fn previous_version<T: Entity>(&self, ctx: &Context, id: &Identifier) -> KeelResult<Option<T>> {
        if id.is_incomplete() {
            return Ok(None);
        }
        match self.fetch::<T>(ctx, id).await {
            Ok(previous) => Ok(Some(previous)),
            Err(err) if err.is_no_such_entity() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Query the store and decode, without hooks or caching.
    pub(crate) async fn fetch_query<T: Entity>(&self, query: &Query) -> KeelResult<Vec<T>> {
        if query.kind() != T::KIND {
            return Err(StorageError::KindMismatch {
                expected: T::KIND.to_string(),
                found: query.kind().to_string(),
            }
            .into());
        }
        self.store
            .query(query)
            .await?
            .into_iter()
            .map(|(id, properties)| decode::<T>(&id, properties))
            .collect()
    }

    /// Run `AfterLoad` on each entity.
    pub(crate) async fn finish_load<T: Entity>(&self, ctx: &Context, mut entities: Vec<T>) -> KeelResult<Vec<T>> {
        for entity in entities.iter_mut() {
            hooks::run_hook(ctx, entity, Hook::AfterLoad, None).await?;
        }
        Ok(entities)
    }

    async fn delete_loaded<T: Entity>(&self, ctx: &Context, mut found: Vec<(Identifier, T)>) -> KeelResult<usize> {
        if found.is_empty() {
            return Ok(0);
        }
        let mut stale = BTreeSet::new();
        for (id, entity) in &found {
            stale.extend(self.invalidation_keys::<T>(id, &entity::to_properties(entity)?));
        }

        for (_, entity) in found.iter_mut() {
            hooks::run_hook(ctx, entity, Hook::BeforeDelete, None).await?;
        }
        let ids: Vec<Identifier> = found.iter().map(|(id, _)| id.clone()).collect();
        self.store.delete_multi(&ids).await?;
        self.invalidate(ctx, stale).await;

        for (_, entity) in found.iter_mut() {
            hooks::run_hook(ctx, entity, Hook::AfterDelete, None).await?;
        }
        Ok(found.len())
    }
}

impl fmt::Debug for CachedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedStore")
            .field("cache", &self.cache)
            .field("finders", &self.finders)
            .finish_non_exhaustive()
    }
}

fn check_kind<T: Entity>(id: &Identifier) -> KeelResult<()> {
    if id.kind() != T::KIND {
        return Err(StorageError::KindMismatch {
            expected: T::KIND.to_string(),
            found: id.kind().to_string(),
        }
        .into());
    }
    Ok(())
}

fn check_loadable<T: Entity>(id: &Identifier) -> KeelResult<()> {
    if id.is_zero() || id.is_incomplete() {
        return Err(StorageError::IncompleteKey {
            kind: T::KIND.to_string(),
        }
        .into());
    }
    check_kind::<T>(id)
}

fn kind_query<T: Entity>(ancestor: Option<&Identifier>) -> Query {
    match ancestor {
        Some(ancestor) => Query::new(T::KIND).ancestor(ancestor.clone()),
        None => Query::new(T::KIND),
    }
}

/// Decode a stored record, logging fields the type does not know.
fn decode<T: Entity>(id: &Identifier, properties: Properties) -> KeelResult<T> {
    let decoded = entity::from_properties::<T>(id, properties)?;
    if let Some(mismatch) = decoded.mismatch() {
        tracing::warn!(kind = T::KIND, id = %id.path(), error = %mismatch, "Ignoring stored fields unknown to the entity type");
    }
    Ok(decoded.entity)
}

// =============================================================================
// TESTS
// =============================================================================
