//! Store trait: the source of truth behind the cache.
//!
//! The store persists property maps keyed by [`Identifier`]. It knows nothing
//! about caching, hooks or entity types; [`crate::CachedStore`] layers those on
//! top.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use keel_core::{Identifier, KeelResult};
use serde_json::{Map, Value};

/// Field name → value map persisted for one entity.
pub type Properties = Map<String, Value>;

/// Work executed inside [`Store::run_in_transaction`].
pub type TransactionBody<'a> = Box<dyn FnOnce() -> BoxFuture<'a, KeelResult<()>> + Send + 'a>;

/// Equality/ancestor query over one kind.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    kind: String,
    ancestor: Option<Identifier>,
    filters: Vec<(String, Value)>,
    limit: Option<usize>,
}

impl Query {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    /// Restrict results to descendants of `ancestor` (inclusive).
    pub fn ancestor(mut self, ancestor: Identifier) -> Self {
        self.ancestor = Some(ancestor);
        self
    }

    /// Require `field == value`.
    pub fn filter(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filters.push((field.into(), value));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn ancestor_key(&self) -> Option<&Identifier> {
        self.ancestor.as_ref()
    }

    pub fn filters(&self) -> &[(String, Value)] {
        &self.filters
    }

    pub fn max_results(&self) -> Option<usize> {
        self.limit
    }

    /// Whether a stored record satisfies this query. A missing field never matches.
    pub fn matches(&self, key: &Identifier, properties: &Properties) -> bool {
        if key.kind() != self.kind {
            return false;
        }
        if let Some(ancestor) = &self.ancestor {
            if !key.has_ancestor(ancestor) {
                return false;
            }
        }
        self.filters
            .iter()
            .all(|(field, value)| properties.get(field) == Some(value))
    }
}

/// Storage trait for keel entities.
///
/// Batch methods report per-entry outcomes positionally. The outer `Result`
/// fails only when the whole call failed.
#[async_trait]
pub trait Store: Send + Sync {
    /// Get one record. A missing record is `StorageError::NoSuchEntity`.
    async fn get(&self, key: &Identifier) -> KeelResult<Properties>;

    /// Get several records in one round trip.
    async fn get_multi(&self, keys: &[Identifier]) -> KeelResult<Vec<KeelResult<Properties>>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.get(key).await);
        }
        Ok(results)
    }

    /// Write one record, returning its final key. Incomplete keys get an id assigned.
    async fn put(&self, key: &Identifier, properties: Properties) -> KeelResult<Identifier>;

    /// Write several records, returning their final keys in input order.
    async fn put_multi(&self, entries: Vec<(Identifier, Properties)>) -> KeelResult<Vec<Identifier>> {
        let mut keys = Vec::with_capacity(entries.len());
        for (key, properties) in entries {
            keys.push(self.put(&key, properties).await?);
        }
        Ok(keys)
    }

    /// Delete one record. Deleting a missing record succeeds.
    async fn delete(&self, key: &Identifier) -> KeelResult<()>;

    async fn delete_multi(&self, keys: &[Identifier]) -> KeelResult<()> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }

    /// Run a query, returning `(key, record)` pairs.
    async fn query(&self, query: &Query) -> KeelResult<Vec<(Identifier, Properties)>>;

    /// Run `body` atomically. If it fails, none of its writes are kept.
    async fn run_in_transaction<'a>(
        &'a self,
        cross_group: bool,
        body: TransactionBody<'a>,
    ) -> KeelResult<()>;
}
