//! Secondary-index finders.
//!
//! A finder is an equality query over a fixed list of fields of one kind.
//! An [`AncestorFinder`] also scopes the query to an ancestor and caches its
//! result set; its registration in a [`FinderRegistry`] is what lets writes
//! invalidate those result sets. A plain [`Finder`] is never cached.
//!
//! Finders are registered once at startup. Naming a field the entity does
//! not have, or registering the same finder twice, is a programming error
//! and panics.

use std::collections::HashMap;
use std::marker::PhantomData;

use keel_core::{Identifier, KeelResult, ValidationError};
use serde_json::Value;

use crate::cache::keys::finder_cache_key;
use crate::context::Context;
use crate::entity::{self, Entity};
use crate::persistence::CachedStore;
use crate::store::{Properties, Query};

/// Kind plus ordered field list of one finder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FinderSpec {
    kind: &'static str,
    fields: Vec<String>,
}

impl FinderSpec {
    /// Validate `fields` against the fields `T` declares, falling back to
    /// the serialized form of `sample` for types serde cannot list.
    fn for_sample<T: Entity>(sample: &T, fields: &[&str]) -> Self {
        if fields.is_empty() {
            panic!("finder on {} needs at least one field", T::KIND);
        }
        let declared = entity::field_names::<T>().unwrap_or(&[]);
        let properties = match entity::to_properties(sample) {
            Ok(properties) => properties,
            Err(err) => panic!("cannot inspect fields of {}: {err}", T::KIND),
        };
        for field in fields {
            if !declared.iter().any(|d| d == field) && !properties.contains_key(*field) {
                panic!("finder field {field:?} does not exist on {}", T::KIND);
            }
        }
        Self {
            kind: T::KIND,
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Values of the finder fields in `properties`; a missing field is `null`.
    pub fn values(&self, properties: &Properties) -> Vec<Value> {
        self.fields
            .iter()
            .map(|f| properties.get(f).cloned().unwrap_or(Value::Null))
            .collect()
    }

    pub fn cache_key(&self, ancestor: &Identifier, values: &[Value]) -> String {
        finder_cache_key(self.kind, &self.fields, ancestor, values)
    }

    /// Result-set keys that a record at `id` with `properties` can appear in:
    /// one per ancestor of `id`, itself included.
    pub fn invalidation_keys(&self, id: &Identifier, properties: &Properties) -> Vec<String> {
        let values = self.values(properties);
        id.ancestors().map(|a| self.cache_key(a, &values)).collect()
    }

    fn query(&self, values: &[Value]) -> KeelResult<Query> {
        if values.len() != self.fields.len() {
            return Err(ValidationError::ArityMismatch {
                kind: self.kind.to_string(),
                expected: self.fields.len(),
                got: values.len(),
            }
            .into());
        }
        Ok(self
            .fields
            .iter()
            .zip(values)
            .fold(Query::new(self.kind), |q, (field, value)| {
                q.filter(field.clone(), value.clone())
            }))
    }
}

/// Registered ancestor finders, grouped by kind.
///
/// Built at startup, then shared read-only with a [`CachedStore`].
#[derive(Debug, Default)]
pub struct FinderRegistry {
    finders: HashMap<&'static str, Vec<FinderSpec>>,
}

impl FinderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cached finder on `fields` of `T`.
    ///
    /// `sample` is any value of `T`; it is only used to check that the
    /// fields exist.
    ///
    /// # Panics
    ///
    /// If a field does not exist on `T`, `fields` is empty, or the same
    /// finder is already registered.
    pub fn register_ancestor_finder<T: Entity>(
        &mut self,
        sample: &T,
        fields: &[&str],
    ) -> AncestorFinder<T> {
        let spec = FinderSpec::for_sample(sample, fields);
        let registered = self.finders.entry(T::KIND).or_default();
        if registered.contains(&spec) {
            panic!(
                "ancestor finder on {}({}) registered twice",
                T::KIND,
                spec.fields.join(", ")
            );
        }
        registered.push(spec.clone());
        tracing::debug!(kind = T::KIND, fields = ?spec.fields, "Registered ancestor finder");

        AncestorFinder {
            spec,
            _entity: PhantomData,
        }
    }

    pub fn finders_for(&self, kind: &str) -> &[FinderSpec] {
        self.finders.get(kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, spec: &FinderSpec) -> bool {
        self.finders_for(spec.kind).contains(spec)
    }

    /// Finder result-set keys affected by a record of `kind` at `id`.
    pub fn invalidation_keys(&self, kind: &str, id: &Identifier, properties: &Properties) -> Vec<String> {
        self.finders_for(kind)
            .iter()
            .flat_map(|spec| spec.invalidation_keys(id, properties))
            .collect()
    }

    /// Total number of registered finders.
    pub fn len(&self) -> usize {
        self.finders.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Uncached equality finder.
#[derive(Debug, Clone)]
pub struct Finder<T> {
    spec: FinderSpec,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> Finder<T> {
    /// # Panics
    ///
    /// If a field does not exist on `T` or `fields` is empty.
    pub fn new(sample: &T, fields: &[&str]) -> Self {
        Self {
            spec: FinderSpec::for_sample(sample, fields),
            _entity: PhantomData,
        }
    }

    pub fn spec(&self) -> &FinderSpec {
        &self.spec
    }

    pub fn query(&self, values: &[Value]) -> KeelResult<Query> {
        self.spec.query(values)
    }

    /// Every entity of `T` whose finder fields equal `values`.
    pub async fn find(&self, store: &CachedStore, ctx: &Context, values: &[Value]) -> KeelResult<Vec<T>> {
        store.get_query(ctx, &self.query(values)?).await
    }
}

/// Cached equality finder scoped to an ancestor. Only obtainable from
/// [`FinderRegistry::register_ancestor_finder`].
#[derive(Debug, Clone)]
pub struct AncestorFinder<T> {
    spec: FinderSpec,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> AncestorFinder<T> {
    pub fn spec(&self) -> &FinderSpec {
        &self.spec
    }

    pub fn query(&self, ancestor: &Identifier, values: &[Value]) -> KeelResult<Query> {
        Ok(self.spec.query(values)?.ancestor(ancestor.clone()))
    }

    pub fn cache_key(&self, ancestor: &Identifier, values: &[Value]) -> String {
        self.spec.cache_key(ancestor, values)
    }

    /// Entities under `ancestor` whose finder fields equal `values`.
    ///
    /// The result set is memoized; `AfterLoad` runs on every returned entity,
    /// cached or not.
    pub async fn find(
        &self,
        store: &CachedStore,
        ctx: &Context,
        ancestor: &Identifier,
        values: &[Value],
    ) -> KeelResult<Vec<T>> {
        debug_assert!(
            store.finders().contains(&self.spec),
            "ancestor finder used with a store it is not registered on"
        );
        let query = self.query(ancestor, values)?;
        let key = self.cache_key(ancestor, values);
        let query_ref = &query;
        let entities: Vec<T> = store
            .cache()
            .memoize(ctx, &key, None, move || store.fetch_query::<T>(query_ref))
            .await?;
        store.finish_load(ctx, entities).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::Lifecycle;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Zone {
        #[serde(default)]
        id: Identifier,
        name: String,
        floor: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        nick: Option<String>,
    }

    impl Lifecycle for Zone {}

    impl Entity for Zone {
        const KIND: &'static str = "Zone";

        fn id(&self) -> &Identifier {
            &self.id
        }

        fn set_id(&mut self, id: Identifier) {
            self.id = id;
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = FinderRegistry::new();
        let finder = registry.register_ancestor_finder(&Zone::default(), &["name"]);
        registry.register_ancestor_finder(&Zone::default(), &["name", "floor"]);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.finders_for("Zone").len(), 2);
        assert!(registry.finders_for("Other").is_empty());
        assert!(registry.contains(finder.spec()));
    }

    #[test]
    #[should_panic(expected = "does not exist")]
    fn test_unknown_field_panics() {
        FinderRegistry::new().register_ancestor_finder(&Zone::default(), &["colour"]);
    }

    #[test]
    fn test_register_on_unset_optional_field() {
        let mut registry = FinderRegistry::new();
        let finder = registry.register_ancestor_finder(&Zone::default(), &["nick"]);
        assert_eq!(finder.spec().fields().to_vec(), vec!["nick".to_string()]);
        let _ = Finder::new(&Zone::default(), &["nick", "name"]);
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_duplicate_registration_panics() {
        let mut registry = FinderRegistry::new();
        registry.register_ancestor_finder(&Zone::default(), &["name"]);
        registry.register_ancestor_finder(&Zone::default(), &["name"]);
    }

    #[test]
    #[should_panic(expected = "at least one field")]
    fn test_empty_field_list_panics() {
        let _ = Finder::new(&Zone::default(), &[]);
    }

    #[test]
    fn test_invalidation_keys_cover_every_ancestor() {
        let mut registry = FinderRegistry::new();
        let finder = registry.register_ancestor_finder(&Zone::default(), &["name"]);

        let account = Identifier::with_int("Account", 1, None);
        let venue = Identifier::with_name("Venue", "v", Some(account.clone()));
        let zone = Identifier::with_int("Zone", 9, Some(venue.clone()));
        let props = json!({"name": "lobby", "floor": 2}).as_object().cloned().unwrap();

        let keys = registry.invalidation_keys("Zone", &zone, &props);
        assert_eq!(keys.len(), 3);
        for ancestor in [&zone, &venue, &account] {
            assert!(keys.contains(&finder.cache_key(ancestor, &[json!("lobby")])));
        }
        assert!(!keys.contains(&finder.cache_key(&account, &[json!("bar")])));
    }

    #[test]
    fn test_missing_field_value_is_null() {
        let finder = Finder::new(&Zone::default(), &["floor"]);
        let props = json!({"name": "lobby"}).as_object().cloned().unwrap();
        assert_eq!(finder.spec().values(&props), vec![Value::Null]);
    }

    #[test]
    fn test_query_arity_is_checked() {
        let finder = Finder::new(&Zone::default(), &["name", "floor"]);
        assert!(finder.query(&[json!("lobby")]).is_err());

        let query = finder.query(&[json!("lobby"), json!(2)]).unwrap();
        assert_eq!(query.kind(), "Zone");
        assert_eq!(query.filters().len(), 2);
        assert!(query.ancestor_key().is_none());
    }
}
