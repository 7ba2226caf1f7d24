//! Entity trait and property-map codec.

use std::fmt;

use keel_core::{FieldScopes, Identifier, KeelResult, StorageError};
use serde::de::{self, DeserializeOwned};
use serde::Serialize;
use serde_json::Value;

use crate::hooks::Lifecycle;
use crate::store::Properties;

/// A persistable type with a kind name and an identifier field.
///
/// The serde representation must be a JSON object; its top-level fields are
/// the stored properties, minus the identity field. The identity lives in the
/// record's key, so the identity field must deserialize with
/// `#[serde(default)]`.
pub trait Entity: Lifecycle + Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Kind name used in identifiers and queries.
    const KIND: &'static str;

    /// Serialized name of the field holding the identifier. Never stored.
    const ID_FIELD: &'static str = "id";

    fn id(&self) -> &Identifier;

    fn set_id(&mut self, id: Identifier);

    /// The key to store under: the entity's own id, or a fresh incomplete
    /// key of this kind when the id is zero.
    fn storage_id(&self) -> Identifier {
        if self.id().is_zero() {
            Identifier::incomplete(Self::KIND, None)
        } else {
            self.id().clone()
        }
    }
}

/// Result of decoding a stored record.
#[derive(Debug, Clone)]
pub struct Decoded<T> {
    pub entity: T,
    /// Stored fields the entity type does not declare.
    pub unknown_fields: Vec<String>,
}

impl<T: Entity> Decoded<T> {
    /// The drift as an error value, if there was any.
    pub fn mismatch(&self) -> Option<StorageError> {
        if self.unknown_fields.is_empty() {
            None
        } else {
            Some(StorageError::FieldMismatch {
                kind: T::KIND.to_string(),
                fields: self.unknown_fields.clone(),
            })
        }
    }
}

/// Stored properties of `entity`, without its identity field.
pub fn to_properties<T: Entity>(entity: &T) -> KeelResult<Properties> {
    match serde_json::to_value(entity) {
        Ok(Value::Object(mut map)) => {
            map.remove(T::ID_FIELD);
            Ok(map)
        }
        Ok(other) => Err(StorageError::Decode {
            kind: T::KIND.to_string(),
            reason: format!("entity serialized to {other}, expected an object"),
        }
        .into()),
        Err(e) => Err(StorageError::Decode {
            kind: T::KIND.to_string(),
            reason: e.to_string(),
        }
        .into()),
    }
}

/// Decode a stored record into `T`, stamping `id` onto it.
///
/// Unknown stored fields do not fail the decode; they are reported in
/// [`Decoded::unknown_fields`]. An identity field left in the record by an
/// older writer is ignored.
pub fn from_properties<T: Entity>(id: &Identifier, mut properties: Properties) -> KeelResult<Decoded<T>> {
    if id.kind() != T::KIND {
        return Err(StorageError::KindMismatch {
            expected: T::KIND.to_string(),
            found: id.kind().to_string(),
        }
        .into());
    }

    properties.remove(T::ID_FIELD);
    let stored_fields: Vec<String> = properties.keys().cloned().collect();
    let mut entity: T =
        serde_json::from_value(Value::Object(properties)).map_err(|e| StorageError::Decode {
            kind: T::KIND.to_string(),
            reason: e.to_string(),
        })?;
    entity.set_id(id.clone());

    let known = to_properties(&entity)?;
    let unknown_fields = stored_fields
        .into_iter()
        .filter(|field| !known.contains_key(field))
        .collect();

    Ok(Decoded {
        entity,
        unknown_fields,
    })
}

/// Field names `T` declares to serde, independent of any value.
///
/// `None` when `T` does not deserialize as a plain struct (for example with
/// `#[serde(flatten)]`).
pub fn field_names<T: Entity>() -> Option<&'static [&'static str]> {
    let mut fields = None;
    let _ = <T as de::Deserialize>::deserialize(FieldNames(&mut fields));
    fields
}

/// Deserializer that only records the field list handed to
/// `deserialize_struct`, then bails out.
struct FieldNames<'a>(&'a mut Option<&'static [&'static str]>);

#[derive(Debug)]
struct Probed;

impl fmt::Display for Probed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("field names recorded")
    }
}

impl std::error::Error for Probed {}

impl de::Error for Probed {
    fn custom<M: fmt::Display>(_msg: M) -> Self {
        Probed
    }
}

impl<'de> de::Deserializer<'de> for FieldNames<'_> {
    type Error = Probed;

    fn deserialize_any<V: de::Visitor<'de>>(self, _visitor: V) -> Result<V::Value, Probed> {
        Err(Probed)
    }

    fn deserialize_struct<V: de::Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        _visitor: V,
    ) -> Result<V::Value, Probed> {
        *self.0 = Some(fields);
        Err(Probed)
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf option unit unit_struct newtype_struct seq tuple
        tuple_struct map enum identifier ignored_any
    }
}

/// Apply a JSON patch to `entity` under a field policy, returning the
/// updated copy. The original is left untouched on error.
pub fn apply_update<T: Entity>(
    entity: &T,
    patch: &Value,
    scope: &str,
    policy: &FieldScopes,
) -> KeelResult<T> {
    let mut properties = to_properties(entity)?;
    policy.apply_update(T::KIND, &mut properties, patch, scope)?;

    let mut updated: T =
        serde_json::from_value(Value::Object(properties)).map_err(|e| StorageError::Decode {
            kind: T::KIND.to_string(),
            reason: e.to_string(),
        })?;
    updated.set_id(entity.id().clone());
    Ok(updated)
}
