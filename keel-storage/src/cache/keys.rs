//! Cache key derivation.
//!
//! Raw keys are readable strings built from identifiers and finder values.
//! Before they reach a backend they are hashed into a fixed-length,
//! namespaced form, so arbitrary lengths and characters in raw keys never
//! hit backend key limits:
//!
//! ```text
//! {namespace}:{hex(sha256(raw))}
//! ```

use keel_core::Identifier;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Raw key of the cached copy of one entity.
pub fn entity_cache_key(id: &Identifier) -> String {
    format!("entity/{}/{}", id.kind(), id.encode())
}

/// Raw key of one ancestor-finder result set.
///
/// `values` are the field values in declaration order; a missing field is
/// `null`. The same function derives the key on lookup and on invalidation.
pub fn finder_cache_key(kind: &str, fields: &[String], ancestor: &Identifier, values: &[Value]) -> String {
    format!(
        "finder/{kind}/{}/{}/{}",
        fields.join(","),
        ancestor.encode(),
        Value::Array(values.to_vec())
    )
}

/// Backend key for a raw key in `namespace`.
pub fn backend_key(namespace: &str, raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    format!("{namespace}:{}", hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_cache_key_distinguishes_kinds_and_ids() {
        let a = Identifier::with_int("Account", 1, None);
        let b = Identifier::with_int("Account", 2, None);
        let z = Identifier::with_int("SoundZone", 1, Some(a.clone()));
        assert_ne!(entity_cache_key(&a), entity_cache_key(&b));
        assert_ne!(entity_cache_key(&a), entity_cache_key(&z));
        assert!(entity_cache_key(&a).starts_with("entity/Account/"));
    }

    #[test]
    fn test_finder_cache_key_depends_on_every_part() {
        let fields = vec!["name".to_string()];
        let a = Identifier::with_int("Account", 1, None);
        let b = Identifier::with_int("Account", 2, None);
        let base = finder_cache_key("SoundZone", &fields, &a, &[json!("lobby")]);

        assert_eq!(base, finder_cache_key("SoundZone", &fields, &a, &[json!("lobby")]));
        assert_ne!(base, finder_cache_key("SoundZone", &fields, &b, &[json!("lobby")]));
        assert_ne!(base, finder_cache_key("SoundZone", &fields, &a, &[json!("bar")]));
        assert_ne!(base, finder_cache_key("Schedule", &fields, &a, &[json!("lobby")]));
        assert_ne!(
            base,
            finder_cache_key("SoundZone", &["title".to_string()], &a, &[json!("lobby")])
        );
    }

    #[test]
    fn test_backend_key_shape() {
        let key = backend_key("keel", "entity/Account/abc");
        let (namespace, digest) = key.split_once(':').unwrap();
        assert_eq!(namespace, "keel");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(key, backend_key("other", "entity/Account/abc"));
    }
}
