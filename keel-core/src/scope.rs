//! Per-field write policies for JSON updates.
//!
//! A [`FieldScopes`] table is built once per entity type and says which
//! caller scopes (e.g. `"owner"`, `"admin"`) may write which fields. Updates
//! are checked against the table before anything is applied, so a rejected
//! patch leaves the target untouched.

use std::collections::{BTreeSet, HashMap};

use serde_json::{Map, Value};

use crate::error::{KeelResult, ValidationError};

/// Field name → scopes allowed to write it.
#[derive(Debug, Clone, Default)]
pub struct FieldScopes {
    identity_field: Option<String>,
    fields: HashMap<String, BTreeSet<String>>,
}

impl FieldScopes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name of the field holding the entity identifier. Patches never touch it.
    pub fn with_identity_field(mut self, field: impl Into<String>) -> Self {
        self.identity_field = Some(field.into());
        self
    }

    /// Allow `scopes` to write `field`.
    pub fn allow(mut self, field: impl Into<String>, scopes: &[&str]) -> Self {
        self.fields
            .entry(field.into())
            .or_default()
            .extend(scopes.iter().map(|s| s.to_string()));
        self
    }

    pub fn is_writable(&self, field: &str, scope: &str) -> bool {
        self.fields
            .get(field)
            .map(|scopes| scopes.contains(scope))
            .unwrap_or(false)
    }

    /// Merge `patch` into `target`, returning the names of fields written.
    ///
    /// Fails without modifying `target` if the patch is not an object or
    /// touches a field `scope` may not write.
    pub fn apply_update(
        &self,
        kind: &str,
        target: &mut Map<String, Value>,
        patch: &Value,
        scope: &str,
    ) -> KeelResult<Vec<String>> {
        let patch = patch.as_object().ok_or_else(|| ValidationError::NotAnObject {
            kind: kind.to_string(),
        })?;

        let updates: Vec<(&String, &Value)> = patch
            .iter()
            .filter(|(field, _)| self.identity_field.as_deref() != Some(field.as_str()))
            .collect();

        if let Some((field, _)) = updates.iter().find(|(f, _)| !self.is_writable(f, scope)) {
            return Err(ValidationError::FieldNotWritable {
                field: field.to_string(),
                scope: scope.to_string(),
            }
            .into());
        }

        let mut written = Vec::with_capacity(updates.len());
        for (field, value) in updates {
            target.insert(field.clone(), value.clone());
            written.push(field.clone());
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> FieldScopes {
        FieldScopes::new()
            .with_identity_field("id")
            .allow("name", &["owner", "admin"])
            .allow("plan", &["admin"])
    }

    fn account() -> Map<String, Value> {
        json!({"id": "abc", "name": "Cafe", "plan": "free"})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_is_writable() {
        let policy = policy();
        assert!(policy.is_writable("name", "owner"));
        assert!(!policy.is_writable("plan", "owner"));
        assert!(!policy.is_writable("missing", "admin"));
    }

    #[test]
    fn test_apply_update_writes_allowed_fields() {
        let mut target = account();
        let written = policy()
            .apply_update("Account", &mut target, &json!({"name": "Bar"}), "owner")
            .unwrap();
        assert_eq!(written, vec!["name".to_string()]);
        assert_eq!(target["name"], json!("Bar"));
    }

    #[test]
    fn test_apply_update_is_all_or_nothing() {
        let mut target = account();
        let err = policy()
            .apply_update(
                "Account",
                &mut target,
                &json!({"name": "Bar", "plan": "pro"}),
                "owner",
            )
            .unwrap_err();
        assert!(err.to_string().contains("plan"));
        assert_eq!(target, account());
    }

    #[test]
    fn test_apply_update_ignores_identity_field() {
        let mut target = account();
        let written = policy()
            .apply_update("Account", &mut target, &json!({"id": "other"}), "owner")
            .unwrap();
        assert!(written.is_empty());
        assert_eq!(target["id"], json!("abc"));
    }

    #[test]
    fn test_apply_update_rejects_non_object() {
        let mut target = account();
        let err = policy()
            .apply_update("Account", &mut target, &json!([1, 2]), "admin")
            .unwrap_err();
        assert!(matches!(
            err,
            crate::KeelError::Validation(ValidationError::NotAnObject { .. })
        ));
    }
}
