//! Error types for keel operations

use std::fmt;

use thiserror::Error;

use crate::key::Identifier;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StorageError {
    #[error("No such entity: {kind} with id {}", .id.path())]
    NoSuchEntity { kind: String, id: Identifier },

    /// A stored record carries fields the current entity type does not know.
    #[error("Field mismatch loading {kind}: unknown fields {fields:?}")]
    FieldMismatch { kind: String, fields: Vec<String> },

    #[error("Failed to decode {kind}: {reason}")]
    Decode { kind: String, reason: String },

    #[error("Incomplete key for {kind}")]
    IncompleteKey { kind: String },

    #[error("Kind mismatch: expected {expected}, found {found}")]
    KindMismatch { expected: String, found: String },

    #[error("Insert failed for {kind}: {reason}")]
    InsertFailed { kind: String, reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Store backend error: {reason}")]
    Backend { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Identifier decoding errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Malformed identifier: {reason}")]
    Malformed { reason: String },
}

/// Cache layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// Nothing cached under the key, or a cached "nothing found" marker.
    #[error("Cache miss")]
    Miss,

    #[error("Cache {operation} failed after {attempts} attempts: {reason}")]
    Transient {
        operation: String,
        attempts: u32,
        reason: String,
    },

    #[error("Cache backend error: {reason}")]
    Backend { reason: String },

    #[error("Cache serialization error: {reason}")]
    Serialization { reason: String },

    #[error("Generator for cache key {key} panicked: {message}")]
    GeneratorPanicked { key: String, message: String },
}

/// Errors raised by lifecycle hooks.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HookError {
    #[error("{hook} rejected: {reason}")]
    Rejected { hook: String, reason: String },
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Field {field} is not writable in scope {scope}")]
    FieldNotWritable { field: String, scope: String },

    #[error("Expected a JSON object for {kind}")]
    NotAnObject { kind: String },

    #[error("Finder on {kind} takes {expected} values, got {got}")]
    ArityMismatch {
        kind: String,
        expected: usize,
        got: usize,
    },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Positionally aligned results of a batch operation.
///
/// Slot `i` is `None` when entry `i` succeeded.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MultiError {
    errors: Vec<Option<KeelError>>,
}

impl MultiError {
    pub fn new(errors: Vec<Option<KeelError>>) -> Self {
        Self { errors }
    }

    /// Collect the failures of a slice of results, keeping positions.
    pub fn from_results<T>(results: &[KeelResult<T>]) -> Self {
        Self {
            errors: results.iter().map(|r| r.as_ref().err().cloned()).collect(),
        }
    }

    /// Number of slots (successes and failures).
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&KeelError> {
        self.errors.get(index).and_then(Option::as_ref)
    }

    /// Iterate `(position, error)` over failed slots.
    pub fn failures(&self) -> impl Iterator<Item = (usize, &KeelError)> {
        self.errors
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (i, e)))
    }

    pub fn failure_count(&self) -> usize {
        self.failures().count()
    }

    pub fn has_failures(&self) -> bool {
        self.errors.iter().any(Option::is_some)
    }

    /// `Ok` iff every failed slot satisfies `tolerated`.
    pub fn tolerating(self, tolerated: impl Fn(&KeelError) -> bool) -> KeelResult<()> {
        if self.failures().all(|(_, e)| tolerated(e)) {
            Ok(())
        } else {
            Err(KeelError::Multi(self))
        }
    }

    pub fn into_inner(self) -> Vec<Option<KeelError>> {
        self.errors
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failed = self.failure_count();
        match self.failures().next() {
            Some((index, first)) => write!(
                f,
                "{failed} of {} operations failed (first at {index}: {first})",
                self.len()
            ),
            None => write!(f, "0 of {} operations failed", self.len()),
        }
    }
}

impl std::error::Error for MultiError {}

/// Master error type for all keel errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum KeelError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Hook error: {0}")]
    Hook(#[from] HookError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Multi(#[from] MultiError),
}

impl KeelError {
    /// Shorthand for the "404" error.
    pub fn no_such_entity(kind: impl Into<String>, id: Identifier) -> Self {
        KeelError::Storage(StorageError::NoSuchEntity {
            kind: kind.into(),
            id,
        })
    }

    pub fn is_no_such_entity(&self) -> bool {
        matches!(self, KeelError::Storage(StorageError::NoSuchEntity { .. }))
    }

    pub fn is_cache_miss(&self) -> bool {
        matches!(self, KeelError::Cache(CacheError::Miss))
    }

    pub fn is_field_mismatch(&self) -> bool {
        matches!(self, KeelError::Storage(StorageError::FieldMismatch { .. }))
    }

    /// Errors worth retrying against the cache backend.
    pub fn is_transient(&self) -> bool {
        matches!(self, KeelError::Cache(CacheError::Backend { .. }))
    }
}

/// Result type alias for keel operations.
pub type KeelResult<T> = Result<T, KeelError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_such_entity_display() {
        let err = KeelError::no_such_entity("Account", Identifier::with_int("Account", 7, None));
        let msg = err.to_string();
        assert!(msg.contains("No such entity"));
        assert!(msg.contains("Account,7"));
        assert!(err.is_no_such_entity());
        assert!(!err.is_cache_miss());
    }

    #[test]
    fn test_cache_error_display_transient() {
        let err = CacheError::Transient {
            operation: "set".to_string(),
            attempts: 5,
            reason: "connection reset".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("set"));
        assert!(msg.contains('5'));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn test_transient_classification() {
        let backend = KeelError::from(CacheError::Backend {
            reason: "down".to_string(),
        });
        assert!(backend.is_transient());
        let exhausted = KeelError::from(CacheError::Transient {
            operation: "delete".to_string(),
            attempts: 3,
            reason: "down".to_string(),
        });
        assert!(!exhausted.is_transient());
    }

    #[test]
    fn test_multi_error_tolerating() {
        let mismatch = KeelError::from(StorageError::FieldMismatch {
            kind: "Account".to_string(),
            fields: vec!["legacy".to_string()],
        });
        let multi = MultiError::new(vec![None, Some(mismatch.clone()), None]);
        assert_eq!(multi.failure_count(), 1);
        assert!(multi.clone().tolerating(KeelError::is_field_mismatch).is_ok());

        let fatal = KeelError::from(StorageError::Backend {
            reason: "timeout".to_string(),
        });
        let multi = MultiError::new(vec![Some(mismatch), Some(fatal)]);
        let err = multi.tolerating(KeelError::is_field_mismatch).unwrap_err();
        match err {
            KeelError::Multi(inner) => {
                assert_eq!(inner.len(), 2);
                assert!(inner.get(1).is_some());
            }
            other => panic!("expected multi error, got {other:?}"),
        }
    }

    #[test]
    fn test_multi_error_from_results() {
        let results: Vec<KeelResult<u8>> = vec![Ok(1), Err(CacheError::Miss.into()), Ok(3)];
        let multi = MultiError::from_results(&results);
        assert_eq!(multi.len(), 3);
        assert!(multi.get(0).is_none());
        assert!(multi.get(1).map(KeelError::is_cache_miss).unwrap_or(false));
        assert!(multi.to_string().contains("1 of 3"));
    }

    #[test]
    fn test_keel_error_from_variants() {
        assert!(matches!(
            KeelError::from(StorageError::LockPoisoned),
            KeelError::Storage(_)
        ));
        assert!(matches!(
            KeelError::from(KeyError::Malformed {
                reason: "x".to_string()
            }),
            KeelError::Key(_)
        ));
        assert!(matches!(
            KeelError::from(HookError::Rejected {
                hook: "before_save".to_string(),
                reason: "no".to_string()
            }),
            KeelError::Hook(_)
        ));
        assert!(matches!(
            KeelError::from(ValidationError::NotAnObject {
                kind: "Account".to_string()
            }),
            KeelError::Validation(_)
        ));
        assert!(matches!(
            KeelError::from(ConfigError::Parse {
                reason: "eof".to_string()
            }),
            KeelError::Config(_)
        ));
    }
}
