//! keel Core - Identifiers, Errors, Configuration
//!
//! Pure data types shared by every other keel crate. No I/O and no async
//! code lives here.

pub mod config;
pub mod error;
pub mod key;
pub mod scope;

pub use config::{CacheConfig, KeelConfig, RetryConfig};
pub use error::{
    CacheError, ConfigError, HookError, KeelError, KeelResult, KeyError, MultiError,
    StorageError, ValidationError,
};
pub use key::{Ancestors, Identifier};
pub use scope::FieldScopes;
