//! Configuration types

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Retry configuration for cache backend operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    #[serde(with = "duration_ms")]
    pub initial_backoff: Duration,
    /// Upper bound on any single delay, in milliseconds.
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
    pub backoff_multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// A config that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = f64::from(self.backoff_multiplier).powi(exponent);
        let micros = self.initial_backoff.as_micros() as f64 * factor;
        let capped = micros.min(self.max_backoff.as_micros() as f64);
        Duration::from_micros(capped as u64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts".to_string(),
                value: "0".to_string(),
                reason: "at least one attempt is required".to_string(),
            });
        }
        if self.max_backoff < self.initial_backoff {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_backoff".to_string(),
                value: format!("{:?}", self.max_backoff),
                reason: "must not be smaller than initial_backoff".to_string(),
            });
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "retry.backoff_multiplier".to_string(),
                value: self.backoff_multiplier.to_string(),
                reason: "must be >= 1.0".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration for the read-through cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Global switch; when false every read misses and writes are skipped.
    pub enabled: bool,
    /// Prefix of every backend key.
    pub namespace: String,
    /// TTL for entries written without an explicit one, in milliseconds.
    #[serde(with = "optional_duration_ms")]
    pub default_ttl: Option<Duration>,
    /// Whether memoize stores a marker when the generator finds nothing.
    pub cache_nil: bool,
    pub retry: RetryConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "keel".to_string(),
            default_ttl: None,
            cache_nil: true,
            retry: RetryConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Config with the cache switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Set the key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the default TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Enable or disable negative caching.
    pub fn with_nil_caching(mut self, enabled: bool) -> Self {
        self.cache_nil = enabled;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "cache.namespace".to_string(),
                value: String::new(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.default_ttl == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidValue {
                field: "cache.default_ttl".to_string(),
                value: "0".to_string(),
                reason: "omit the field for entries without expiry".to_string(),
            });
        }
        self.retry.validate()
    }
}

/// Master configuration struct.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    pub cache: CacheConfig,
}

impl KeelConfig {
    /// Parse and validate a TOML document.
    ///
    /// ```toml
    /// [cache]
    /// namespace = "accounts"
    /// default_ttl = 600000
    ///
    /// [cache.retry]
    /// max_attempts = 3
    /// ```
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: KeelConfig = toml::from_str(input).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod optional_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delays_double_and_cap() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_after(1), Duration::from_millis(10));
        assert_eq!(retry.delay_after(2), Duration::from_millis(20));
        assert_eq!(retry.delay_after(3), Duration::from_millis(40));
        assert_eq!(retry.delay_after(20), Duration::from_secs(1));
    }

    #[test]
    fn test_cache_config_builder() {
        let config = CacheConfig::new()
            .with_namespace("zones")
            .with_ttl(Duration::from_secs(30))
            .with_nil_caching(false)
            .with_retry(RetryConfig::none());

        assert_eq!(config.namespace, "zones");
        assert_eq!(config.default_ttl, Some(Duration::from_secs(30)));
        assert!(!config.cache_nil);
        assert_eq!(config.retry.max_attempts, 1);
        assert!(config.validate().is_ok());
        assert!(!CacheConfig::disabled().enabled);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(CacheConfig::new().with_namespace("").validate().is_err());
        assert!(CacheConfig::new()
            .with_ttl(Duration::ZERO)
            .validate()
            .is_err());

        let retry = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        };
        assert!(retry.validate().is_err());

        let retry = RetryConfig {
            max_backoff: Duration::from_millis(1),
            ..RetryConfig::default()
        };
        assert!(retry.validate().is_err());

        let retry = RetryConfig {
            backoff_multiplier: 0.5,
            ..RetryConfig::default()
        };
        assert!(retry.validate().is_err());
    }

    #[test]
    fn test_from_toml_str() {
        let config = KeelConfig::from_toml_str(
            r#"
            [cache]
            namespace = "accounts"
            default_ttl = 600000
            cache_nil = false

            [cache.retry]
            max_attempts = 3
            initial_backoff = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.namespace, "accounts");
        assert_eq!(config.cache.default_ttl, Some(Duration::from_secs(600)));
        assert!(!config.cache.cache_nil);
        assert!(config.cache.enabled);
        assert_eq!(config.cache.retry.max_attempts, 3);
        assert_eq!(config.cache.retry.initial_backoff, Duration::from_millis(5));
        assert_eq!(config.cache.retry.max_backoff, Duration::from_secs(1));
    }

    #[test]
    fn test_from_toml_str_empty_is_default() {
        assert_eq!(KeelConfig::from_toml_str("").unwrap(), KeelConfig::default());
    }

    #[test]
    fn test_from_toml_str_errors() {
        let err = KeelConfig::from_toml_str("[cache\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));

        let err = KeelConfig::from_toml_str("[cache.retry]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
