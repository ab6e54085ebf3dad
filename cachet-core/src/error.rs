//! Error types for Cachet operations

use thiserror::Error;

/// Key and pattern validation errors. Raised before any I/O.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Key component {component} must not be empty")]
    EmptyComponent { component: String },

    #[error("Key component {component} contains whitespace: {value:?}")]
    Whitespace { component: String, value: String },

    #[error("Key component {component} must not contain the ':' delimiter: {value:?}")]
    ReservedDelimiter { component: String, value: String },

    #[error("Cache name {name:?} is reserved for index keys")]
    ReservedName { name: String },

    #[error("Key exceeds {max} bytes (got {len})")]
    KeyTooLong { len: usize, max: usize },

    #[error("Pattern {pattern:?} cannot be resolved: {reason}")]
    UnsupportedPattern { pattern: String, reason: String },
}

/// Shared store errors.
///
/// These never reach `get` callers: the circuit breaker absorbs them and
/// reports them through the `error` event.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store connection failed: {reason}")]
    Connection { reason: String },

    #[error("Store command {command} failed: {reason}")]
    Command { command: String, reason: String },

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Store client is closed")]
    Closed,
}

/// Errors raised by caller-supplied fetch functions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Fetch failed for {key}: {reason}")]
    Failed { key: String, reason: String },
}

impl FetchError {
    /// Convenience constructor for fetch functions that do not know the key.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            key: String::new(),
            reason: reason.into(),
        }
    }
}

/// Payload encoding errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SerializationError {
    #[error("Failed to encode value: {reason}")]
    Encode { reason: String },

    #[error("Failed to decode value: {reason}")]
    Decode { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all Cachet errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CachetError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CachetError {
    /// True for errors the circuit breaker is expected to absorb.
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    /// Attach the cache key to a fetch error raised without one.
    pub fn with_fetch_key(self, key: &str) -> Self {
        match self {
            Self::Fetch(FetchError::Failed { key: k, reason }) if k.is_empty() => {
                Self::Fetch(FetchError::Failed {
                    key: key.to_string(),
                    reason,
                })
            }
            other => other,
        }
    }
}

/// Result type alias for Cachet operations.
pub type CachetResult<T> = Result<T, CachetError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display_key_too_long() {
        let err = ValidationError::KeyTooLong { len: 2048, max: 1024 };
        let msg = format!("{}", err);
        assert!(msg.contains("1024"));
        assert!(msg.contains("2048"));
    }

    #[test]
    fn test_store_error_display_command() {
        let err = StoreError::Command {
            command: "SMEMBERS".to_string(),
            reason: "connection reset".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("SMEMBERS"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "prefix".to_string(),
            value: "a b".to_string(),
            reason: "must not contain whitespace".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("prefix"));
        assert!(msg.contains("a b"));
        assert!(msg.contains("whitespace"));
    }

    #[test]
    fn test_cachet_error_from_variants() {
        let store = CachetError::from(StoreError::LockPoisoned);
        assert!(matches!(store, CachetError::Store(_)));
        assert!(store.is_store());

        let fetch = CachetError::from(FetchError::failed("boom"));
        assert!(matches!(fetch, CachetError::Fetch(_)));
        assert!(!fetch.is_store());

        let ser = CachetError::from(SerializationError::Decode {
            reason: "eof".to_string(),
        });
        assert!(matches!(ser, CachetError::Serialization(_)));

        let validation = CachetError::from(ValidationError::EmptyComponent {
            component: "name".to_string(),
        });
        assert!(matches!(validation, CachetError::Validation(_)));

        let config = CachetError::from(ConfigError::MissingRequired {
            field: "store".to_string(),
        });
        assert!(matches!(config, CachetError::Config(_)));
    }

    #[test]
    fn test_with_fetch_key_fills_missing_key_only() {
        let err = CachetError::from(FetchError::failed("timeout")).with_fetch_key("cache:users:1");
        assert_eq!(
            err,
            CachetError::Fetch(FetchError::Failed {
                key: "cache:users:1".to_string(),
                reason: "timeout".to_string(),
            })
        );

        let keyed = CachetError::from(FetchError::Failed {
            key: "original".to_string(),
            reason: "x".to_string(),
        })
        .with_fetch_key("other");
        assert!(matches!(
            keyed,
            CachetError::Fetch(FetchError::Failed { ref key, .. }) if key == "original"
        ));

        let store = CachetError::from(StoreError::Closed).with_fetch_key("k");
        assert_eq!(store, CachetError::Store(StoreError::Closed));
    }
}
