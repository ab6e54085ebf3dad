//! Namespaced cache keys and the persisted key layout.
//!
//! Every key the cache writes to the shared store is derived here, so the
//! layout stays byte-compatible with other instances sharing the store:
//!
//! ```text
//! {prefix}:{name}:{instance}                    primary payload
//! {prefix}:tag:{tag}                            tag set
//! {prefix}:pattern:{name}                       pattern bucket
//! {prefix}:version:{prefix}:{name}:{instance}   version counter
//! {prefix}:{name}:{instance}:v{N}               versioned payload
//! ```

use crate::error::{CachetResult, ValidationError};

/// Delimiter between key segments.
pub const DELIMITER: char = ':';

/// Upper bound on a serialized key, in bytes.
pub const MAX_KEY_LENGTH: usize = 1024;

/// A validated cache key.
///
/// The inner struct is private: a `CacheKey` can only be obtained through
/// [`CacheKey::new`] or [`CacheKey::parse`], both of which validate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    inner: CacheKeyInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKeyInner {
    prefix: String,
    name: String,
    instance: String,
}

impl CacheKey {
    /// Build a key from its three components.
    ///
    /// `prefix` and `name` must be non-empty and free of whitespace and `:`.
    /// `instance` must be non-empty and free of whitespace; it may contain `:`.
    pub fn new(
        prefix: impl Into<String>,
        name: impl Into<String>,
        instance: impl Into<String>,
    ) -> CachetResult<Self> {
        let prefix = prefix.into();
        let name = name.into();
        let instance = instance.into();

        validate_segment("prefix", &prefix)?;
        validate_segment("name", &name)?;
        validate_text("instance", &instance)?;

        let len = prefix.len() + name.len() + instance.len() + 2;
        if len > MAX_KEY_LENGTH {
            return Err(ValidationError::KeyTooLong {
                len,
                max: MAX_KEY_LENGTH,
            }
            .into());
        }

        Ok(Self {
            inner: CacheKeyInner {
                prefix,
                name,
                instance,
            },
        })
    }

    /// Parse a serialized key written under `prefix`.
    ///
    /// Returns `None` when the text does not start with `{prefix}:` or lacks
    /// a name or instance segment.
    pub fn parse(prefix: &str, raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix(prefix)?.strip_prefix(DELIMITER)?;
        let (name, instance) = rest.split_once(DELIMITER)?;
        Self::new(prefix, name, instance).ok()
    }

    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn instance(&self) -> &str {
        &self.inner.instance
    }

    /// Serialized form: `{prefix}:{name}:{instance}`.
    pub fn encode(&self) -> String {
        format!(
            "{}{d}{}{d}{}",
            self.inner.prefix,
            self.inner.name,
            self.inner.instance,
            d = DELIMITER
        )
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

const TAG_SEGMENT: &str = "tag";
const PATTERN_SEGMENT: &str = "pattern";
const VERSION_SEGMENT: &str = "version";

/// Name segments used by the index keys. No cache may take one.
pub const RESERVED_NAMES: [&str; 3] = [TAG_SEGMENT, PATTERN_SEGMENT, VERSION_SEGMENT];

/// Set holding every full key carrying `tag`.
pub fn tag_key(prefix: &str, tag: &str) -> String {
    format!("{prefix}{DELIMITER}{TAG_SEGMENT}{DELIMITER}{tag}")
}

/// Bucket holding every full key of cache `name`.
pub fn pattern_bucket_key(prefix: &str, name: &str) -> String {
    format!("{prefix}{DELIMITER}{PATTERN_SEGMENT}{DELIMITER}{name}")
}

/// Version counter for a full (logical) key.
pub fn version_key(prefix: &str, full_key: &str) -> String {
    format!("{prefix}{DELIMITER}{VERSION_SEGMENT}{DELIMITER}{full_key}")
}

/// Physical payload key for a logical key at version `version`.
pub fn versioned_key(full_key: &str, version: i64) -> String {
    format!("{full_key}:v{version}")
}

/// Name segment of a full key written under `prefix`.
pub fn name_of(prefix: &str, full_key: &str) -> Option<String> {
    let rest = full_key.strip_prefix(prefix)?.strip_prefix(DELIMITER)?;
    let (name, _) = rest.split_once(DELIMITER)?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Validate a prefix or cache name.
pub fn validate_segment(component: &str, value: &str) -> CachetResult<()> {
    validate_text(component, value)?;
    if value.contains(DELIMITER) {
        return Err(ValidationError::ReservedDelimiter {
            component: component.to_string(),
            value: value.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Validate a cache name: a legal segment that does not shadow an index key.
pub fn validate_cache_name(name: &str) -> CachetResult<()> {
    validate_segment("name", name)?;
    if RESERVED_NAMES.contains(&name) {
        return Err(ValidationError::ReservedName {
            name: name.to_string(),
        }
        .into());
    }
    Ok(())
}

fn validate_text(component: &str, value: &str) -> CachetResult<()> {
    if value.is_empty() {
        return Err(ValidationError::EmptyComponent {
            component: component.to_string(),
        }
        .into());
    }
    if value.chars().any(char::is_whitespace) {
        return Err(ValidationError::Whitespace {
            component: component.to_string(),
            value: value.to_string(),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CachetError;

    #[test]
    fn test_encode_layout() {
        let key = CacheKey::new("cache", "users", "42").unwrap();
        assert_eq!(key.encode(), "cache:users:42");
        assert_eq!(key.to_string(), "cache:users:42");
    }

    #[test]
    fn test_parse_roundtrip_with_colon_in_instance() {
        let key = CacheKey::new("cache", "posts", "user:7:page:2").unwrap();
        let parsed = CacheKey::parse("cache", &key.encode()).expect("parse should succeed");
        assert_eq!(parsed, key);
        assert_eq!(parsed.instance(), "user:7:page:2");
    }

    #[test]
    fn test_parse_rejects_foreign_prefix() {
        assert!(CacheKey::parse("cache", "other:users:1").is_none());
        assert!(CacheKey::parse("cache", "cacheusers:1").is_none());
        assert!(CacheKey::parse("cache", "cache:users").is_none());
    }

    #[test]
    fn test_rejects_whitespace() {
        let err = CacheKey::new("cache", "users", "a b").unwrap_err();
        assert!(matches!(
            err,
            CachetError::Validation(ValidationError::Whitespace { .. })
        ));
        assert!(CacheKey::new("cache", "us\ters", "1").is_err());
    }

    #[test]
    fn test_rejects_delimiter_in_name() {
        let err = CacheKey::new("cache", "a:b", "1").unwrap_err();
        assert!(matches!(
            err,
            CachetError::Validation(ValidationError::ReservedDelimiter { .. })
        ));
    }

    #[test]
    fn test_rejects_empty_components() {
        assert!(CacheKey::new("", "users", "1").is_err());
        assert!(CacheKey::new("cache", "", "1").is_err());
        assert!(CacheKey::new("cache", "users", "").is_err());
    }

    #[test]
    fn test_rejects_oversized_key() {
        let instance = "x".repeat(MAX_KEY_LENGTH);
        let err = CacheKey::new("cache", "users", instance).unwrap_err();
        assert!(matches!(
            err,
            CachetError::Validation(ValidationError::KeyTooLong { .. })
        ));
    }

    #[test]
    fn test_index_segments_are_reserved_names() {
        for name in RESERVED_NAMES {
            let err = validate_cache_name(name).unwrap_err();
            assert!(matches!(
                err,
                CachetError::Validation(ValidationError::ReservedName { .. })
            ));
        }
        assert!(validate_cache_name("tags").is_ok());
        assert!(validate_cache_name("users").is_ok());
        assert!(validate_cache_name("a:b").is_err());
    }

    #[test]
    fn test_auxiliary_layouts() {
        assert_eq!(tag_key("cache", "team-1"), "cache:tag:team-1");
        assert_eq!(pattern_bucket_key("cache", "users"), "cache:pattern:users");
        assert_eq!(
            version_key("cache", "cache:users:42"),
            "cache:version:cache:users:42"
        );
        assert_eq!(versioned_key("cache:users:42", 3), "cache:users:42:v3");
    }

    #[test]
    fn test_name_of() {
        assert_eq!(name_of("cache", "cache:users:42"), Some("users".to_string()));
        assert_eq!(name_of("cache", "cache:users"), None);
        assert_eq!(name_of("cache", "x:users:1"), None);
    }
}
