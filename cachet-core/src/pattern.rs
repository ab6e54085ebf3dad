//! Glob patterns over cache keys.
//!
//! Only `*` is special: it matches any run of characters, including `:`.
//! Everything else matches literally.

use regex::Regex;

use crate::error::{CachetResult, ValidationError};

/// Wildcard character.
pub const WILDCARD: char = '*';

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> CachetResult<Self> {
        let body = pattern
            .split(WILDCARD)
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("^{body}$")).map_err(|e| {
            ValidationError::UnsupportedPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn has_wildcard(&self) -> bool {
        has_wildcard(&self.source)
    }

    /// Text before the first wildcard.
    pub fn literal_prefix(&self) -> &str {
        literal_prefix(&self.source)
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }
}

pub fn has_wildcard(pattern: &str) -> bool {
    pattern.contains(WILDCARD)
}

pub fn literal_prefix(pattern: &str) -> &str {
    match pattern.find(WILDCARD) {
        Some(idx) => &pattern[..idx],
        None => pattern,
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// A pattern without wildcards matches exactly itself.
        #[test]
        fn prop_literal_pattern_is_exact(
            text in "[a-zA-Z0-9:.+?()\\[\\]{}|^$-]{1,32}",
            other in "[a-zA-Z0-9:.-]{1,32}",
        ) {
            let glob = GlobPattern::new(&text).expect("literal pattern compiles");
            prop_assert!(glob.matches(&text));
            prop_assert_eq!(glob.matches(&other), other == text);
        }

        /// `prefix*` matches every key that starts with `prefix`.
        #[test]
        fn prop_trailing_wildcard_is_prefix_match(
            prefix in "[a-z:]{0,12}",
            rest in "[a-z0-9:]{0,12}",
        ) {
            let glob = GlobPattern::new(&format!("{prefix}*")).expect("compiles");
            let key = format!("{prefix}{rest}");
            prop_assert!(glob.matches(&key));
        }
    }
}
