//! Fuzz target for cache key parsing.
//!
//! Feeds arbitrary text to `CacheKey::parse` and checks that anything it
//! accepts encodes back to the same string.
//!
//! Run with: cargo +nightly fuzz run key_fuzz -- -max_total_time=60

#![no_main]

use cachet_core::{CacheKey, MAX_KEY_LENGTH};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };

    if let Some(key) = CacheKey::parse("cache", raw) {
        assert_eq!(key.encode(), raw, "parse must be the inverse of encode");
        assert_eq!(key.prefix(), "cache");
        assert!(!key.name().contains(':'));
        assert!(raw.len() <= MAX_KEY_LENGTH);
    }

    // Building from the same text as an instance never panics.
    let _ = CacheKey::new("cache", "fuzz", raw);
});
