//! Fuzz target for glob compilation and matching.
//!
//! The first line of the input is the pattern, the rest are candidate keys.
//! Compilation may fail; matching a compiled glob must not panic, and a
//! wildcard-free glob must match only itself.
//!
//! Run with: cargo +nightly fuzz run glob_fuzz -- -max_total_time=60

#![no_main]

use cachet_core::GlobPattern;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    let mut lines = input.lines();
    let Some(pattern) = lines.next() else {
        return;
    };
    let Ok(glob) = GlobPattern::new(pattern) else {
        return;
    };

    assert_eq!(glob.as_str(), pattern);
    assert!(pattern.starts_with(glob.literal_prefix()));

    for key in lines {
        let matched = glob.matches(key);
        if !glob.has_wildcard() {
            assert_eq!(matched, key == pattern);
        }
        if matched {
            assert!(key.starts_with(glob.literal_prefix()));
        }
    }
});
