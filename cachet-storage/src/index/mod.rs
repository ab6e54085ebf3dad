//! Key-group indices kept in the shared store.
//!
//! Both indices are plain store sets of full keys. Members may outlive the
//! payloads they name; deleting an absent key is a no-op, so stale members
//! are harmless.

mod pattern;
mod tag;

pub use pattern::PatternIndex;
pub use tag::TagIndex;
