//! Cachet Events - Observability
//!
//! Event types emitted by the cache, the listener registry a `Registry`
//! owns, and the hit/miss statistics derived from the event stream.
//!
//! ```text
//! CacheEntry ──emit──▶ EventEmitter ──┬──▶ listeners (by EventKind)
//!                                     └──▶ CacheStats counters
//! ```

mod emitter;
mod event;
mod stats;

pub use emitter::{EventEmitter, Listener, ListenerId};
pub use event::{CacheEvent, EventKind, HitSource, InvalidationEvent};
pub use stats::CacheStats;
