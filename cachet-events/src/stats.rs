//! Running totals derived from emitted events.

use serde::{Deserialize, Serialize};

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Hits from either layer.
    pub hits: u64,
    /// Hits served by the in-process layer.
    pub local_hits: u64,
    /// Hits served by the shared store.
    pub store_hits: u64,
    /// Misses that fell through to the fetch function (or returned absent).
    pub misses: u64,
    /// Values written.
    pub sets: u64,
    /// Invalidation events, local and received.
    pub invalidations: u64,
    /// Absorbed store errors and dropped background refreshes.
    pub errors: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
