//! Expiry policies for cache entries.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How long an entry lives in the store.
pub enum TtlPolicy<T> {
    /// No expiry. The entry lives until invalidated.
    Never,
    /// Fixed lifetime from the moment of `set`.
    Fixed(Duration),
    /// Lifetime that restarts on every fresh hit.
    Sliding(Duration),
    /// Lifetime chosen from the value being stored. `None` means no expiry.
    Dynamic(Arc<dyn Fn(&T) -> Option<Duration> + Send + Sync>),
}

impl<T> TtlPolicy<T> {
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(&T) -> Option<Duration> + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(f))
    }

    /// Resolve the policy for a concrete value.
    pub fn resolve(&self, value: &T) -> ResolvedTtl {
        match self {
            Self::Never => ResolvedTtl::NEVER,
            Self::Fixed(d) => ResolvedTtl {
                ttl: Some(*d),
                sliding: false,
            },
            Self::Sliding(d) => ResolvedTtl {
                ttl: Some(*d),
                sliding: true,
            },
            Self::Dynamic(f) => ResolvedTtl {
                ttl: f(value),
                sliding: false,
            },
        }
    }

    /// The sliding window, if this policy slides.
    pub fn sliding(&self) -> Option<Duration> {
        match self {
            Self::Sliding(d) => Some(*d),
            _ => None,
        }
    }
}

impl<T> Clone for TtlPolicy<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Never => Self::Never,
            Self::Fixed(d) => Self::Fixed(*d),
            Self::Sliding(d) => Self::Sliding(*d),
            Self::Dynamic(f) => Self::Dynamic(Arc::clone(f)),
        }
    }
}

impl<T> Default for TtlPolicy<T> {
    fn default() -> Self {
        Self::Never
    }
}

impl<T> fmt::Debug for TtlPolicy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("Never"),
            Self::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            Self::Sliding(d) => f.debug_tuple("Sliding").field(d).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// A TTL policy applied to one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTtl {
    pub ttl: Option<Duration>,
    pub sliding: bool,
}

impl ResolvedTtl {
    pub const NEVER: Self = Self {
        ttl: None,
        sliding: false,
    };

    /// Physical store TTL once the stale-while-revalidate window is added.
    pub fn physical(&self, swr_window: Option<Duration>) -> Option<Duration> {
        self.ttl.map(|ttl| ttl + swr_window.unwrap_or(Duration::ZERO))
    }
}
