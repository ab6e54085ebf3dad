//! Observability event types.

use cachet_core::CachetError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which layer served a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitSource {
    /// In-process memo layer.
    Local,
    /// Shared store.
    Store,
}

/// Discriminator used to subscribe to a class of events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Hit,
    Miss,
    Set,
    Invalidate,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Hit,
        EventKind::Miss,
        EventKind::Set,
        EventKind::Invalidate,
        EventKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Set => "set",
            Self::Invalidate => "invalidate",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one invalidation: what was targeted and which keys it reached.
///
/// Exactly one of `key`, `tag`, `pattern` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default)]
    pub affected_keys: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl InvalidationEvent {
    pub fn for_key(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            affected_keys: vec![key.clone()],
            key: Some(key),
            tag: None,
            pattern: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_tag(tag: impl Into<String>, affected_keys: Vec<String>) -> Self {
        Self {
            key: None,
            tag: Some(tag.into()),
            pattern: None,
            affected_keys,
            timestamp: Utc::now(),
        }
    }

    pub fn for_pattern(pattern: impl Into<String>, affected_keys: Vec<String>) -> Self {
        Self {
            key: None,
            tag: None,
            pattern: Some(pattern.into()),
            affected_keys,
            timestamp: Utc::now(),
        }
    }

    /// Override the affected key list (e.g. to include cascaded keys).
    pub fn with_affected_keys(mut self, keys: Vec<String>) -> Self {
        self.affected_keys = keys;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// An observability event emitted by the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Hit {
        key: String,
        latency: Duration,
        source: HitSource,
    },
    Miss {
        key: String,
        latency: Duration,
    },
    Set {
        key: String,
        ttl: Option<Duration>,
        size: usize,
    },
    Invalidate(InvalidationEvent),
    Error {
        error: CachetError,
        timestamp: DateTime<Utc>,
    },
}

impl CacheEvent {
    pub fn error(error: CachetError) -> Self {
        Self::Error {
            error,
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Hit { .. } => EventKind::Hit,
            Self::Miss { .. } => EventKind::Miss,
            Self::Set { .. } => EventKind::Set,
            Self::Invalidate(_) => EventKind::Invalidate,
            Self::Error { .. } => EventKind::Error,
        }
    }

    /// Cache key the event concerns, when it concerns exactly one.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Hit { key, .. } | Self::Miss { key, .. } | Self::Set { key, .. } => Some(key),
            Self::Invalidate(event) => event.key.as_deref(),
            Self::Error { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachet_core::StoreError;

    #[test]
    fn test_kind_matches_variant() {
        let hit = CacheEvent::Hit {
            key: "cache:a:1".into(),
            latency: Duration::from_micros(5),
            source: HitSource::Local,
        };
        assert_eq!(hit.kind(), EventKind::Hit);
        assert_eq!(hit.key(), Some("cache:a:1"));

        let err = CacheEvent::error(StoreError::Closed.into());
        assert_eq!(err.kind(), EventKind::Error);
        assert_eq!(err.key(), None);

        let inv = CacheEvent::Invalidate(InvalidationEvent::for_tag("t", vec!["k".into()]));
        assert_eq!(inv.kind(), EventKind::Invalidate);
        assert_eq!(inv.key(), None);
    }

    #[test]
    fn test_invalidation_event_constructors() {
        let by_key = InvalidationEvent::for_key("cache:users:1");
        assert_eq!(by_key.key.as_deref(), Some("cache:users:1"));
        assert_eq!(by_key.affected_keys, vec!["cache:users:1".to_string()]);

        let by_pattern = InvalidationEvent::for_pattern("cache:users:*", vec![]);
        assert_eq!(by_pattern.pattern.as_deref(), Some("cache:users:*"));
        assert!(by_pattern.key.is_none() && by_pattern.tag.is_none());
    }

    #[test]
    fn test_invalidation_event_wire_shape() {
        let event = InvalidationEvent::for_tag("team", vec!["cache:a:1".into()]);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["tag"], "team");
        assert_eq!(json["affectedKeys"][0], "cache:a:1");
        assert!(json.get("key").is_none());
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn test_event_kind_names() {
        let names: Vec<_> = EventKind::ALL.iter().map(|k| k.to_string()).collect();
        assert_eq!(names, vec!["hit", "miss", "set", "invalidate", "error"]);
    }
}
