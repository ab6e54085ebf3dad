//! Stored entry envelope and staleness classification.
//!
//! Every payload written to the store is wrapped in an explicit envelope.
//! Readers never guess whether a stored value "looks wrapped": the
//! `hasMetadata` flag says so.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Current wall-clock time in epoch milliseconds.
///
/// Record timestamps are shared across processes, so they use wall-clock
/// time rather than a monotonic clock.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Where a record sits on its freshness timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Staleness {
    /// Serve without refreshing.
    Fresh,
    /// Serve, but refresh in the background.
    Stale,
    /// Past the stale bound. Treat as a miss.
    Expired,
}

/// A cached payload with optional stale-while-revalidate bounds.
///
/// Invariant: when both timestamps are present, `fresh_until <= stale_until`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord<T> {
    has_metadata: bool,
    value: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fresh_until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stale_until: Option<i64>,
}

impl<T> CacheRecord<T> {
    /// A record that is fresh until explicitly invalidated.
    pub fn plain(value: T) -> Self {
        Self {
            has_metadata: false,
            value,
            fresh_until: None,
            stale_until: None,
        }
    }

    /// A record that turns stale after `ttl` and expires `window` later.
    pub fn with_window(value: T, now_ms: i64, ttl: Duration, window: Duration) -> Self {
        let fresh_until = now_ms.saturating_add(duration_millis(ttl));
        let stale_until = fresh_until.saturating_add(duration_millis(window));
        Self {
            has_metadata: true,
            value,
            fresh_until: Some(fresh_until),
            stale_until: Some(stale_until),
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn has_metadata(&self) -> bool {
        self.has_metadata
    }

    pub fn fresh_until(&self) -> Option<i64> {
        self.fresh_until
    }

    pub fn stale_until(&self) -> Option<i64> {
        self.stale_until
    }

    /// Classify the record at `now_ms`.
    pub fn staleness(&self, now_ms: i64) -> Staleness {
        if !self.has_metadata {
            return Staleness::Fresh;
        }
        match (self.fresh_until, self.stale_until) {
            (Some(fresh), _) if now_ms < fresh => Staleness::Fresh,
            (Some(_), Some(stale)) if now_ms < stale => Staleness::Stale,
            (None, None) => Staleness::Fresh,
            (None, Some(stale)) if now_ms < stale => Staleness::Stale,
            _ => Staleness::Expired,
        }
    }

    /// Time left before the record expires, if it carries a stale bound.
    pub fn remaining(&self, now_ms: i64) -> Option<Duration> {
        self.stale_until
            .or(self.fresh_until)
            .map(|until| Duration::from_millis(until.saturating_sub(now_ms).max(0) as u64))
    }

    pub fn map<U, F>(self, f: F) -> CacheRecord<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRecord {
            has_metadata: self.has_metadata,
            value: f(self.value),
            fresh_until: self.fresh_until,
            stale_until: self.stale_until,
        }
    }
}

pub(crate) fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_record_is_always_fresh() {
        let record = CacheRecord::plain("v");
        assert!(!record.has_metadata());
        assert_eq!(record.staleness(0), Staleness::Fresh);
        assert_eq!(record.staleness(i64::MAX), Staleness::Fresh);
        assert_eq!(record.remaining(0), None);
    }

    #[test]
    fn test_window_timeline() {
        let record = CacheRecord::with_window(
            1,
            1_000,
            Duration::from_millis(100),
            Duration::from_millis(50),
        );
        assert_eq!(record.fresh_until(), Some(1_100));
        assert_eq!(record.stale_until(), Some(1_150));

        assert_eq!(record.staleness(1_000), Staleness::Fresh);
        assert_eq!(record.staleness(1_099), Staleness::Fresh);
        assert_eq!(record.staleness(1_100), Staleness::Stale);
        assert_eq!(record.staleness(1_149), Staleness::Stale);
        assert_eq!(record.staleness(1_150), Staleness::Expired);
    }

    #[test]
    fn test_remaining() {
        let record = CacheRecord::with_window(
            "x",
            0,
            Duration::from_millis(10),
            Duration::from_millis(20),
        );
        assert_eq!(record.remaining(5), Some(Duration::from_millis(25)));
        assert_eq!(record.remaining(100), Some(Duration::ZERO));
    }

    #[test]
    fn test_envelope_wire_format() {
        let record = CacheRecord::with_window(
            serde_json::json!({"id": 7}),
            0,
            Duration::from_millis(10),
            Duration::from_millis(5),
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["hasMetadata"], true);
        assert_eq!(json["value"]["id"], 7);
        assert_eq!(json["freshUntil"], 10);
        assert_eq!(json["staleUntil"], 15);

        let plain = serde_json::to_value(CacheRecord::plain(3)).unwrap();
        assert_eq!(plain, serde_json::json!({"hasMetadata": false, "value": 3}));
    }

    #[test]
    fn test_map_keeps_bounds() {
        let record = CacheRecord::with_window(2, 0, Duration::from_millis(1), Duration::ZERO);
        let mapped = record.map(|v| v * 10);
        assert_eq!(*mapped.value(), 20);
        assert_eq!(mapped.fresh_until(), Some(1));
        assert_eq!(mapped.stale_until(), Some(1));
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Fresh bound never exceeds the stale bound, and classification is
        /// monotone along the timeline.
        #[test]
        fn prop_timeline_is_monotone(
            now in 0i64..1_000_000,
            ttl in 0u64..10_000,
            window in 0u64..10_000,
            at_ms in 0i64..2_000_000,
        ) {
            let record = CacheRecord::with_window((), now, Duration::from_millis(ttl), Duration::from_millis(window));
            let fresh = record.fresh_until().expect("fresh bound");
            let stale = record.stale_until().expect("stale bound");
            prop_assert!(fresh <= stale);

            let expected = if at_ms < fresh {
                Staleness::Fresh
            } else if at_ms < stale {
                Staleness::Stale
            } else {
                Staleness::Expired
            };
            prop_assert_eq!(record.staleness(at_ms), expected);
        }
    }
}
