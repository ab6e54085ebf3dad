//! Bounded in-process memo layer.
//!
//! Eviction is least-recently-*inserted*: reads never reorder entries, so
//! which entry goes next depends only on the sequence of writes. Each entry
//! may carry its own expiry, independent of (and usually shorter than) the
//! shared store's TTL.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use cachet_core::GlobPattern;

#[derive(Debug, Clone)]
struct LocalEntry<V> {
    value: V,
    seq: u64,
    expires_at: Option<Instant>,
}

impl<V> LocalEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Debug)]
struct LocalInner<V> {
    entries: HashMap<String, LocalEntry<V>>,
    /// Insertion sequence -> key. The first entry is evicted first.
    order: BTreeMap<u64, String>,
    next_seq: u64,
    evictions: u64,
}

impl<V> LocalInner<V> {
    fn remove(&mut self, key: &str) -> Option<LocalEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }
}

#[derive(Debug)]
pub struct LocalCache<V> {
    capacity: usize,
    max_ttl: Option<Duration>,
    inner: Mutex<LocalInner<V>>,
}

impl<V: Clone> LocalCache<V> {
    /// `max_ttl` caps the lifetime of every entry.
    pub fn new(capacity: usize, max_ttl: Option<Duration>) -> Self {
        Self {
            capacity: capacity.max(1),
            max_ttl,
            inner: Mutex::new(LocalInner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
                evictions: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, LocalInner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn effective_ttl(&self, ttl: Option<Duration>) -> Option<Duration> {
        match (ttl, self.max_ttl) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.lock();
        let live = inner.entries.get(key).map(|entry| entry.is_live(now))?;
        if live {
            inner.entries.get(key).map(|entry| entry.value.clone())
        } else {
            inner.remove(key);
            None
        }
    }

    /// Insert or replace `key`. A replaced key counts as newly inserted.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        let expires_at = self.effective_ttl(ttl).map(|ttl| Instant::now() + ttl);
        let mut inner = self.lock();
        inner.remove(key);

        while inner.entries.len() >= self.capacity {
            let Some((_, oldest)) = inner.order.pop_first() else {
                break;
            };
            inner.entries.remove(&oldest);
            inner.evictions += 1;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.insert(seq, key.to_string());
        inner.entries.insert(
            key.to_string(),
            LocalEntry {
                value,
                seq,
                expires_at,
            },
        );
    }

    pub fn delete(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn delete_many(&self, keys: &[String]) -> usize {
        let mut inner = self.lock();
        keys.iter().filter(|k| inner.remove(k).is_some()).count()
    }

    /// Evict every local key matching `pattern`. Returns the evicted keys.
    pub fn delete_by_pattern(&self, pattern: &GlobPattern) -> Vec<String> {
        let mut inner = self.lock();
        let matched: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| pattern.matches(k))
            .cloned()
            .collect();
        for key in &matched {
            inner.remove(key);
        }
        matched
    }

    /// Evict the keys a tag resolved to.
    pub fn delete_by_tag(&self, keys: &[String]) -> usize {
        self.delete_many(keys)
    }

    /// Restart the expiry of a live entry. Insertion order is unchanged.
    pub fn reset_ttl(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let expires_at = self.effective_ttl(Some(ttl)).map(|ttl| now + ttl);
        let mut inner = self.lock();
        match inner.entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = expires_at;
                true
            }
            _ => false,
        }
    }

    /// Number of stored entries, including expired ones not yet reclaimed.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        self.lock().entries.get(key).is_some_and(|e| e.is_live(now))
    }

    /// Keys in insertion order, oldest first.
    pub fn keys(&self) -> Vec<String> {
        self.lock().order.values().cloned().collect()
    }

    pub fn evictions(&self) -> u64 {
        self.lock().evictions
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
    }
}

// =============================================================================
// TESTS
// =============================================================================
