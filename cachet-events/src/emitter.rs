//! Listener registry owned by a cache registry.
//!
//! Listeners are plain synchronous callbacks grouped by [`EventKind`]. The
//! emitter snapshots the listener list before invoking it, so listeners may
//! subscribe or unsubscribe from inside a callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::event::{CacheEvent, EventKind, HitSource};
use crate::stats::CacheStats;

/// Callback invoked for each matching event.
pub type Listener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

/// Handle returned by [`EventEmitter::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Counters {
    local_hits: AtomicU64,
    store_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    invalidations: AtomicU64,
    errors: AtomicU64,
}

/// Fans cache events out to subscribed listeners and keeps running totals.
#[derive(Default)]
pub struct EventEmitter {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<EventKind, Vec<(ListenerId, Listener)>>>,
    counters: Counters,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `listener` to events of `kind`.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Unsubscribe a listener. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        for list in listeners.values_mut() {
            let before = list.len();
            list.retain(|(existing, _)| *existing != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// Number of listeners subscribed to `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Record `event` and deliver it to every listener of its kind.
    pub fn emit(&self, event: CacheEvent) {
        self.count(&event);

        let targets: Vec<Listener> = {
            let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            match listeners.get(&event.kind()) {
                Some(list) => list.iter().map(|(_, l)| Arc::clone(l)).collect(),
                None => return,
            }
        };

        for listener in targets {
            listener(&event);
        }
    }

    /// Snapshot of the running totals.
    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        let local_hits = c.local_hits.load(Ordering::Relaxed);
        let store_hits = c.store_hits.load(Ordering::Relaxed);
        CacheStats {
            hits: local_hits + store_hits,
            local_hits,
            store_hits,
            misses: c.misses.load(Ordering::Relaxed),
            sets: c.sets.load(Ordering::Relaxed),
            invalidations: c.invalidations.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
        }
    }

    fn count(&self, event: &CacheEvent) {
        let counter = match event {
            CacheEvent::Hit {
                source: HitSource::Local,
                ..
            } => &self.counters.local_hits,
            CacheEvent::Hit {
                source: HitSource::Store,
                ..
            } => &self.counters.store_hits,
            CacheEvent::Miss { .. } => &self.counters.misses,
            CacheEvent::Set { .. } => &self.counters.sets,
            CacheEvent::Invalidate(_) => &self.counters.invalidations,
            CacheEvent::Error { .. } => &self.counters.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let counts: HashMap<EventKind, usize> =
            listeners.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("EventEmitter")
            .field("listeners", &counts)
            .field("stats", &self.stats())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
