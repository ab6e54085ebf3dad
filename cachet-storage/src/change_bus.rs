//! Cross-instance invalidation over store pub/sub.
//!
//! Every server-mode registry subscribes to `{prefix}:invalidation` on a
//! dedicated connection and publishes on its command connection. Messages
//! carry the publisher's `origin` id so an instance can skip its own echoes;
//! the publisher has already evicted its local copies before publishing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use cachet_core::{now_millis, CachetError, CachetResult, GlobPattern, SerializationError};
use cachet_events::{CacheEvent, EventEmitter, InvalidationEvent};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::local_cache::LocalCache;
use crate::store::{StoreClient, StoreMessage, Subscription};

/// Channel name for a prefix.
pub fn invalidation_channel(prefix: &str) -> String {
    format!("{prefix}:invalidation")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Key,
    Tag,
    Pattern,
}

/// Wire format of an invalidation broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMessage {
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Full keys the invalidation resolved to.
    #[serde(default)]
    pub keys: Vec<String>,
    pub origin: Uuid,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

impl ChangeMessage {
    fn new(kind: ChangeKind, origin: Uuid, keys: Vec<String>) -> Self {
        Self {
            kind,
            key: None,
            tag: None,
            pattern: None,
            keys,
            origin,
            timestamp: now_millis(),
        }
    }

    fn into_event(self) -> InvalidationEvent {
        let timestamp = DateTime::<Utc>::from_timestamp_millis(self.timestamp).unwrap_or_else(Utc::now);
        let event = match self.kind {
            ChangeKind::Key => InvalidationEvent::for_key(self.key.unwrap_or_default()),
            ChangeKind::Tag => InvalidationEvent::for_tag(self.tag.unwrap_or_default(), Vec::new()),
            ChangeKind::Pattern => {
                InvalidationEvent::for_pattern(self.pattern.unwrap_or_default(), Vec::new())
            }
        };
        let event = if self.keys.is_empty() {
            event
        } else {
            event.with_affected_keys(self.keys)
        };
        event.with_timestamp(timestamp)
    }
}

pub struct ChangeBus {
    channel: String,
    origin: Uuid,
    publisher: Arc<dyn StoreClient>,
    subscriber: Arc<dyn StoreClient>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ChangeBus {
    /// Subscribe and start the listener task.
    ///
    /// The subscription is live when this returns: any broadcast published
    /// afterwards reaches `local`.
    pub async fn start(
        prefix: &str,
        publisher: Arc<dyn StoreClient>,
        subscriber: Arc<dyn StoreClient>,
        local: Option<Arc<LocalCache<Vec<u8>>>>,
        events: Arc<EventEmitter>,
    ) -> CachetResult<Self> {
        let channel = invalidation_channel(prefix);
        let origin = Uuid::now_v7();
        let messages = subscriber.subscribe(&channel).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let listener = Listener {
            origin,
            local,
            events,
        };
        let task = tokio::spawn(listener.run(messages, shutdown_rx));

        tracing::info!(channel = %channel, origin = %origin, "Invalidation bus subscribed");

        Ok(Self {
            channel,
            origin,
            publisher,
            subscriber,
            shutdown_tx,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn origin(&self) -> Uuid {
        self.origin
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Broadcast a key invalidation. `keys` lists every key it reached,
    /// including cascaded ones.
    pub async fn publish_key(&self, key: &str, keys: Vec<String>) -> CachetResult<()> {
        let mut message = ChangeMessage::new(ChangeKind::Key, self.origin, keys);
        message.key = Some(key.to_string());
        self.publish(message).await
    }

    pub async fn publish_tag(&self, tag: &str, keys: Vec<String>) -> CachetResult<()> {
        let mut message = ChangeMessage::new(ChangeKind::Tag, self.origin, keys);
        message.tag = Some(tag.to_string());
        self.publish(message).await
    }

    pub async fn publish_pattern(&self, pattern: &str, keys: Vec<String>) -> CachetResult<()> {
        let mut message = ChangeMessage::new(ChangeKind::Pattern, self.origin, keys);
        message.pattern = Some(pattern.to_string());
        self.publish(message).await
    }

    async fn publish(&self, message: ChangeMessage) -> CachetResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let payload = serde_json::to_string(&message).map_err(|e| SerializationError::Encode {
            reason: e.to_string(),
        })?;
        self.publisher.publish(&self.channel, &payload).await
    }

    /// Stop the listener, wait for it, then close both connections.
    /// Safe to call more than once.
    pub async fn shutdown(&self) -> CachetResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Invalidation listener ended abnormally");
            }
        }
        self.subscriber.close().await?;
        self.publisher.close().await?;
        tracing::info!(channel = %self.channel, "Invalidation bus closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct Listener {
    origin: Uuid,
    local: Option<Arc<LocalCache<Vec<u8>>>>,
    events: Arc<EventEmitter>,
}

impl Listener {
    async fn run(self, mut messages: Subscription, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                next = messages.next() => {
                    match next {
                        Some(message) => self.handle(message),
                        None => {
                            tracing::warn!("Invalidation subscription ended");
                            break;
                        }
                    }
                }
            }
        }
        // Dropping the stream unsubscribes.
        drop(messages);
        tracing::debug!(origin = %self.origin, "Invalidation listener stopped");
    }

    fn handle(&self, raw: StoreMessage) {
        let message: ChangeMessage = match serde_json::from_str(&raw.payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(channel = %raw.channel, error = %e, "Ignoring malformed invalidation");
                self.events.emit(CacheEvent::error(CachetError::from(
                    SerializationError::Decode {
                        reason: e.to_string(),
                    },
                )));
                return;
            }
        };

        if message.origin == self.origin {
            return;
        }

        if let Some(local) = &self.local {
            self.evict(local, &message);
        }
        tracing::debug!(kind = ?message.kind, keys = message.keys.len(), "Applied remote invalidation");
        self.events.emit(CacheEvent::Invalidate(message.into_event()));
    }

    fn evict(&self, local: &LocalCache<Vec<u8>>, message: &ChangeMessage) {
        match message.kind {
            ChangeKind::Key => {
                if let Some(key) = &message.key {
                    local.delete(key);
                }
                local.delete_many(&message.keys);
            }
            ChangeKind::Tag => {
                local.delete_by_tag(&message.keys);
            }
            ChangeKind::Pattern => {
                local.delete_many(&message.keys);
                if let Some(pattern) = &message.pattern {
                    match GlobPattern::new(pattern) {
                        Ok(glob) => {
                            local.delete_by_pattern(&glob);
                        }
                        Err(e) => tracing::warn!(pattern = %pattern, error = %e, "Bad pattern in invalidation"),
                    }
                }
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
