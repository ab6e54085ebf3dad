//! Process-local store.
//!
//! Behaves like a single Redis node: values and sets share one keyspace,
//! expiry is lazy (checked on access), and pub/sub is fan-out over tokio
//! broadcast channels. Handles produced by [`StoreClient::duplicate`] share
//! the data but have their own open/closed state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cachet_core::{CachetResult, StoreError};
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::{StoreClient, StoreMessage, StoreOp, Subscription};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Debug, Default)]
struct Shared {
    data: Mutex<HashMap<String, Slot>>,
    channels: Mutex<HashMap<String, broadcast::Sender<StoreMessage>>>,
}

/// In-memory [`StoreClient`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data().values().filter(|slot| slot.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` exists and has not expired.
    pub fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        self.data().get(key).is_some_and(|slot| slot.is_live(now))
    }

    /// Remaining lifetime of `key`. `None` when absent or without expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.data()
            .get(key)
            .filter(|slot| slot.is_live(now))
            .and_then(|slot| slot.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Live keys starting with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .data()
            .iter()
            .filter(|(k, slot)| k.starts_with(prefix) && slot.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of open subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.shared
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn data(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.shared.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> CachetResult<()> {
        if self.is_closed() {
            return Err(StoreError::Closed.into());
        }
        Ok(())
    }

    fn apply(data: &mut HashMap<String, Slot>, op: StoreOp, now: Instant) -> CachetResult<()> {
        match op {
            StoreOp::Set { key, value, ttl } => {
                write_bytes(data, key, value, ttl, now);
            }
            StoreOp::Expire { key, ttl } => {
                expire_in(data, &key, ttl, now);
            }
            StoreOp::Del { keys } => {
                for key in keys {
                    data.remove(&key);
                }
            }
            StoreOp::SAdd { key, members } => {
                set_for_write(data, &key, now)?.extend(members);
            }
            StoreOp::SRem { key, members } => {
                remove_members(data, &key, &members, now)?;
            }
        }
        Ok(())
    }
}

fn write_bytes(
    data: &mut HashMap<String, Slot>,
    key: String,
    value: Vec<u8>,
    ttl: Option<Duration>,
    now: Instant,
) {
    data.insert(
        key,
        Slot {
            value: Value::Bytes(value),
            expires_at: ttl.map(|ttl| now + ttl),
        },
    );
}

fn expire_in(data: &mut HashMap<String, Slot>, key: &str, ttl: Duration, now: Instant) -> bool {
    match data.get_mut(key) {
        Some(slot) if slot.is_live(now) => {
            slot.expires_at = Some(now + ttl);
            true
        }
        _ => false,
    }
}

fn wrong_type(command: &str, key: &str) -> StoreError {
    StoreError::Command {
        command: command.to_string(),
        reason: format!("WRONGTYPE key {key} holds the wrong kind of value"),
    }
}

fn set_for_write<'a>(
    data: &'a mut HashMap<String, Slot>,
    key: &str,
    now: Instant,
) -> CachetResult<&'a mut HashSet<String>> {
    if data.get(key).is_some_and(|slot| !slot.is_live(now)) {
        data.remove(key);
    }
    let slot = data.entry(key.to_string()).or_insert_with(|| Slot {
        value: Value::Set(HashSet::new()),
        expires_at: None,
    });
    match &mut slot.value {
        Value::Set(set) => Ok(set),
        Value::Bytes(_) => Err(wrong_type("SADD", key).into()),
    }
}

fn remove_members(
    data: &mut HashMap<String, Slot>,
    key: &str,
    members: &[String],
    now: Instant,
) -> CachetResult<u64> {
    let Some(slot) = data.get_mut(key).filter(|slot| slot.is_live(now)) else {
        return Ok(0);
    };
    let Value::Set(set) = &mut slot.value else {
        return Err(wrong_type("SREM", key).into());
    };
    let removed = members.iter().filter(|m| set.remove(m.as_str())).count() as u64;
    if set.is_empty() {
        data.remove(key);
    }
    Ok(removed)
}

#[async_trait]
impl StoreClient for InMemoryStore {
    async fn get(&self, key: &str) -> CachetResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut data = self.data();
        if data.get(key).is_some_and(|slot| !slot.is_live(now)) {
            data.remove(key);
            return Ok(None);
        }
        match data.get(key).map(|slot| &slot.value) {
            Some(Value::Bytes(bytes)) => Ok(Some(bytes.clone())),
            Some(Value::Set(_)) => Err(wrong_type("GET", key).into()),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CachetResult<()> {
        self.ensure_open()?;
        write_bytes(&mut self.data(), key.to_string(), value.to_vec(), ttl, Instant::now());
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CachetResult<bool> {
        self.ensure_open()?;
        Ok(expire_in(&mut self.data(), key, ttl, Instant::now()))
    }

    async fn del(&self, keys: &[String]) -> CachetResult<u64> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut data = self.data();
        let removed = keys
            .iter()
            .filter_map(|k| data.remove(k))
            .filter(|slot| slot.is_live(now))
            .count();
        Ok(removed as u64)
    }

    async fn mget(&self, keys: &[String]) -> CachetResult<Vec<Option<Vec<u8>>>> {
        self.ensure_open()?;
        let now = Instant::now();
        let data = self.data();
        Ok(keys
            .iter()
            .map(|k| match data.get(k) {
                Some(Slot {
                    value: Value::Bytes(bytes),
                    expires_at,
                }) if expires_at.map_or(true, |at| now < at) => Some(bytes.clone()),
                _ => None,
            })
            .collect())
    }

    async fn mset(&self, entries: &[(String, Vec<u8>)]) -> CachetResult<()> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut data = self.data();
        for (key, value) in entries {
            write_bytes(&mut data, key.clone(), value.clone(), None, now);
        }
        Ok(())
    }

    async fn pipeline(&self, ops: Vec<StoreOp>) -> CachetResult<()> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut data = self.data();
        for op in ops {
            Self::apply(&mut data, op, now)?;
        }
        Ok(())
    }

    async fn incr(&self, key: &str) -> CachetResult<i64> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut data = self.data();
        let (current, expires_at) = match data.get(key) {
            Some(slot) if slot.is_live(now) => match &slot.value {
                Value::Bytes(bytes) => {
                    let parsed = std::str::from_utf8(bytes)
                        .ok()
                        .and_then(|s| s.parse::<i64>().ok())
                        .ok_or_else(|| StoreError::Command {
                            command: "INCR".to_string(),
                            reason: format!("value at {key} is not an integer"),
                        })?;
                    (parsed, slot.expires_at)
                }
                Value::Set(_) => return Err(wrong_type("INCR", key).into()),
            },
            _ => (0, None),
        };
        let next = current.checked_add(1).ok_or_else(|| StoreError::Command {
            command: "INCR".to_string(),
            reason: format!("increment would overflow at {key}"),
        })?;
        data.insert(
            key.to_string(),
            Slot {
                value: Value::Bytes(next.to_string().into_bytes()),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> CachetResult<u64> {
        self.ensure_open()?;
        let mut data = self.data();
        let set = set_for_write(&mut data, key, Instant::now())?;
        Ok(members.iter().filter(|m| set.insert((*m).clone())).count() as u64)
    }

    async fn srem(&self, key: &str, members: &[String]) -> CachetResult<u64> {
        self.ensure_open()?;
        remove_members(&mut self.data(), key, members, Instant::now())
    }

    async fn smembers(&self, key: &str) -> CachetResult<Vec<String>> {
        self.ensure_open()?;
        let now = Instant::now();
        let data = self.data();
        match data.get(key) {
            Some(slot) if slot.is_live(now) => match &slot.value {
                Value::Set(set) => {
                    let mut members: Vec<String> = set.iter().cloned().collect();
                    members.sort();
                    Ok(members)
                }
                Value::Bytes(_) => Err(wrong_type("SMEMBERS", key).into()),
            },
            _ => Ok(Vec::new()),
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> CachetResult<()> {
        self.ensure_open()?;
        let channels = self.shared.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = channels.get(channel) {
            // No receivers is not an error for pub/sub.
            let _ = sender.send(StoreMessage {
                channel: channel.to_string(),
                payload: message.to_string(),
            });
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> CachetResult<Subscription> {
        self.ensure_open()?;
        let receiver = self
            .shared
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let closed = Arc::clone(&self.closed);
        let stream = BroadcastStream::new(receiver)
            .take_while(move |_| futures_util::future::ready(!closed.load(Ordering::SeqCst)))
            .filter_map(|item| futures_util::future::ready(item.ok()));
        Ok(stream.boxed())
    }

    async fn duplicate(&self) -> CachetResult<Arc<dyn StoreClient>> {
        self.ensure_open()?;
        Ok(Arc::new(Self {
            shared: Arc::clone(&self.shared),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }

    async fn close(&self) -> CachetResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
