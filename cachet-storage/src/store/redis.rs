//! Redis-backed store.
//!
//! Commands go over one multiplexed connection. Each subscription opens a
//! dedicated pub/sub connection, since a subscribed Redis connection cannot
//! issue regular commands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, RedisError};
use async_trait::async_trait;
use cachet_core::{CachetError, CachetResult, StoreError};
use futures_util::StreamExt;

use super::{StoreClient, StoreMessage, StoreOp, Subscription};

/// [`StoreClient`] over a Redis server.
pub struct RedisStore {
    client: Client,
    conn: MultiplexedConnection,
    closed: AtomicBool,
}

fn command_error(command: &str) -> impl FnOnce(RedisError) -> CachetError + '_ {
    move |e| {
        StoreError::Command {
            command: command.to_string(),
            reason: e.to_string(),
        }
        .into()
    }
}

fn connection_error(e: RedisError) -> CachetError {
    StoreError::Connection {
        reason: e.to_string(),
    }
    .into()
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://localhost:6379`).
    pub async fn connect(url: &str) -> CachetResult<Self> {
        let client = Client::open(url).map_err(connection_error)?;
        Self::from_client(client).await
    }

    pub async fn from_client(client: Client) -> CachetResult<Self> {
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(connection_error)?;
        tracing::info!(addr = %client.get_connection_info().addr, "Connected to Redis");
        Ok(Self {
            client,
            conn,
            closed: AtomicBool::new(false),
        })
    }

    fn conn(&self) -> CachetResult<MultiplexedConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed.into());
        }
        Ok(self.conn.clone())
    }
}

#[async_trait]
impl StoreClient for RedisStore {
    async fn get(&self, key: &str) -> CachetResult<Option<Vec<u8>>> {
        let mut conn = self.conn()?;
        ::redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_error("GET"))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CachetResult<()> {
        let mut conn = self.conn()?;
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd
            .query_async(&mut conn)
            .await
            .map_err(command_error("SET"))?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CachetResult<bool> {
        let mut conn = self.conn()?;
        let updated: i64 = ::redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(command_error("PEXPIRE"))?;
        Ok(updated == 1)
    }

    async fn del(&self, keys: &[String]) -> CachetResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        ::redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(command_error("DEL"))
    }

    async fn mget(&self, keys: &[String]) -> CachetResult<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn()?;
        ::redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(command_error("MGET"))
    }

    async fn mset(&self, entries: &[(String, Vec<u8>)]) -> CachetResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let mut cmd = ::redis::cmd("MSET");
        for (key, value) in entries {
            cmd.arg(key).arg(value.as_slice());
        }
        let _: () = cmd
            .query_async(&mut conn)
            .await
            .map_err(command_error("MSET"))?;
        Ok(())
    }

    async fn pipeline(&self, ops: Vec<StoreOp>) -> CachetResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let mut pipe = ::redis::pipe();
        for op in &ops {
            match op {
                StoreOp::Set { key, value, ttl } => {
                    let cmd = pipe.cmd("SET").arg(key).arg(value.as_slice());
                    if let Some(ttl) = ttl {
                        cmd.arg("PX").arg(millis(*ttl));
                    }
                    cmd.ignore();
                }
                StoreOp::Expire { key, ttl } => {
                    pipe.cmd("PEXPIRE").arg(key).arg(millis(*ttl)).ignore();
                }
                StoreOp::Del { keys } if !keys.is_empty() => {
                    pipe.cmd("DEL").arg(keys).ignore();
                }
                StoreOp::SAdd { key, members } if !members.is_empty() => {
                    pipe.cmd("SADD").arg(key).arg(members).ignore();
                }
                StoreOp::SRem { key, members } if !members.is_empty() => {
                    pipe.cmd("SREM").arg(key).arg(members).ignore();
                }
                _ => {}
            }
        }
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(command_error("PIPELINE"))?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> CachetResult<i64> {
        let mut conn = self.conn()?;
        ::redis::cmd("INCR")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_error("INCR"))
    }

    async fn sadd(&self, key: &str, members: &[String]) -> CachetResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        ::redis::cmd("SADD")
            .arg(key)
            .arg(members)
            .query_async(&mut conn)
            .await
            .map_err(command_error("SADD"))
    }

    async fn srem(&self, key: &str, members: &[String]) -> CachetResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        ::redis::cmd("SREM")
            .arg(key)
            .arg(members)
            .query_async(&mut conn)
            .await
            .map_err(command_error("SREM"))
    }

    async fn smembers(&self, key: &str) -> CachetResult<Vec<String>> {
        let mut conn = self.conn()?;
        ::redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_error("SMEMBERS"))
    }

    async fn publish(&self, channel: &str, message: &str) -> CachetResult<()> {
        let mut conn = self.conn()?;
        let _: i64 = ::redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut conn)
            .await
            .map_err(command_error("PUBLISH"))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> CachetResult<Subscription> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed.into());
        }
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(connection_error)?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(command_error("SUBSCRIBE"))?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(StoreMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                }),
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping non-text pub/sub payload");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn duplicate(&self) -> CachetResult<Arc<dyn StoreClient>> {
        let store = Self::from_client(self.client.clone()).await?;
        Ok(Arc::new(store))
    }

    async fn close(&self) -> CachetResult<()> {
        // The multiplexed connection shuts down once its last clone drops.
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Live-server checks. Run with
/// `REDIS_URL=redis://127.0.0.1/ cargo test --features redis -- --ignored`.
#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn connect() -> RedisStore {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
        RedisStore::connect(&url).await.expect("redis should be reachable")
    }

    fn scratch(suffix: &str) -> String {
        format!("cachet-test:{}:{suffix}", Uuid::now_v7())
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn test_pipeline_maps_each_op() {
        let store = connect().await;
        let payload = scratch("payload");
        let doomed = scratch("doomed");
        let tags = scratch("tags");

        store.set(&doomed, b"bye", None).await.unwrap();
        store
            .pipeline(vec![
                StoreOp::Set {
                    key: payload.clone(),
                    value: b"hello".to_vec(),
                    ttl: None,
                },
                StoreOp::SAdd {
                    key: tags.clone(),
                    members: vec![payload.clone(), doomed.clone()],
                },
                StoreOp::SRem {
                    key: tags.clone(),
                    members: vec![doomed.clone()],
                },
                StoreOp::SAdd {
                    key: tags.clone(),
                    members: vec![],
                },
                StoreOp::Expire {
                    key: payload.clone(),
                    ttl: Duration::from_secs(30),
                },
                StoreOp::Del {
                    keys: vec![doomed.clone()],
                },
            ])
            .await
            .unwrap();

        assert_eq!(store.get(&payload).await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(store.get(&doomed).await.unwrap(), None);
        assert_eq!(store.smembers(&tags).await.unwrap(), vec![payload.clone()]);

        let mut conn = store.conn().unwrap();
        let pttl: i64 = ::redis::cmd("PTTL")
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .unwrap();
        assert!(pttl > 0 && pttl <= 30_000);

        store.del(&[payload, tags]).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn test_set_with_ttl_and_counters() {
        let store = connect().await;
        let key = scratch("short");
        let counter = scratch("version");

        store
            .set(&key, b"v", Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(store.get(&key).await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.get(&key).await.unwrap(), None);

        assert_eq!(store.incr(&counter).await.unwrap(), 1);
        assert_eq!(store.incr(&counter).await.unwrap(), 2);
        assert_eq!(store.get(&counter).await.unwrap(), Some(b"2".to_vec()));
        store.del(&[counter]).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn test_publish_reaches_subscriber() {
        let store = connect().await;
        let channel = scratch("channel");
        let mut messages = store.subscribe(&channel).await.unwrap();

        store.publish(&channel, "ping").await.unwrap();
        let message = tokio::time::timeout(Duration::from_secs(2), messages.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.channel, channel);
        assert_eq!(message.payload, "ping");

        store.close().await.unwrap();
        assert!(store.subscribe(&channel).await.is_err());
    }
}
