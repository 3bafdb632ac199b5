use async_trait::async_trait;
use futures_util::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands, RedisError, Script};
use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{PubSub, SharedStore, StoreError, Subscription, SUBSCRIPTION_BUFFER};

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.is_connection_refusal() || err.is_io_error() || err.is_timeout() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

/// Redis-backed shared store and pub/sub channel.
///
/// Commands go through one lazily opened `ConnectionManager`, which
/// reconnects on its own after the first successful connect. Every pattern
/// subscription gets a dedicated pub/sub connection owned by its pump task.
pub struct RedisStore {
    client: redis::Client,
    commands: OnceCell<ConnectionManager>,
    window_incr: Script,
}

// INCR and the expiry run as one script; every counter carries a TTL.
const WINDOW_INCR: &str = r"
local count = redis.call('INCR', KEYS[1])
if redis.call('TTL', KEYS[1]) == -1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
";

impl RedisStore {
    /// Parses `url` without connecting; the first command opens the connection.
    pub fn new(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Backend(format!("invalid redis url: {}", e)))?;
        Ok(Self {
            client,
            commands: OnceCell::new(),
            window_incr: Script::new(WINDOW_INCR),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let manager = self
            .commands
            .get_or_try_init(|| async { ConnectionManager::new(self.client.clone()).await })
            .await?;
        Ok(manager.clone())
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn incr_window(&self, key: &str, seconds: u64) -> Result<i64, StoreError> {
        let mut conn = self.connection().await?;
        let seconds = i64::try_from(seconds).unwrap_or(i64::MAX);
        Ok(self
            .window_incr
            .key(key)
            .arg(seconds)
            .invoke_async(&mut conn)
            .await?)
    }

    async fn add_scored(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn range_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        Ok(conn.zrangebyscore(key, min, max).await?)
    }

    async fn remove_range_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        Ok(conn.zrembyscore(key, min, max).await?)
    }

    async fn push_bounded(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let stop = isize::try_from(max_len).unwrap_or(isize::MAX) - 1;
        let _: () = redis::pipe()
            .atomic()
            .lpush(key, value)
            .ignore()
            .ltrim(key, 0, stop)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn list_head(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        Ok(conn.lrange(key, 0, stop).await?)
    }

    async fn add_member(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.sadd(key, member).await?;
        Ok(())
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.srem(key, member).await?;
        Ok(())
    }

    async fn members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        Ok(conn.smembers(key).await?)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl PubSub for RedisStore {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: i64 = conn.publish(topic, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;
        debug!("Subscribed to redis pattern {}", pattern);

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let pattern = pattern.to_string();

        let pump = tokio::spawn(async move {
            {
                let stream = pubsub.on_message();
                tokio::pin!(stream);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        msg = stream.next() => {
                            let Some(msg) = msg else {
                                warn!("Redis pub/sub stream ended for {}", pattern);
                                break;
                            };
                            let topic = msg.get_channel_name().to_string();
                            match msg.get_payload::<String>() {
                                Ok(payload) => {
                                    if tx.send((topic, payload)).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => warn!("Dropping non-text payload on {}: {}", topic, e),
                            }
                        }
                    }
                }
            }

            if token.is_cancelled() {
                if let Err(e) = pubsub.punsubscribe(&pattern).await {
                    warn!("Failed to unsubscribe from {}: {}", pattern, e);
                }
            }
            // Dropping `pubsub` here releases the dedicated connection.
        });

        Ok(Subscription::new(rx, cancel, pump))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        SharedStore::ping(self).await
    }
}
