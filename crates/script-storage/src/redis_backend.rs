//! Redis-backed storage

use crate::backend::{BusMessage, MessageStream, StorageBackend};
use crate::error::Result;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::{debug, info};

/// Storage backend over a Redis server.
///
/// Commands share one multiplexed connection; every subscription gets its own
/// dedicated pub/sub connection.
pub struct RedisBackend {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisBackend {
    /// Connect to `url` (e.g. `redis://127.0.0.1/`)
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(url = %url, "Connected to Redis");
        Ok(Self { client, conn })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl StorageBackend for RedisBackend {
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let fields: HashMap<String, String> = self.conn().hgetall(key).await?;
        Ok(fields)
    }

    async fn hash_replace(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic().del(key).ignore();
        if !fields.is_empty() {
            pipe.hset_multiple(key, fields).ignore();
        }
        let _: () = pipe.query_async(&mut self.conn()).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let exists: bool = self.conn().exists(key).await?;
        Ok(exists)
    }

    async fn set_bytes(&self, key: &str, data: &[u8]) -> Result<()> {
        let _: () = self.conn().set(key, data).await?;
        Ok(())
    }

    async fn append(&self, key: &str, data: &[u8]) -> Result<()> {
        let _: i64 = self.conn().append(key, data).await?;
        Ok(())
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        let bytes: Vec<u8> = self
            .conn()
            .getrange(key, start as isize, end as isize)
            .await?;
        Ok(bytes)
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in keys {
            pipe.del(key).ignore();
        }
        let _: () = pipe.query_async(&mut self.conn()).await?;
        Ok(())
    }

    async fn rename_keys(&self, pairs: &[(String, String)]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (from, to) in pairs {
            pipe.rename(from, to).ignore();
        }
        let _: () = pipe.query_async(&mut self.conn()).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let receivers: i64 = self.conn().publish(channel, payload).await?;
        debug!(channel, payload, receivers, "Published notification");
        Ok(())
    }

    async fn subscribe(&self, channels: &[&str]) -> Result<MessageStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(*channel).await?;
        }

        let messages = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            Some(BusMessage {
                channel: msg.get_channel_name().to_string(),
                payload,
            })
        });
        Ok(messages.boxed())
    }
}
