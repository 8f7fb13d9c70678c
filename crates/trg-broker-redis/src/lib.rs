//! Redis queue broker.
//!
//! All queue/key commands go through one auto-reconnecting
//! `ConnectionManager`. Pub/sub needs a dedicated connection per
//! subscription, so `subscribe` opens one from the kept `Client` and pumps
//! messages into an mpsc receiver; payloads that fail to parse as JSON are
//! dropped, matching the best-effort channel contract.

use std::num::NonZeroUsize;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde_json::Value;
use tokio::sync::mpsc;

use trg_store::{CoreError, QueueBroker};

const SUBSCRIBE_BUFFER: usize = 256;

pub struct RedisBroker {
    client: Client,
    conn: ConnectionManager,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).context("invalid redis url")?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .context("failed to connect to Redis")?;
        Ok(Self { client, conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn upstream(err: redis::RedisError) -> CoreError {
    CoreError::upstream(err)
}

fn encode(payload: &Value) -> String {
    payload.to_string()
}

fn decode(raw: &str) -> Result<Value, CoreError> {
    serde_json::from_str(raw).map_err(CoreError::upstream)
}

#[async_trait]
impl QueueBroker for RedisBroker {
    async fn push_work(&self, queue: &str, payload: &Value) -> Result<(), CoreError> {
        let mut conn = self.conn();
        conn.lpush::<_, _, ()>(queue, encode(payload))
            .await
            .map_err(upstream)
    }

    async fn pop_work(&self, queue: &str) -> Result<Option<Value>, CoreError> {
        let mut conn = self.conn();
        let raw: Option<String> = conn
            .rpop(queue, None::<NonZeroUsize>)
            .await
            .map_err(upstream)?;
        raw.as_deref().map(decode).transpose()
    }

    async fn pop_work_blocking(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Value>, CoreError> {
        let mut conn = self.conn();
        let raw: Option<(String, String)> = conn
            .brpop(queue, timeout.as_secs_f64())
            .await
            .map_err(upstream)?;
        raw.map(|(_, payload)| decode(&payload)).transpose()
    }

    async fn priority_add(&self, name: &str, member: &str, score: f64) -> Result<(), CoreError> {
        let mut conn = self.conn();
        conn.zadd::<_, _, _, ()>(name, member, score)
            .await
            .map_err(upstream)
    }

    async fn priority_pop_max(&self, name: &str) -> Result<Option<String>, CoreError> {
        let mut conn = self.conn();
        let popped: Vec<(String, f64)> = conn.zpopmax(name, 1).await.map_err(upstream)?;
        Ok(popped.into_iter().next().map(|(member, _)| member))
    }

    async fn priority_len(&self, name: &str) -> Result<u64, CoreError> {
        let mut conn = self.conn();
        conn.zcard(name).await.map_err(upstream)
    }

    async fn set_nx_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CoreError> {
        let mut conn = self.conn();
        // SET NX answers OK when the key was written, nil when it existed.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(upstream)?;
        Ok(reply.is_some())
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>, CoreError> {
        let mut conn = self.conn();
        conn.get(key).await.map_err(upstream)
    }

    async fn delete_value(&self, key: &str) -> Result<(), CoreError> {
        let mut conn = self.conn();
        conn.del::<_, ()>(key).await.map_err(upstream)
    }

    async fn publish(&self, channel: &str, payload: &Value) -> Result<(), CoreError> {
        let mut conn = self.conn();
        conn.publish::<_, _, ()>(channel, encode(payload))
            .await
            .map_err(upstream)
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Value>, CoreError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(upstream)?;
        pubsub.subscribe(channel).await.map_err(upstream)?;

        let (tx, rx) = mpsc::channel(SUBSCRIBE_BUFFER);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let Ok(raw) = msg.get_payload::<String>() else {
                    continue;
                };
                let Ok(value) = serde_json::from_str::<Value>(&raw) else {
                    continue;
                };
                if tx.send(value).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn set_add(&self, set: &str, member: &str) -> Result<(), CoreError> {
        let mut conn = self.conn();
        conn.sadd::<_, _, ()>(set, member).await.map_err(upstream)
    }

    async fn set_remove(&self, set: &str, member: &str) -> Result<(), CoreError> {
        let mut conn = self.conn();
        conn.srem::<_, _, ()>(set, member).await.map_err(upstream)
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>, CoreError> {
        let mut conn = self.conn();
        conn.smembers(set).await.map_err(upstream)
    }

    async fn hash_set(&self, hash: &str, field: &str, value: &str) -> Result<(), CoreError> {
        let mut conn = self.conn();
        conn.hset::<_, _, _, ()>(hash, field, value)
            .await
            .map_err(upstream)
    }

    async fn hash_get(&self, hash: &str, field: &str) -> Result<Option<String>, CoreError> {
        let mut conn = self.conn();
        conn.hget(hash, field).await.map_err(upstream)
    }

    async fn hash_delete(&self, hash: &str, field: &str) -> Result<(), CoreError> {
        let mut conn = self.conn();
        conn.hdel::<_, _, ()>(hash, field).await.map_err(upstream)
    }

    async fn healthcheck(&self) -> Result<(), CoreError> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(upstream)?;
        Ok(())
    }
}
