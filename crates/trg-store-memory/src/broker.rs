//! In-memory `QueueBroker`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use trg_store::{CoreError, QueueBroker};

const PUBSUB_CAPACITY: usize = 256;
const BLOCKING_POLL: Duration = Duration::from_millis(10);

#[derive(Default)]
struct Inner {
    queues: BTreeMap<String, VecDeque<Value>>,
    zsets: BTreeMap<String, Vec<(f64, String)>>,
    values: BTreeMap<String, (String, Option<Instant>)>,
    sets: BTreeMap<String, BTreeSet<String>>,
    hashes: BTreeMap<String, BTreeMap<String, String>>,
    channels: BTreeMap<String, broadcast::Sender<Value>>,
}

impl Inner {
    /// TTL entries are purged lazily, on any read or write of the key.
    fn purge_expired(&mut self, key: &str) {
        if let Some((_, Some(deadline))) = self.values.get(key) {
            if Instant::now() >= *deadline {
                self.values.remove(key);
            }
        }
    }

    fn channel(&mut self, name: &str) -> broadcast::Sender<Value> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(PUBSUB_CAPACITY).0)
            .clone()
    }
}

#[derive(Default)]
pub struct MemoryBroker {
    inner: Mutex<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, CoreError> {
        self.inner.lock().map_err(CoreError::upstream)
    }
}

#[async_trait]
impl QueueBroker for MemoryBroker {
    async fn push_work(&self, queue: &str, payload: &Value) -> Result<(), CoreError> {
        let mut inner = self.lock()?;
        inner
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_front(payload.clone());
        Ok(())
    }

    async fn pop_work(&self, queue: &str) -> Result<Option<Value>, CoreError> {
        let mut inner = self.lock()?;
        Ok(inner.queues.get_mut(queue).and_then(|q| q.pop_back()))
    }

    async fn pop_work_blocking(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Value>, CoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(v) = self.pop_work(queue).await? {
                return Ok(Some(v));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(BLOCKING_POLL).await;
        }
    }

    async fn priority_add(&self, name: &str, member: &str, score: f64) -> Result<(), CoreError> {
        let mut inner = self.lock()?;
        let zset = inner.zsets.entry(name.to_string()).or_default();
        // Re-adding an existing member updates its score, as a sorted set does.
        zset.retain(|(_, m)| m != member);
        zset.push((score, member.to_string()));
        Ok(())
    }

    async fn priority_pop_max(&self, name: &str) -> Result<Option<String>, CoreError> {
        let mut inner = self.lock()?;
        let Some(zset) = inner.zsets.get_mut(name) else {
            return Ok(None);
        };
        // Max by (score, member): score ties break on the lexically greatest
        // member, matching sorted-set pop-max ordering.
        let best = zset
            .iter()
            .enumerate()
            .max_by(|(_, (sa, ma)), (_, (sb, mb))| {
                sa.partial_cmp(sb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(ma.cmp(mb))
            })
            .map(|(i, _)| i);
        Ok(best.map(|i| zset.swap_remove(i).1))
    }

    async fn priority_len(&self, name: &str) -> Result<u64, CoreError> {
        let inner = self.lock()?;
        Ok(inner.zsets.get(name).map_or(0, |z| z.len() as u64))
    }

    async fn set_nx_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CoreError> {
        let mut inner = self.lock()?;
        inner.purge_expired(key);
        if inner.values.contains_key(key) {
            return Ok(false);
        }
        inner.values.insert(
            key.to_string(),
            (value.to_string(), Some(Instant::now() + ttl)),
        );
        Ok(true)
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>, CoreError> {
        let mut inner = self.lock()?;
        inner.purge_expired(key);
        Ok(inner.values.get(key).map(|(v, _)| v.clone()))
    }

    async fn delete_value(&self, key: &str) -> Result<(), CoreError> {
        let mut inner = self.lock()?;
        inner.values.remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &Value) -> Result<(), CoreError> {
        let sender = {
            let mut inner = self.lock()?;
            inner.channels.get(channel).cloned()
        };
        // No subscribers → the message is dropped, per the at-most-once
        // contract.
        if let Some(tx) = sender {
            let _ = tx.send(payload.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Value>, CoreError> {
        let mut rx = {
            let mut inner = self.lock()?;
            inner.channel(channel).subscribe()
        };
        let (tx, out) = mpsc::channel(PUBSUB_CAPACITY);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(v) => {
                        if tx.send(v).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(out)
    }

    async fn set_add(&self, set: &str, member: &str) -> Result<(), CoreError> {
        let mut inner = self.lock()?;
        inner
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, set: &str, member: &str) -> Result<(), CoreError> {
        let mut inner = self.lock()?;
        if let Some(s) = inner.sets.get_mut(set) {
            s.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>, CoreError> {
        let inner = self.lock()?;
        Ok(inner
            .sets
            .get(set)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn hash_set(&self, hash: &str, field: &str, value: &str) -> Result<(), CoreError> {
        let mut inner = self.lock()?;
        inner
            .hashes
            .entry(hash.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get(&self, hash: &str, field: &str) -> Result<Option<String>, CoreError> {
        let inner = self.lock()?;
        Ok(inner.hashes.get(hash).and_then(|h| h.get(field)).cloned())
    }

    async fn hash_delete(&self, hash: &str, field: &str) -> Result<(), CoreError> {
        let mut inner = self.lock()?;
        if let Some(h) = inner.hashes.get_mut(hash) {
            h.remove(field);
        }
        Ok(())
    }

    async fn healthcheck(&self) -> Result<(), CoreError> {
        Ok(())
    }
}
