//! In-process storage backend
//!
//! Keeps strings and hashes in memory and runs pub/sub over a broadcast
//! channel. Cloning shares the same data and bus, so two engines built on
//! clones of one backend behave like two service instances on one Redis.

use crate::backend::{BusMessage, MessageStream, StorageBackend};
use crate::error::{Result, StorageError};
use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

const BUS_CAPACITY: usize = 1024;

#[derive(Default)]
struct Store {
    strings: HashMap<String, Vec<u8>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

impl Store {
    fn contains(&self, key: &str) -> bool {
        self.strings.contains_key(key) || self.hashes.contains_key(key)
    }
}

#[derive(Clone)]
pub struct MemoryBackend {
    store: Arc<Mutex<Store>>,
    bus: broadcast::Sender<BusMessage>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            store: Arc::new(Mutex::new(Store::default())),
            bus,
        }
    }

    /// Every key currently stored, sorted
    pub fn keys(&self) -> Vec<String> {
        let store = self.store.lock();
        let mut keys: Vec<String> = store
            .strings
            .keys()
            .chain(store.hashes.keys())
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Raw value of a string key
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.store.lock().strings.get(key).cloned()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.store.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_replace(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let mut store = self.store.lock();
        if fields.is_empty() {
            store.hashes.remove(key);
        } else {
            store
                .hashes
                .insert(key.to_string(), fields.iter().cloned().collect());
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.store.lock().contains(key))
    }

    async fn set_bytes(&self, key: &str, data: &[u8]) -> Result<()> {
        self.store
            .lock()
            .strings
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn append(&self, key: &str, data: &[u8]) -> Result<()> {
        self.store
            .lock()
            .strings
            .entry(key.to_string())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        let store = self.store.lock();
        let Some(value) = store.strings.get(key) else {
            return Ok(Vec::new());
        };
        let len = value.len() as u64;
        if start >= len || start > end {
            return Ok(Vec::new());
        }
        let end = end.min(len - 1);
        Ok(value[start as usize..=end as usize].to_vec())
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<()> {
        let mut store = self.store.lock();
        for key in keys {
            store.strings.remove(key);
            store.hashes.remove(key);
        }
        Ok(())
    }

    async fn rename_keys(&self, pairs: &[(String, String)]) -> Result<()> {
        let mut store = self.store.lock();
        if let Some((missing, _)) = pairs.iter().find(|(from, _)| !store.contains(from)) {
            return Err(StorageError::Io(Box::new(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such key: {missing}"),
            ))));
        }
        for (from, to) in pairs {
            if let Some(value) = store.strings.remove(from) {
                store.hashes.remove(to);
                store.strings.insert(to.clone(), value);
            } else if let Some(value) = store.hashes.remove(from) {
                store.strings.remove(to);
                store.hashes.insert(to.clone(), value);
            }
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        // No receivers is not an error, same as PUBLISH returning 0
        let receivers = self
            .bus
            .send(BusMessage {
                channel: channel.to_string(),
                payload: payload.to_string(),
            })
            .unwrap_or(0);
        debug!(channel, payload, receivers, "Published notification");
        Ok(())
    }

    async fn subscribe(&self, channels: &[&str]) -> Result<MessageStream> {
        let wanted: Vec<String> = channels.iter().map(|c| c.to_string()).collect();
        let rx = self.bus.subscribe();

        let messages = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => return Some((msg, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Memory bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |msg| {
            let keep = wanted.contains(&msg.channel);
            async move { keep }
        });
        Ok(messages.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_get_range() {
        let backend = MemoryBackend::new();
        backend.set_bytes("k", b"hello").await.unwrap();
        backend.append("k", b" world").await.unwrap();

        assert_eq!(backend.get_range("k", 0, 4).await.unwrap(), b"hello");
        assert_eq!(backend.get_range("k", 6, 100).await.unwrap(), b"world");
        assert!(backend.get_range("k", 11, 20).await.unwrap().is_empty());
        assert!(backend.get_range("missing", 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hash_replace_overwrites_all_fields() {
        let backend = MemoryBackend::new();
        backend
            .hash_replace("h", &[("a".into(), "1".into()), ("b".into(), "2".into())])
            .await
            .unwrap();
        backend
            .hash_replace("h", &[("c".into(), "3".into())])
            .await
            .unwrap();

        let fields = backend.hash_get_all("h").await.unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["c"], "3");
    }

    #[tokio::test]
    async fn test_rename_is_all_or_nothing() {
        let backend = MemoryBackend::new();
        backend.set_bytes("a", b"1").await.unwrap();

        let result = backend
            .rename_keys(&[("a".into(), "b".into()), ("missing".into(), "c".into())])
            .await;
        assert!(result.is_err());
        assert_eq!(backend.keys(), vec!["a"]);

        backend
            .rename_keys(&[("a".into(), "b".into())])
            .await
            .unwrap();
        assert_eq!(backend.keys(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_subscribe_filters_channels() {
        let backend = MemoryBackend::new();
        let mut messages = backend.subscribe(&["wanted"]).await.unwrap();

        backend.publish("other", "x").await.unwrap();
        backend.publish("wanted", "y").await.unwrap();

        let msg = messages.next().await.unwrap();
        assert_eq!(msg.channel, "wanted");
        assert_eq!(msg.payload, "y");
    }
}
