//! Backend seam between the storage engine and the durable store

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;

/// A message received from the pub/sub bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

/// Messages from a live subscription. Ends when the connection drops.
pub type MessageStream = BoxStream<'static, BusMessage>;

/// Key/value + hash + pub/sub primitives the engine is built on.
///
/// Multi-key operations must be atomic: a reader never observes half of a
/// delete or rename.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// All fields of a hash; empty when the hash does not exist
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Replace a hash with exactly `fields`
    async fn hash_replace(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Overwrite a string value
    async fn set_bytes(&self, key: &str, data: &[u8]) -> Result<()>;

    async fn append(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Bytes `start..=end` of a string value; shorter or empty past the end
    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Vec<u8>>;

    /// Remove every key in one atomic step. Missing keys are ignored.
    async fn delete_keys(&self, keys: &[String]) -> Result<()>;

    /// Rename every `(from, to)` pair in one atomic step, replacing `to`
    async fn rename_keys(&self, pairs: &[(String, String)]) -> Result<()>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Open a dedicated subscription to `channels`
    async fn subscribe(&self, channels: &[&str]) -> Result<MessageStream>;
}
