//! Storage engine: streaming object IO, metadata, and notifications

use crate::backend::StorageBackend;
use crate::error::Result;
use crate::ids::{is_map_id, map_key, meta_key, new_script_id, pure_id, script_key};
use crate::metadata::Metadata;
use crate::notify::{Listener, NotificationKind, Observers, Subscription};
use crate::types::{ByteStream, ObjectStream, ReadOutcome};
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, Stream, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Size of one range read on the streaming read path
pub const READ_CHUNK_SIZE: u64 = 16 * 1024;

pub struct StorageEngine {
    backend: Arc<dyn StorageBackend>,
    observers: Arc<Observers>,
    _listener: Listener,
}

impl StorageEngine {
    /// Build an engine and start its notification listener.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        let observers = Arc::new(Observers::default());
        let listener = Listener::spawn(backend.clone(), Arc::downgrade(&observers));
        Self {
            backend,
            observers,
            _listener: listener,
        }
    }

    /// Metadata for any form of an id, `None` when the object does not exist
    pub async fn get_metadata(&self, id: &str) -> Result<Option<Metadata>> {
        let fields = self.backend.hash_get_all(&meta_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(Metadata::from_stored(fields)))
    }

    /// Open a lazy, chunked read of `id`.
    ///
    /// With `since`, an object whose `lastChanged` is not newer is reported as
    /// `NotModified` without reading any of its body.
    pub async fn get_object_stream(
        &self,
        id: &str,
        with_metadata: bool,
        since: Option<i64>,
    ) -> Result<ReadOutcome> {
        let mut metadata = None;
        if with_metadata || since.is_some() {
            match self.get_metadata(id).await? {
                Some(meta) => metadata = Some(meta),
                None => return Ok(ReadOutcome::NotFound),
            }
        }

        if let (Some(since), Some(meta)) = (since, metadata.as_ref()) {
            if meta.is_unchanged_since(since) {
                debug!(id, since, "Object not modified");
                return Ok(ReadOutcome::NotModified);
            }
        }

        // Metadata belongs to the script, so it says nothing about a map's presence
        if (metadata.is_none() || is_map_id(id)) && !self.backend.exists(id).await? {
            return Ok(ReadOutcome::NotFound);
        }

        let body = range_reader(self.backend.clone(), id.to_string(), READ_CHUNK_SIZE).boxed();
        Ok(ReadOutcome::Stream(ObjectStream::new(id, metadata, body)))
    }

    /// Open a writer for `id`, or for a freshly generated id when `None`
    pub fn put_object_stream(&self, id: Option<String>, metadata: Metadata) -> ObjectWriter {
        ObjectWriter {
            backend: self.backend.clone(),
            observers: self.observers.clone(),
            id: id.unwrap_or_else(new_script_id),
            metadata: Some(metadata),
            written: 0,
        }
    }

    /// Remove an object, its map, and its metadata, then announce the deletion.
    ///
    /// Failures are logged and swallowed; deletion is fire-and-forget.
    pub async fn delete_object(&self, id: &str) {
        let keys = vec![meta_key(id), script_key(id), map_key(id)];
        match self.backend.delete_keys(&keys).await {
            Ok(()) => {
                info!(id, "Deleted object");
                self.publish(NotificationKind::Deleted, id).await;
            }
            Err(e) => warn!(id, error = %e, "Failed to delete object"),
        }
    }

    /// Move the object stored under `from` onto the identity `to`.
    ///
    /// Metadata, script bytes, and (when present) the map move in one atomic
    /// step; `from` is announced as deleted afterwards.
    pub async fn rename_object(&self, from: &str, to: &str) -> Result<()> {
        let mut pairs = vec![
            (meta_key(from), meta_key(to)),
            (script_key(from), script_key(to)),
        ];
        if self.backend.exists(&map_key(from)).await? {
            pairs.push((map_key(from), map_key(to)));
        }
        self.backend.rename_keys(&pairs).await?;
        info!(from, to, "Renamed object");
        self.publish(NotificationKind::Deleted, from).await;
        Ok(())
    }

    /// Call `handler` with the id of every object written
    pub fn on_change(&self, handler: impl Fn(&str) + Send + Sync + 'static) -> Subscription {
        self.observers.register(NotificationKind::Changed, handler)
    }

    /// Call `handler` with the id of every object deleted or renamed away
    pub fn on_deleted(&self, handler: impl Fn(&str) + Send + Sync + 'static) -> Subscription {
        self.observers.register(NotificationKind::Deleted, handler)
    }

    async fn publish(&self, kind: NotificationKind, id: &str) {
        publish(self.backend.as_ref(), &self.observers, kind, id).await;
    }
}

/// Publish on the bus and dispatch to local observers immediately. The echo
/// later delivered by the listener repeats the same notification.
async fn publish(
    backend: &dyn StorageBackend,
    observers: &Observers,
    kind: NotificationKind,
    id: &str,
) {
    if let Err(e) = backend.publish(kind.channel(), id).await {
        warn!(id, ?kind, error = %e, "Failed to publish notification");
    }
    observers.dispatch(kind, id);
}

/// Lazy sequence of bounded range reads. Dropping it stops further reads.
fn range_reader(
    backend: Arc<dyn StorageBackend>,
    key: String,
    chunk_size: u64,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    stream::try_unfold(
        (backend, key, 0u64),
        move |(backend, key, offset)| async move {
            let end = offset + chunk_size - 1;
            let chunk = backend.get_range(&key, offset, end).await?;
            if chunk.is_empty() {
                return Ok::<_, std::io::Error>(None);
            }
            let next = offset + chunk.len() as u64;
            Ok(Some((Bytes::from(chunk), (backend, key, next))))
        },
    )
}

/// Incremental writer for one object.
///
/// The first write commits metadata (with a fresh `lastChanged`) and replaces
/// any earlier bytes; later writes append. `finish` announces the change.
pub struct ObjectWriter {
    backend: Arc<dyn StorageBackend>,
    observers: Arc<Observers>,
    id: String,
    /// Pending until the first write commits it
    metadata: Option<Metadata>,
    written: u64,
}

impl ObjectWriter {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if let Some(metadata) = self.metadata.take() {
            self.commit_metadata(metadata).await?;
            self.backend.set_bytes(&self.id, chunk).await?;
        } else if !chunk.is_empty() {
            self.backend.append(&self.id, chunk).await?;
        }
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Complete the write and publish a change notification. Returns the id.
    pub async fn finish(mut self) -> Result<String> {
        if self.metadata.is_some() {
            self.write(&[]).await?;
        }
        debug!(id = %self.id, bytes = self.written, "Object written");
        publish(
            self.backend.as_ref(),
            &self.observers,
            NotificationKind::Changed,
            &self.id,
        )
        .await;
        Ok(self.id)
    }

    /// Drive a whole byte stream into the object, then finish
    pub async fn write_stream(mut self, mut body: ByteStream) -> std::io::Result<String> {
        while let Some(chunk) = body.next().await {
            self.write(&chunk?).await?;
        }
        Ok(self.finish().await?)
    }

    async fn commit_metadata(&self, mut metadata: Metadata) -> Result<()> {
        // Maps share the script's metadata hash and never overwrite it
        if is_map_id(&self.id) {
            return Ok(());
        }
        let key = meta_key(&self.id);
        let previous = self
            .backend
            .hash_get_all(&key)
            .await?
            .get(crate::metadata::LAST_CHANGED)
            .and_then(|v| v.parse::<i64>().ok());
        let now = Utc::now().timestamp_millis();
        metadata.set_last_changed(previous.map_or(now, |p| p.max(now)));
        self.backend.hash_replace(&key, &metadata.to_fields()).await?;
        debug!(id = %self.id, pure_id = pure_id(&self.id), "Committed metadata");
        Ok(())
    }
}
