//! Read path: LRU cache in front of storage
//!
//! Stored objects are brotli compressed. Callers that want plain script text
//! get it decompressed on the fly, and that decompressed copy is cached under
//! its own key so the next reader skips the work.

use crate::streams::{capture_into_cache, decompress, once};
use script_lru_cache::ScriptCache;
use script_storage::{
    is_full_script_id, is_map_id, pure_id, Metadata, ObjectStream, ReadOutcome, Result, StorageEngine, Subscription,
    DECOMPRESSED_PREFIX,
};
use std::sync::Arc;
use tracing::debug;

pub type SharedCache = Arc<ScriptCache<Metadata>>;

pub struct FetchOrchestrator {
    storage: Arc<StorageEngine>,
    cache: Option<SharedCache>,
    _subscriptions: Vec<Subscription>,
}

/// Drop both cached variants of the object `id` refers to
fn invalidate(cache: &ScriptCache<Metadata>, id: &str) {
    let pure = pure_id(id);
    let raw = cache.remove(&format!("{}.js", pure));
    let decompressed = cache.remove(&format!("{}{}.js", DECOMPRESSED_PREFIX, pure));
    if raw || decompressed {
        debug!(id, pure, "Invalidated cached object");
    }
}

impl FetchOrchestrator {
    /// Wire a fetcher to `storage`. Without a cache every read goes to storage.
    pub fn new(storage: Arc<StorageEngine>, cache: Option<SharedCache>) -> Self {
        let mut subscriptions = Vec::new();
        if let Some(cache) = &cache {
            let changed = cache.clone();
            subscriptions.push(storage.on_change(move |id| invalidate(&changed, id)));
            let deleted = cache.clone();
            subscriptions.push(storage.on_deleted(move |id| invalidate(&deleted, id)));
        }
        Self {
            storage,
            cache,
            _subscriptions: subscriptions,
        }
    }

    pub fn cache(&self) -> Option<&SharedCache> {
        self.cache.as_ref()
    }

    /// Open a read of `id`, compressed unless `wants_decompressed`.
    ///
    /// A cached copy answers without touching storage, including the
    /// freshness check against `since`. On a miss the storage read is teed
    /// into the cache while the caller consumes it; an invalidation that
    /// lands before the read finishes keeps it out of the cache. Anything
    /// other than a full script id or a map id is not found.
    pub async fn get_read_stream(
        &self,
        id: &str,
        since: Option<i64>,
        wants_decompressed: bool,
    ) -> Result<ReadOutcome> {
        if is_map_id(id) {
            return self.storage.get_object_stream(id, false, None).await;
        }
        if !is_full_script_id(id) {
            debug!(id, "Not a script id");
            return Ok(ReadOutcome::NotFound);
        }

        let key = if wants_decompressed {
            format!("{}{}", DECOMPRESSED_PREFIX, id)
        } else {
            id.to_string()
        };

        if let Some(cache) = &self.cache {
            let (hit, needs_decompression) = match cache.get(&key) {
                Some(hit) => (Some(hit), false),
                None if wants_decompressed => (cache.get(id), true),
                None => (None, false),
            };

            if let Some(hit) = hit {
                if since.is_some_and(|since| hit.metadata.is_unchanged_since(since)) {
                    debug!(id, "Not modified (cached)");
                    return Ok(ReadOutcome::NotModified);
                }
                debug!(id, key = %key, needs_decompression, "Cache hit");
                let mut body = once(hit.data);
                if needs_decompression {
                    let generation = cache.generation(&key);
                    body = capture_into_cache(
                        decompress(body),
                        cache.clone(),
                        key,
                        hit.metadata.clone(),
                        generation,
                    );
                }
                return Ok(ReadOutcome::Stream(ObjectStream::new(
                    id,
                    Some(hit.metadata),
                    body,
                )));
            }
        }

        debug!(id, key = %key, "Cache miss");
        let generation = self.cache.as_ref().map(|cache| cache.generation(&key));
        let stream = match self.storage.get_object_stream(id, true, since).await? {
            ReadOutcome::Stream(stream) => stream,
            other => return Ok(other),
        };

        let stream = if wants_decompressed {
            stream.map_body(decompress)
        } else {
            stream
        };

        Ok(ReadOutcome::Stream(match (&self.cache, generation) {
            (Some(cache), Some(generation)) => {
                let metadata = stream.metadata.clone().unwrap_or_default();
                let cache = cache.clone();
                stream.map_body(|body| {
                    capture_into_cache(body, cache, key, metadata, generation)
                })
            }
            _ => stream,
        }))
    }

    /// Metadata for `id`, from the cached script when present
    pub async fn get_metadata(&self, id: &str) -> Result<Option<Metadata>> {
        if let Some(cached) = self
            .cache
            .as_ref()
            .and_then(|cache| cache.get(&format!("{}.js", pure_id(id))))
        {
            return Ok(Some(cached.metadata));
        }
        self.storage.get_metadata(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{strip, CompilePipeline, SizeLimits, StripWhitespace};
    use crate::streams::collect;
    use bytes::Bytes;
    use futures::StreamExt;
    use script_storage::{ByteStream, MemoryBackend, StorageBackend};
    use std::time::Duration;

    const SCRIPT: &[u8] = b"function greet ( who ) {\n  return 'hello ' + who ;\n}\n";

    struct Harness {
        backend: MemoryBackend,
        cache: SharedCache,
        fetcher: FetchOrchestrator,
        pipeline: CompilePipeline,
        _root: tempfile::TempDir,
    }

    fn harness_on(backend: &MemoryBackend) -> Harness {
        let storage = Arc::new(StorageEngine::new(Arc::new(backend.clone())));
        let cache = Arc::new(ScriptCache::new(1_000_000));
        let root = tempfile::tempdir().unwrap();
        Harness {
            backend: backend.clone(),
            cache: cache.clone(),
            fetcher: FetchOrchestrator::new(storage.clone(), Some(cache)),
            pipeline: CompilePipeline::new(
                storage,
                Arc::new(StripWhitespace),
                root.path().to_path_buf(),
                SizeLimits::default(),
            ),
            _root: root,
        }
    }

    fn harness() -> Harness {
        harness_on(&MemoryBackend::new())
    }

    /// Let the listener deliver bus echoes of earlier writes, so they cannot
    /// invalidate entries a test is about to populate
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn body(data: &'static [u8]) -> ByteStream {
        once(Bytes::from_static(data))
    }

    impl Harness {
        async fn ingest(&self, data: &'static [u8]) -> String {
            let id = self
                .pipeline
                .ingest_new(body(data), Some("text/javascript"), Metadata::new())
                .await
                .unwrap();
            settle().await;
            id
        }

        async fn read(&self, id: &str, wants_decompressed: bool) -> Vec<u8> {
            let stream = self
                .fetcher
                .get_read_stream(id, None, wants_decompressed)
                .await
                .unwrap()
                .into_stream()
                .unwrap();
            collect(stream.body).await.unwrap().to_vec()
        }

        /// Remove the stored keys behind the engine's back, so only the cache can answer
        async fn wipe_storage(&self) {
            let keys = self.backend.keys();
            self.backend.delete_keys(&keys).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_ingest_then_decompressed_read() {
        let h = harness();
        let id = h.ingest(SCRIPT).await;

        assert_eq!(h.read(&id, true).await, strip(SCRIPT));
        assert!(h.cache.contains(&format!("{}{}", DECOMPRESSED_PREFIX, id)));

        h.wipe_storage().await;
        assert_eq!(h.read(&id, true).await, strip(SCRIPT));
    }

    #[tokio::test]
    async fn test_compressed_read_is_brotli() {
        let h = harness();
        let id = h.ingest(SCRIPT).await;

        let compressed = h.read(&id, false).await;
        assert_ne!(compressed, strip(SCRIPT));
        let text = collect(decompress(once(Bytes::from(compressed)))).await.unwrap();
        assert_eq!(&text[..], &strip(SCRIPT)[..]);
        assert!(h.cache.contains(&id));
    }

    #[tokio::test]
    async fn test_raw_hit_decompresses_locally_and_caches() {
        let h = harness();
        let id = h.ingest(SCRIPT).await;
        h.read(&id, false).await;
        h.wipe_storage().await;

        let decompressed_key = format!("{}{}", DECOMPRESSED_PREFIX, id);
        assert!(!h.cache.contains(&decompressed_key));
        assert_eq!(h.read(&id, true).await, strip(SCRIPT));
        assert!(h.cache.contains(&decompressed_key));
    }

    #[tokio::test]
    async fn test_freshness_check_on_cached_object() {
        let h = harness();
        let id = h.ingest(SCRIPT).await;
        h.read(&id, true).await;
        let written_at = h
            .fetcher
            .get_metadata(&id)
            .await
            .unwrap()
            .unwrap()
            .last_changed()
            .unwrap();

        assert!(h
            .fetcher
            .get_read_stream(&id, Some(written_at + 1), true)
            .await
            .unwrap()
            .is_not_modified());
        assert!(h
            .fetcher
            .get_read_stream(&id, Some(written_at - 1), true)
            .await
            .unwrap()
            .into_stream()
            .is_some());
    }

    #[tokio::test]
    async fn test_freshness_check_on_storage() {
        let h = harness();
        let id = h.ingest(SCRIPT).await;
        h.cache.remove(&id);
        let written_at = h
            .fetcher
            .get_metadata(&id)
            .await
            .unwrap()
            .unwrap()
            .last_changed()
            .unwrap();

        assert!(h
            .fetcher
            .get_read_stream(&id, Some(written_at + 1), false)
            .await
            .unwrap()
            .is_not_modified());
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn test_patch_invalidates_warm_cache() {
        let h = harness();
        let id = h.ingest(b"var before = 1 ;").await;
        assert_eq!(h.read(&id, true).await, b"varbefore=1;");
        assert_eq!(h.cache.len(), 1);

        h.pipeline
            .patch(
                body(b"var after = 2 ;"),
                Some("text/javascript"),
                Metadata::new(),
                &id,
                None,
            )
            .await
            .unwrap();

        assert_eq!(h.read(&id, true).await, b"varafter=2;");
    }

    #[tokio::test]
    async fn test_patch_during_read_keeps_old_bytes_out_of_cache() {
        let h = harness();
        let id = h.ingest(b"var before = 1 ;").await;

        let mut stream = h
            .fetcher
            .get_read_stream(&id, None, true)
            .await
            .unwrap()
            .into_stream()
            .unwrap();
        let first = stream.body.next().await.unwrap().unwrap();

        h.pipeline
            .patch(
                body(b"var after = 2 ;"),
                Some("text/javascript"),
                Metadata::new(),
                &id,
                None,
            )
            .await
            .unwrap();

        assert!(first.starts_with(b"varbefore"));
        let _ = collect(stream.body).await;
        assert!(!h.cache.contains(&format!("{}{}", DECOMPRESSED_PREFIX, id)));
        assert_eq!(h.read(&id, true).await, b"varafter=2;");
    }

    #[tokio::test]
    async fn test_delete_during_read_keeps_old_bytes_out_of_cache() {
        let h = harness();
        let id = h.ingest(SCRIPT).await;

        let stream = h
            .fetcher
            .get_read_stream(&id, None, false)
            .await
            .unwrap()
            .into_stream()
            .unwrap();
        h.fetcher.storage.delete_object(&id).await;

        let _ = collect(stream.body).await;
        assert!(h.cache.is_empty());
        assert!(h
            .fetcher
            .get_read_stream(&id, None, false)
            .await
            .unwrap()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_ids_that_are_not_scripts() {
        let h = harness();
        let id = h.ingest(SCRIPT).await;
        let pure = pure_id(&id).to_string();

        for bad in [pure.clone(), format!("{}{}", DECOMPRESSED_PREFIX, id)] {
            assert!(h
                .fetcher
                .get_read_stream(&bad, None, false)
                .await
                .unwrap()
                .is_not_found());
        }
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn test_patch_on_other_instance_invalidates_eventually() {
        let backend = MemoryBackend::new();
        let writer = harness_on(&backend);
        let reader = harness_on(&backend);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let id = writer.ingest(b"var before = 1 ;").await;
        assert_eq!(reader.read(&id, true).await, b"varbefore=1;");

        writer
            .pipeline
            .patch(
                body(b"var after = 2 ;"),
                Some("text/javascript"),
                Metadata::new(),
                &id,
                None,
            )
            .await
            .unwrap();

        let refreshed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if reader.read(&id, true).await == b"varafter=2;" {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(refreshed.is_ok());
    }

    #[tokio::test]
    async fn test_not_found() {
        let h = harness();
        assert!(h
            .fetcher
            .get_read_stream("00-00000000-0000-4000-8000-000000000000.js", None, true)
            .await
            .unwrap()
            .is_not_found());
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn test_source_map_bypasses_cache() {
        let h = harness();
        let id = h.ingest(SCRIPT).await;
        let map_id = format!("{}.map", pure_id(&id));

        let compressed = h.read(&map_id, true).await;
        let map = collect(decompress(once(Bytes::from(compressed)))).await.unwrap();
        assert!(map.starts_with(b"{"));
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn test_metadata_prefers_cache() {
        let h = harness();
        let id = h.ingest(SCRIPT).await;
        h.read(&id, false).await;
        h.wipe_storage().await;

        assert!(h.fetcher.get_metadata(&id).await.unwrap().is_some());
        assert!(h
            .fetcher
            .get_metadata(&format!("{}.map", pure_id(&id)))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_without_cache() {
        let backend = MemoryBackend::new();
        let h = harness_on(&backend);
        let id = h.ingest(SCRIPT).await;

        let storage = Arc::new(StorageEngine::new(Arc::new(backend.clone())));
        let fetcher = FetchOrchestrator::new(storage, None);
        let stream = fetcher
            .get_read_stream(&id, None, true)
            .await
            .unwrap()
            .into_stream()
            .unwrap();
        assert_eq!(&collect(stream.body).await.unwrap()[..], &strip(SCRIPT)[..]);
        assert!(fetcher.cache().is_none());
    }
}
