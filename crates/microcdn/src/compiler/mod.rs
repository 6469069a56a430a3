//! Upload ingestion: validate, unpack, minify, compress, persist
//!
//! Every job works inside its own scratch directory, which is removed on
//! every exit path. Each of the size ceilings is enforced while the bytes
//! flow, so an oversized upload fails as soon as the ceiling is reached.

mod archive;
mod error;
mod minifier;
mod scratch;
mod sniff;

pub use error::{CompileError, Result};
pub use minifier::{ClosureCompiler, Minifier, MinifyError};
pub use sniff::{UploadKind, ALLOWED_TYPES};

#[cfg(test)]
pub(crate) use minifier::tests::{strip, StripWhitespace};

use crate::config::MB;
use crate::streams::{compress_file, limit_size};
use futures::StreamExt;
use scratch::{remove_quietly, ScratchDir};
use script_storage::ids::new_pure_id;
use script_storage::{pure_id, ByteStream, Metadata, StorageEngine};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};

/// Byte ceilings for one ingestion job. A stage fails once its count reaches the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeLimits {
    /// Raw upload body
    pub upload: u64,
    /// Everything read out of an archive
    pub decompressed: u64,
    /// Minifier output
    pub minified: u64,
    /// Brotli output of each persisted file
    pub compressed: u64,
}

impl Default for SizeLimits {
    fn default() -> Self {
        Self {
            upload: 40 * MB,
            decompressed: 30 * MB,
            minified: 10 * MB,
            compressed: 10 * MB,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Received,
    Validating,
    Extracting,
    Minifying,
    SizeChecking,
    Persisting,
    Done,
    Failed,
}

struct Job {
    id: String,
    state: JobState,
}

impl Job {
    fn new() -> Self {
        let job = Self {
            id: new_pure_id(),
            state: JobState::Received,
        };
        debug!(job = %job.id, state = ?job.state, "Job received");
        job
    }

    fn advance(&mut self, next: JobState) {
        debug!(job = %self.id, from = ?self.state, to = ?next, "Job state change");
        self.state = next;
    }
}

/// An object being persisted. Dropped without [`keep`](Self::keep), it is
/// deleted in the background, so an abandoned upload leaves nothing stored.
struct PendingObject {
    storage: Arc<StorageEngine>,
    id: Option<String>,
}

impl PendingObject {
    fn new(storage: Arc<StorageEngine>, id: &str) -> Self {
        Self {
            storage,
            id: Some(id.to_string()),
        }
    }

    fn keep(mut self) {
        self.id = None;
    }

    async fn discard(mut self) {
        if let Some(id) = &self.id {
            self.storage.delete_object(id).await;
        }
        self.id = None;
    }
}

impl Drop for PendingObject {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(id = %id, "Persist abandoned, deleting partial object");
                let storage = self.storage.clone();
                runtime.spawn(async move { storage.delete_object(&id).await });
            }
            Err(_) => error!(id = %id, "Persist abandoned outside a runtime, object left behind"),
        }
    }
}

/// Swap `fresh` into the place of `target`, deleting `fresh` if the rename fails
async fn move_into_place(storage: &StorageEngine, fresh: &str, target: &str) -> Result<()> {
    storage.delete_object(target).await;
    if let Err(e) = storage.rename_object(fresh, target).await {
        error!(from = %fresh, to = %target, error = %e, "Failed to move patched object into place");
        storage.delete_object(fresh).await;
        return Err(e.into());
    }
    Ok(())
}

/// Reject a candidate password that does not match the stored one
pub fn check_password(stored: &Metadata, candidate: Option<&str>) -> Result<()> {
    match stored.password() {
        Some(expected) if !expected.is_empty() && candidate != Some(expected) => {
            Err(CompileError::Forbidden)
        }
        _ => Ok(()),
    }
}

pub struct CompilePipeline {
    storage: Arc<StorageEngine>,
    minifier: Arc<dyn Minifier>,
    scratch_root: PathBuf,
    limits: SizeLimits,
}

impl CompilePipeline {
    pub fn new(
        storage: Arc<StorageEngine>,
        minifier: Arc<dyn Minifier>,
        scratch_root: PathBuf,
        limits: SizeLimits,
    ) -> Self {
        Self {
            storage,
            minifier,
            scratch_root,
            limits,
        }
    }

    /// Ingest an upload as a brand new object and return its full id
    pub async fn ingest_new(
        &self,
        body: ByteStream,
        mime: Option<&str>,
        metadata: Metadata,
    ) -> Result<String> {
        let mut job = Job::new();
        let result = self.run(&mut job, body, mime, metadata).await;
        match &result {
            Ok(id) => {
                job.advance(JobState::Done);
                info!(id = %id, "Ingested script");
            }
            Err(e) => {
                job.advance(JobState::Failed);
                warn!(job = %job.id, error = %e, "Ingestion failed");
            }
        }
        result
    }

    /// Replace the object `target` with a freshly ingested upload.
    ///
    /// The target must exist and, when it carries a password, `password` must
    /// match it. Returns the target's full id. Once the upload is stored, the
    /// swap runs on its own task and completes even if this future is dropped.
    pub async fn patch(
        &self,
        body: ByteStream,
        mime: Option<&str>,
        metadata: Metadata,
        target: &str,
        password: Option<&str>,
    ) -> Result<String> {
        let existing = self
            .storage
            .get_metadata(target)
            .await?
            .ok_or_else(|| CompileError::NotFound(target.to_string()))?;
        check_password(&existing, password)?;

        let fresh = self.ingest_new(body, mime, metadata).await?;
        let storage = self.storage.clone();
        let destination = target.to_string();
        tokio::spawn(async move { move_into_place(&storage, &fresh, &destination).await })
            .await
            .map_err(io::Error::from)??;

        let id = format!("{}.js", pure_id(target));
        info!(id = %id, "Patched script");
        Ok(id)
    }

    async fn run(
        &self,
        job: &mut Job,
        body: ByteStream,
        mime: Option<&str>,
        metadata: Metadata,
    ) -> Result<String> {
        let declared = match mime.map(str::trim).filter(|m| !m.is_empty()) {
            Some(mime) => Some(sniff::classify_declared(mime).ok_or_else(|| {
                CompileError::Validation(format!("unsupported content type {}", mime))
            })?),
            None => None,
        };

        job.advance(JobState::Validating);
        let scratch = Arc::new(ScratchDir::create(&self.scratch_root, &job.id).await?);
        let upload = scratch.join(&job.id);
        self.receive(body, &upload).await?;

        let kind = match declared {
            Some(kind) => kind,
            None => sniff_upload(&upload).await?,
        };

        let inputs = match kind {
            UploadKind::Script => vec![upload],
            UploadKind::Archive => {
                job.advance(JobState::Extracting);
                archive::extract_scripts(upload, scratch.clone(), self.limits.decompressed).await?
            }
        };

        job.advance(JobState::Minifying);
        let output = scratch.join(format!("{}.min.js", job.id));
        let map = scratch.join(format!("{}.map", job.id));
        if let Err(e) = self.minifier.minify(&inputs, &output, &map).await {
            remove_quietly(&output).await;
            remove_quietly(&map).await;
            return Err(CompileError::MinificationFailed(e.diagnostics));
        }

        job.advance(JobState::SizeChecking);
        let minified_size = tokio::fs::metadata(&output).await?.len();
        if minified_size >= self.limits.minified {
            return Err(CompileError::SizeLimitExceeded {
                stage: "minified",
                limit: self.limits.minified,
            });
        }

        job.advance(JobState::Persisting);
        let id = format!("{}.js", job.id);
        self.persist(&id, output, map, metadata).await?;
        Ok(id)
    }

    /// Stream the upload body to disk, removing the partial file on failure
    async fn receive(&self, body: ByteStream, path: &Path) -> Result<()> {
        let mut file = tokio::fs::File::create(path).await?;
        let mut body = limit_size(body, self.limits.upload);

        let result: Result<u64> = async {
            let mut received = 0u64;
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| CompileError::from_limited_io(e, "upload"))?;
                file.write_all(&chunk).await?;
                received += chunk.len() as u64;
            }
            file.flush().await?;
            Ok(received)
        }
        .await;
        drop(file);

        match result {
            Ok(received) => {
                debug!(path = %path.display(), bytes = received, "Upload received");
                Ok(())
            }
            Err(e) => {
                remove_quietly(path).await;
                Err(e)
            }
        }
    }

    /// Compress and store the artifact and its map side by side
    async fn persist(
        &self,
        id: &str,
        output: PathBuf,
        map: PathBuf,
        metadata: Metadata,
    ) -> Result<()> {
        let has_map = tokio::fs::try_exists(&map).await.unwrap_or(false);
        let map_id = format!("{}.map", pure_id(id));

        let pending = PendingObject::new(self.storage.clone(), id);
        let (script, source_map) = tokio::join!(
            self.store_file(id.to_string(), output, metadata),
            async {
                if has_map {
                    self.store_file(map_id, map, Metadata::new()).await
                } else {
                    Ok(())
                }
            }
        );

        if let Err(e) = script.and(source_map) {
            pending.discard().await;
            return Err(e);
        }
        pending.keep();
        Ok(())
    }

    async fn store_file(&self, id: String, path: PathBuf, metadata: Metadata) -> Result<()> {
        let body = limit_size(compress_file(path), self.limits.compressed);
        let stored = self
            .storage
            .put_object_stream(Some(id), metadata)
            .write_stream(body)
            .await
            .map_err(|e| CompileError::from_limited_io(e, "compressed"))?;
        debug!(id = %stored, "Stored compressed file");
        Ok(())
    }
}

/// Work out what an undeclared upload is from its first bytes
async fn sniff_upload(path: &Path) -> Result<UploadKind> {
    let mut head = [0u8; sniff::SNIFF_LEN];
    let mut file = tokio::fs::File::open(path).await?;
    let mut filled = 0;
    while filled < head.len() {
        let n = file.read(&mut head[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    sniff::classify_sniffed(&head[..filled])
        .map_err(|mime| CompileError::Validation(format!("unsupported content type {}", mime)))
}
