//! Per-job scratch directories and file cleanup

use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A job's private directory under the scratch root, removed when dropped.
///
/// Dropping covers every exit of a job: success, failure, and cancellation
/// of the ingest future. Blocking work that writes into the directory holds
/// it behind an `Arc`, so removal waits for the last writer.
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub async fn create(root: &Path, job_id: &str) -> io::Result<Self> {
        let path = root.join(job_id);
        tokio::fs::create_dir_all(&path).await?;
        debug!(path = %path.display(), "Created scratch directory");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed scratch directory"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove scratch directory"),
        }
    }
}

/// Remove a file, logging anything other than it already being gone
pub async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}
