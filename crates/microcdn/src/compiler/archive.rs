//! Zip extraction for archive uploads
//!
//! Only `.js` entries are written out. Everything else is read through and
//! dropped, and every byte read counts toward the decompressed ceiling so
//! that an archive full of junk cannot get around it.

use super::error::{CompileError, Result};
use super::scratch::ScratchDir;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zip::ZipArchive;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Directory inside a job's scratch space that scripts are extracted into
pub const EXTRACT_DIR: &str = "extracted";

fn cancelled() -> CompileError {
    io::Error::other("extraction cancelled").into()
}

/// Whether an entry name points at OS litter or hidden files
fn is_hidden(name: &str) -> bool {
    name.split(['/', '\\'])
        .any(|part| part == "__MACOSX" || part.starts_with('.'))
}

fn is_script(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".js")
}

/// Running total of decompressed bytes against the ceiling
struct Budget {
    used: u64,
    limit: u64,
}

impl Budget {
    fn charge(&mut self, n: usize) -> Result<()> {
        self.used += n as u64;
        if self.used >= self.limit {
            return Err(CompileError::SizeLimitExceeded {
                stage: "decompressed",
                limit: self.limit,
            });
        }
        Ok(())
    }
}

fn copy_counted(
    reader: &mut impl Read,
    sink: &mut dyn Write,
    budget: &mut Budget,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        budget.charge(n)?;
        sink.write_all(&buf[..n])?;
    }
}

fn extract_blocking(
    archive: &Path,
    dest: &Path,
    limit: u64,
    cancel: &CancellationToken,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dest)?;
    let mut archive = ZipArchive::new(File::open(archive)?)?;
    let mut budget = Budget { used: 0, limit };
    let mut written = Vec::new();

    for i in 0..archive.len() {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }

        let name = entry.name().to_string();
        let target = match entry.enclosed_name() {
            Some(relative) if !is_hidden(&name) && is_script(&name) => Some(dest.join(relative)),
            _ => None,
        };

        match target {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut out = File::create(&path)?;
                copy_counted(&mut entry, &mut out, &mut budget, cancel)?;
                debug!(entry = %name, "Extracted script");
                written.push(path);
            }
            None => {
                copy_counted(&mut entry, &mut io::sink(), &mut budget, cancel)?;
                debug!(entry = %name, "Skipped archive entry");
            }
        }
    }

    Ok(written)
}

/// Extract the eligible scripts of `archive` into the [`EXTRACT_DIR`] of
/// `scratch`, in archive order.
///
/// Reaching `limit` decompressed bytes removes the extraction directory and
/// fails with `SizeLimitExceeded`; an archive without eligible scripts fails
/// with `EmptyArchive`. Dropping the returned future stops the extraction at
/// the next chunk, and the blocking task holds `scratch` until it has stopped
/// writing.
pub async fn extract_scripts(
    archive: PathBuf,
    scratch: Arc<ScratchDir>,
    limit: u64,
) -> Result<Vec<PathBuf>> {
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let result = tokio::task::spawn_blocking(move || {
        let dest = scratch.join(EXTRACT_DIR);
        let result = extract_blocking(&archive, &dest, limit, &cancel);
        match &result {
            Err(CompileError::SizeLimitExceeded { .. }) => {
                if let Err(e) = std::fs::remove_dir_all(&dest) {
                    warn!(path = %dest.display(), error = %e, "Failed to purge extraction directory");
                }
            }
            Err(_) if cancel.is_cancelled() => {
                debug!(path = %dest.display(), "Extraction cancelled");
            }
            _ => {}
        }
        result
    })
    .await
    .map_err(io::Error::from)?;

    let scripts = result?;
    if scripts.is_empty() {
        return Err(CompileError::EmptyArchive);
    }
    Ok(scripts)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    /// Build an in-memory zip from (name, contents) pairs
    pub(crate) fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut zip = ZipWriter::new(io::Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, contents) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(contents).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    fn write_zip(dir: &Path, entries: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join("upload.zip");
        std::fs::write(&path, build_zip(entries)).unwrap();
        path
    }

    async fn scratch_in(dir: &Path) -> Arc<ScratchDir> {
        Arc::new(ScratchDir::create(dir, "00-job").await.unwrap())
    }

    fn names(paths: &[PathBuf], root: &Path) -> Vec<String> {
        paths
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect()
    }

    #[test]
    fn test_hidden_names() {
        assert!(is_hidden("__MACOSX/a.js"));
        assert!(is_hidden(".DS_Store"));
        assert!(is_hidden("lib/.hidden.js"));
        assert!(is_hidden(".git/config"));
        assert!(!is_hidden("lib/a.js"));
        assert!(!is_hidden("a.min.js"));
    }

    #[tokio::test]
    async fn test_extracts_only_visible_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_zip(
            dir.path(),
            &[
                ("a.js", b"var a = 1;"),
                ("b.txt", b"not a script"),
                ("__MACOSX/._a.js", b"resource fork"),
                (".DS_Store", b"finder"),
                ("lib/c.js", b"var c = 3;"),
            ],
        );
        let scratch = scratch_in(dir.path()).await;
        let dest = scratch.join(EXTRACT_DIR);

        let scripts = extract_scripts(archive, scratch.clone(), 1_000_000).await.unwrap();
        assert_eq!(names(&scripts, &dest), vec!["a.js", "lib/c.js"]);
        assert_eq!(std::fs::read(&scripts[0]).unwrap(), b"var a = 1;");
        assert!(!dest.join("b.txt").exists());
    }

    #[tokio::test]
    async fn test_script_and_text_yields_only_script() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_zip(dir.path(), &[("a.js", b"var a;"), ("b.txt", b"b")]);
        let scratch = scratch_in(dir.path()).await;
        let dest = scratch.join(EXTRACT_DIR);
        let scripts = extract_scripts(archive, scratch.clone(), 1_000_000).await.unwrap();
        assert_eq!(names(&scripts, &dest), vec!["a.js"]);
    }

    #[tokio::test]
    async fn test_traversal_entries_are_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_zip(dir.path(), &[("../escape.js", b"bad"), ("ok.js", b"good")]);
        let scratch = scratch_in(dir.path()).await;
        let dest = scratch.join(EXTRACT_DIR);

        let scripts = extract_scripts(archive, scratch.clone(), 1_000_000).await.unwrap();
        assert_eq!(names(&scripts, &dest), vec!["ok.js"]);
        assert!(!scratch.path().join("escape.js").exists());
        assert!(!dir.path().join("escape.js").exists());
    }

    #[tokio::test]
    async fn test_empty_eligible_set() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_zip(dir.path(), &[("readme.md", b"# hi"), (".x.js", b"hidden")]);
        let result = extract_scripts(archive, scratch_in(dir.path()).await, 1_000_000).await;
        assert!(matches!(result, Err(CompileError::EmptyArchive)));
    }

    #[tokio::test]
    async fn test_skipped_entries_count_toward_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let junk = vec![b'x'; 4096];
        let archive = write_zip(dir.path(), &[("junk.bin", &junk), ("a.js", b"var a;")]);
        let scratch = scratch_in(dir.path()).await;
        let dest = scratch.join(EXTRACT_DIR);

        let result = extract_scripts(archive, scratch.clone(), 1024).await;
        assert!(matches!(
            result,
            Err(CompileError::SizeLimitExceeded {
                stage: "decompressed",
                limit: 1024
            })
        ));
        assert!(!dest.exists());
        assert!(scratch.path().exists());
    }

    #[tokio::test]
    async fn test_not_a_zip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.zip");
        std::fs::write(&path, "not a zip archive, just text. ".repeat(20)).unwrap();
        let result = extract_scripts(path, scratch_in(dir.path()).await, 1_000_000).await;
        assert!(matches!(result, Err(CompileError::Validation(_))));
    }

    #[tokio::test]
    async fn test_dropped_extraction_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let entries: Vec<(String, Vec<u8>)> = (0..2000)
            .map(|i| (format!("lib/{i}.js"), vec![b'a'; 4096]))
            .collect();
        let refs: Vec<(&str, &[u8])> = entries
            .iter()
            .map(|(name, data)| (name.as_str(), data.as_slice()))
            .collect();
        let archive = write_zip(dir.path(), &refs);
        let scratch = scratch_in(dir.path()).await;
        let job_dir = scratch.path().to_path_buf();

        let _ = tokio::time::timeout(
            Duration::from_millis(5),
            extract_scripts(archive, scratch, 100_000_000),
        )
        .await;

        let removed = tokio::time::timeout(Duration::from_secs(5), async {
            while job_dir.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(removed.is_ok());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!job_dir.exists());
    }
}
