//! Crash-safe whole-file storage.
//!
//! Every on-disk mutation in workvault goes through [`AtomicFileStore::write`]:
//! the payload lands in a uniquely named temp file in the destination's
//! directory, is forced to stable storage, and is then renamed over the
//! destination. A reader sees either the complete old file or the complete new
//! one, whatever the crash timing.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Suffix shared by every temp file this module creates.
const TEMP_SUFFIX: &str = ".tmp";

/// Per-process sequence for temp names. Combined with the pid and a random
/// suffix so that concurrent writers never share a temp file.
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Atomic write / plain read primitive over the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct AtomicFileStore;

impl AtomicFileStore {
    pub fn new() -> Self {
        Self
    }

    /// Atomically replace `path` with `bytes`.
    pub async fn write(&self, path: &Path, bytes: Vec<u8>) -> Result<()> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| Error::Other(format!("atomic write task failed: {e}")))?
    }

    /// Read the whole file. A missing file is [`Error::NotFound`].
    pub async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Like [`read`](Self::read), with absence mapped to `None`.
    pub async fn read_if_exists(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match self.read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Remove temp files orphaned in `dir` by a crash mid-write.
    ///
    /// Only call this on a directory the caller owns exclusively, before any
    /// writer is active in it.
    pub async fn sweep_temp_files(&self, dir: &Path) -> Result<usize> {
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if is_temp_name(&name) {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => {
                        debug!(file = %name, "removed orphaned temp file");
                        removed += 1;
                    }
                    Err(e) => warn!(file = %name, "cannot remove orphaned temp file: {e}"),
                }
            }
        }
        Ok(removed)
    }
}

/// Synchronous body of [`AtomicFileStore::write`].
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = parent_dir(path);
    std::fs::create_dir_all(&dir)?;

    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Other(format!("not a file path: {}", path.display())))?
        .to_string_lossy()
        .into_owned();
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let prefix = format!(".{file_name}.{}.{seq}.", std::process::id());

    // Dropping the NamedTempFile on any early return deletes it, so a failed
    // write never leaves debris and never touches the destination.
    let mut tmp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(TEMP_SUFFIX)
        .rand_bytes(6)
        .tempfile_in(&dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;

    sync_dir(&dir)?;
    Ok(())
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
}

/// Make the rename itself durable.
#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    std::fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}
