//! Atomic, crash-safe file writes (§4.5 "Write protocol").
//!
//! Grounded on the write-to-temp + fsync + rename pattern used for merge
//! state persistence elsewhere in the ecosystem: every write lands in a
//! per-instance temp file that is fsynced before the rename, so a crash
//! mid-write never leaves the destination file half-written. On
//! `EPERM`/`EBUSY` (seen on some filesystems under concurrent readers) the
//! write is retried with exponential backoff before falling back to a
//! direct (non-atomic) overwrite as a last resort.

use std::io;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AtomicWriteError {
    #[error("no parent directory for {0}")]
    NoParentDir(String),
    #[error("io error writing {path}: {source}")]
    Io { path: String, #[source] source: io::Error },
}

/// Write `contents` to `path` atomically.
///
/// Writes to `<path>.tmp.<instance_id>`, fsyncs, then renames over `path`.
/// Retries up to 3 times with 100/200/400ms backoff on `EPERM`/`EBUSY`
/// before falling back to a direct (non-atomic) overwrite, per §4.5.
pub async fn write_atomic(
    path: &Path,
    contents: &[u8],
    instance_id: &str,
) -> Result<(), AtomicWriteError> {
    let dir = path
        .parent()
        .ok_or_else(|| AtomicWriteError::NoParentDir(path.display().to_string()))?;
    tokio::fs::create_dir_all(dir).await.map_err(|e| AtomicWriteError::Io {
        path: dir.display().to_string(),
        source: e,
    })?;

    let tmp_path = dir.join(format!(
        "{}.tmp.{instance_id}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("state")
    ));

    let mut backoff_ms = 100u64;
    for attempt in 0..3 {
        match try_write_and_rename(&tmp_path, path, contents).await {
            Ok(()) => return Ok(()),
            Err(e) if is_transient(&e) && attempt < 2 => {
                tracing::warn!(path = %path.display(), attempt, error = %e, "atomic write retrying after transient error");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "atomic write exhausted retries, falling back to direct overwrite");
                return tokio::fs::write(path, contents).await.map_err(|e| AtomicWriteError::Io {
                    path: path.display().to_string(),
                    source: e,
                });
            }
        }
    }
    unreachable!("loop always returns")
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(code) if code == libc_eperm() || code == libc_ebusy()
    )
}

#[cfg(unix)]
fn libc_eperm() -> i32 {
    libc::EPERM
}
#[cfg(unix)]
fn libc_ebusy() -> i32 {
    libc::EBUSY
}
#[cfg(not(unix))]
fn libc_eperm() -> i32 {
    -1
}
#[cfg(not(unix))]
fn libc_ebusy() -> i32 {
    -2
}

async fn try_write_and_rename(tmp_path: &Path, dest: &Path, contents: &[u8]) -> io::Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::File::create(tmp_path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(tmp_path, dest).await
}

/// Synchronous variant used on the shutdown path (§4.5 "Shutdown"), which
/// bypasses the debounce timer and must complete before process exit.
pub fn write_atomic_sync(path: &Path, contents: &[u8], instance_id: &str) -> Result<(), AtomicWriteError> {
    let dir = path
        .parent()
        .ok_or_else(|| AtomicWriteError::NoParentDir(path.display().to_string()))?;
    std::fs::create_dir_all(dir).map_err(|e| AtomicWriteError::Io {
        path: dir.display().to_string(),
        source: e,
    })?;

    let tmp_path = dir.join(format!(
        "{}.tmp.{instance_id}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("state")
    ));

    let result = (|| -> io::Result<()> {
        let file = std::fs::File::create(&tmp_path)?;
        use std::io::Write;
        let mut file = file;
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp_path, path)
    })();

    result.map_err(|e| AtomicWriteError::Io {
        path: path.display().to_string(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_and_reads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plan.json");
        write_atomic(&path, b"{\"a\":1}", "inst-1").await.unwrap();
        let read = tokio::fs::read(&path).await.unwrap();
        assert_eq!(read, b"{\"a\":1}");
    }

    #[tokio::test]
    async fn overwrite_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plan.json");
        write_atomic(&path, b"first", "inst-1").await.unwrap();
        write_atomic(&path, b"second", "inst-1").await.unwrap();
        let read = tokio::fs::read(&path).await.unwrap();
        assert_eq!(read, b"second");
    }

    #[tokio::test]
    async fn no_leftover_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plan.json");
        write_atomic(&path, b"data", "inst-7").await.unwrap();
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["plan.json".to_string()]);
    }

    #[test]
    fn sync_write_roundtrips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        write_atomic_sync(&path, b"{}", "inst-sync").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{}");
    }
}
