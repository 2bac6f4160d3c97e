//! Output file assembler
//!
//! Owns the single writable handle for one download. Workers hand it byte
//! ranges at absolute offsets in any order; writes are serialized
//! internally and acknowledged once queued to the OS, with a periodic
//! fsync checkpoint flagged on the ack so the manager knows when chunk
//! state is safe to persist. The file can be renamed while open.

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use lazy_static::lazy_static;
use log::debug;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{DownloadError, DownloadResult};

/// Bytes written between fsync checkpoints.
const SYNC_THRESHOLD: u64 = 16 * 1024 * 1024;

lazy_static! {
    // Process-wide set of paths with a live assembler; the exclusivity
    // behind `create`'s "file locked" contract.
    static ref OPEN_PATHS: StdMutex<HashSet<PathBuf>> = StdMutex::new(HashSet::new());
}

fn register_path(path: &Path) -> bool {
    OPEN_PATHS
        .lock()
        .map(|mut open| open.insert(path.to_path_buf()))
        .unwrap_or(false)
}

fn unregister_path(path: &Path) {
    if let Ok(mut open) = OPEN_PATHS.lock() {
        open.remove(path);
    }
}

/// Acknowledgement for one `add_chunk` call.
#[derive(Debug, Clone, Copy)]
pub struct WriteAck {
    /// True when this write crossed an fsync checkpoint; chunk state may
    /// be persisted now.
    pub synced: bool,
}

#[derive(Debug)]
struct Inner {
    file: Option<File>,
    unsynced: u64,
}

/// Serialized positional writer for one partial download file.
#[derive(Debug)]
pub struct FileAssembler {
    inner: Mutex<Inner>,
    path: StdMutex<PathBuf>,
    closed: AtomicBool,
}

impl FileAssembler {
    /// Open `path` for assembly. Fails with `ProcessCanceled("file
    /// locked")` if another assembler already owns it. The file is not
    /// truncated so resumed downloads keep their partial data.
    pub async fn create(path: &Path) -> DownloadResult<Self> {
        if !register_path(path) {
            return Err(DownloadError::ProcessCanceled("file locked".to_string()));
        }

        let file = match OpenOptions::new().write(true).create(true).open(path).await {
            Ok(file) => file,
            Err(err) => {
                unregister_path(path);
                return Err(err.into());
            }
        };

        debug!("[Assembler] opened {}", path.display());

        Ok(Self {
            inner: Mutex::new(Inner {
                file: Some(file),
                unsynced: 0,
            }),
            path: StdMutex::new(path.to_path_buf()),
            closed: AtomicBool::new(false),
        })
    }

    /// Pre-allocate (or trim) the file to the declared total size.
    pub async fn set_total_size(&self, size: u64) -> DownloadResult<()> {
        let inner = self.inner.lock().await;
        let file = inner
            .file
            .as_ref()
            .ok_or_else(|| DownloadError::ProcessCanceled("assembler closed".to_string()))?;
        file.set_len(size).await?;
        Ok(())
    }

    /// Write `buf` at the absolute `offset`. Calls from multiple workers
    /// are serialized; each ack reflects that call's own data.
    pub async fn add_chunk(&self, offset: u64, buf: &[u8]) -> DownloadResult<WriteAck> {
        let mut inner = self.inner.lock().await;
        let file = inner
            .file
            .as_mut()
            .ok_or_else(|| DownloadError::ProcessCanceled("assembler closed".to_string()))?;

        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(buf).await?;

        inner.unsynced += buf.len() as u64;
        let synced = inner.unsynced >= SYNC_THRESHOLD;
        if synced {
            if let Some(file) = inner.file.as_ref() {
                file.sync_data().await?;
            }
            inner.unsynced = 0;
        }

        Ok(WriteAck { synced })
    }

    /// Rename the file while it stays open. Only legal before `close`;
    /// taking the write lock guarantees no write is in flight.
    pub async fn rename(&self, new_path: &Path) -> DownloadResult<()> {
        let inner = self.inner.lock().await;
        if inner.file.is_none() {
            return Err(DownloadError::ProcessCanceled("assembler closed".to_string()));
        }

        let old_path = self
            .path
            .lock()
            .map(|p| p.clone())
            .map_err(|_| DownloadError::ProcessCanceled("assembler poisoned".to_string()))?;

        tokio::fs::rename(&old_path, new_path).await?;

        unregister_path(&old_path);
        register_path(new_path);
        if let Ok(mut path) = self.path.lock() {
            *path = new_path.to_path_buf();
        }
        debug!(
            "[Assembler] renamed {} -> {}",
            old_path.display(),
            new_path.display()
        );
        Ok(())
    }

    /// Flush, fsync and release the handle. Idempotent; the path lock is
    /// released even when the final flush fails.
    pub async fn close(&self) -> DownloadResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(mut file) = inner.file.take() {
            self.closed.store(true, Ordering::SeqCst);
            if let Ok(path) = self.path.lock() {
                unregister_path(&path);
            }
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Path the file currently lives at (changes after `rename`).
    pub fn current_path(&self) -> PathBuf {
        self.path
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

impl Drop for FileAssembler {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Ok(path) = self.path.lock() {
                unregister_path(&path);
            }
        }
    }
}
