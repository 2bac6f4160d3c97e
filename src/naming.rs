//! Atomic filename reservation
//!
//! Picks a unique name inside the destination directory by exclusively
//! creating the candidate file. The exclusive create is the serialization
//! point: two concurrent reservations can never return the same name. On
//! the first collision the redownload policy decides whether to loop into
//! numbered suffixes, overwrite, reject, or ask the caller.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use tokio::fs::OpenOptions;

use crate::error::{DownloadError, DownloadResult};

/// Policy applied when the requested filename already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedownloadMode {
    /// Silently pick the next free numbered name.
    Always,
    /// Reject the download outright.
    Never,
    /// Consult the caller's `file_exists_cb` prompt.
    Ask,
    /// Reuse the existing name, overwriting the file.
    Replace,
}

impl Default for RedownloadMode {
    fn default() -> Self {
        Self::Ask
    }
}

/// Caller prompt for `RedownloadMode::Ask`; `true` means download anyway.
pub type FileExistsFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

lazy_static! {
    static ref INVALID_CHARS: Regex = Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).unwrap();
}

/// Replace characters no filesystem wants to see; empty names become
/// `unnamed`.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned = INVALID_CHARS.replace_all(name.trim(), "_").into_owned();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

/// Numbered variant of a filename: `mod.zip` -> `mod.3.zip`.
fn numbered(name: &str, counter: u32) -> String {
    let path = Path::new(name);
    match (path.file_stem(), path.extension()) {
        (Some(stem), Some(ext)) => format!(
            "{}.{}.{}",
            stem.to_string_lossy(),
            counter,
            ext.to_string_lossy()
        ),
        _ => format!("{}.{}", name, counter),
    }
}

/// Reserve a unique filename under `dir`, creating the (empty) file.
///
/// The returned path exists when this resolves; with
/// `RedownloadMode::Replace` the pre-existing file is handed back as is.
pub async fn reserve_unique_name(
    dir: &Path,
    name: &str,
    mode: RedownloadMode,
    file_exists_cb: Option<&FileExistsFn>,
) -> DownloadResult<PathBuf> {
    let name = sanitize_filename(name);
    let mut counter = 0u32;
    let mut first = true;

    loop {
        let candidate = if counter == 0 {
            name.clone()
        } else {
            numbered(&name, counter)
        };
        let path = dir.join(&candidate);

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => {
                // Dropping the handle closes it; close errors (EBADF
                // included) do not invalidate the reservation.
                drop(file);
                debug!("[Naming] reserved {}", path.display());
                return Ok(path);
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                if first {
                    match mode {
                        RedownloadMode::Always => {}
                        RedownloadMode::Never => {
                            return Err(DownloadError::AlreadyDownloaded(candidate));
                        }
                        RedownloadMode::Replace => return Ok(path),
                        RedownloadMode::Ask => match file_exists_cb {
                            Some(cb) if cb(&candidate) => {}
                            _ => return Err(DownloadError::UserCanceled),
                        },
                    }
                }
                first = false;
                counter += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("mod: the \"best\".zip"), "mod_ the _best_.zip");
        assert_eq!(sanitize_filename("a/b\\c.txt"), "a_b_c.txt");
        assert_eq!(sanitize_filename("   "), "unnamed");
        assert_eq!(sanitize_filename("plain.zip"), "plain.zip");
    }

    #[test]
    fn test_numbered_names() {
        assert_eq!(numbered("mod.zip", 1), "mod.1.zip");
        assert_eq!(numbered("archive.tar.gz", 7), "archive.tar.7.gz");
        assert_eq!(numbered("noext", 2), "noext.2");
    }

    #[tokio::test]
    async fn test_reservation_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = reserve_unique_name(dir.path(), "mod.zip", RedownloadMode::Ask, None)
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("mod.zip"));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_collision_with_never_rejects() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mod.zip"), b"old").unwrap();
        let err = reserve_unique_name(dir.path(), "mod.zip", RedownloadMode::Never, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::AlreadyDownloaded(name) if name == "mod.zip"));
    }

    #[tokio::test]
    async fn test_collision_with_replace_returns_existing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mod.zip"), b"old").unwrap();
        let path = reserve_unique_name(dir.path(), "mod.zip", RedownloadMode::Replace, None)
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("mod.zip"));
        assert_eq!(std::fs::read(&path).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_collision_with_always_numbers_up() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mod.zip"), b"old").unwrap();
        std::fs::write(dir.path().join("mod.1.zip"), b"older").unwrap();
        let path = reserve_unique_name(dir.path(), "mod.zip", RedownloadMode::Always, None)
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("mod.2.zip"));
    }

    #[tokio::test]
    async fn test_ask_declined_cancels_and_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mod.zip"), b"keep me").unwrap();
        let cb: FileExistsFn = Arc::new(|_| false);
        let err = reserve_unique_name(dir.path(), "mod.zip", RedownloadMode::Ask, Some(&cb))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::UserCanceled));
        assert_eq!(std::fs::read(dir.path().join("mod.zip")).unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn test_ask_accepted_numbers_up() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mod.zip"), b"old").unwrap();
        let cb: FileExistsFn = Arc::new(|_| true);
        let path = reserve_unique_name(dir.path(), "mod.zip", RedownloadMode::Ask, Some(&cb))
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("mod.1.zip"));
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let dir = dir.path().to_path_buf();
            handles.push(tokio::spawn(async move {
                reserve_unique_name(&dir, "mod.zip", RedownloadMode::Always, None)
                    .await
                    .unwrap()
            }));
        }
        let mut paths = Vec::new();
        for handle in handles {
            paths.push(handle.await.unwrap());
        }
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 8);
    }
}
