//! File System Utilities
//!
//! Helpers for writing received files: parent directory creation, disk-full
//! detection, conflict-free download names and clean-up of partial writes.

use crate::{ProtocolError, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Ensure the parent directory of `file_path` exists
///
/// # Errors
///
/// Returns `PermissionDenied` if creation fails due to permissions and `Io`
/// for other filesystem errors.
pub async fn ensure_parent_dir(file_path: impl AsRef<Path>) -> Result<()> {
    let file_path = file_path.as_ref();

    if let Some(parent) = file_path.parent() {
        if !parent.exists() {
            debug!("Creating directory: {}", parent.display());
            fs::create_dir_all(parent).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    ProtocolError::PermissionDenied(format!(
                        "Cannot create directory {}",
                        parent.display()
                    ))
                } else {
                    ProtocolError::from_io_error(
                        e,
                        &format!("creating directory {}", parent.display()),
                    )
                }
            })?;
        }
    }

    Ok(())
}

fn is_disk_full(error: &std::io::Error) -> bool {
    let message = error.to_string().to_lowercase();
    message.contains("no space") || message.contains("disk full")
}

/// Create a file, creating missing parent directories first
pub async fn create_file_safe(path: impl AsRef<Path>) -> Result<fs::File> {
    let path = path.as_ref();
    ensure_parent_dir(path).await?;

    let file = fs::File::create(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProtocolError::PermissionDenied(format!("Cannot create file {}", path.display()))
        } else if is_disk_full(&e) {
            ProtocolError::ResourceExhausted(format!(
                "Disk full: cannot create file {}",
                path.display()
            ))
        } else {
            ProtocolError::from_io_error(e, &format!("creating file {}", path.display()))
        }
    })?;

    debug!("Created file: {}", path.display());
    Ok(file)
}

/// Write all of `data` and flush, mapping disk-full errors to `ResourceExhausted`
pub async fn write_file_safe(file: &mut fs::File, data: &[u8]) -> Result<()> {
    let map = |e: std::io::Error| {
        if is_disk_full(&e) {
            ProtocolError::ResourceExhausted("Disk full during file write".to_string())
        } else {
            ProtocolError::Io(e)
        }
    };
    file.write_all(data).await.map_err(map)?;
    file.flush().await.map_err(map)
}

/// Delete a partially written file; failures are only logged
pub async fn cleanup_partial_file(path: impl AsRef<Path>) {
    let path = path.as_ref();

    if path.exists() {
        match fs::remove_file(path).await {
            Ok(()) => debug!("Cleaned up partial file: {}", path.display()),
            Err(e) => warn!("Failed to clean up partial file {}: {}", path.display(), e),
        }
    }
}

/// A path in `base_dir` that does not exist yet
///
/// Appends " (1)", " (2)", ... before the extension on conflict.
///
/// ```ignore
/// let path = get_unique_download_path("/home/user/Downloads", "file.txt").await;
/// // /home/user/Downloads/file.txt, or file (1).txt if that exists
/// ```
pub async fn get_unique_download_path(base_dir: impl AsRef<Path>, filename: &str) -> PathBuf {
    let base_dir = base_dir.as_ref();
    let path = base_dir.join(filename);
    if !path.exists() {
        return path;
    }

    // A leading dot is part of the name, not an extension
    let (name, ext) = match filename.rfind('.') {
        Some(pos) if pos > 0 => filename.split_at(pos),
        _ => (filename, ""),
    };

    for i in 1..1000 {
        let candidate = base_dir.join(format!("{} ({}){}", name, i, ext));
        if !candidate.exists() {
            return candidate;
        }
    }

    base_dir.join(format!("{}_{}{}", name, crate::current_timestamp(), ext))
}

/// Reduce a remote file name to a single safe path component
///
/// ```
/// use peerdrop_protocol::fs_utils::sanitize_file_name;
///
/// assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
/// assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
/// assert_eq!(sanitize_file_name(".."), "file");
/// ```
pub fn sanitize_file_name(name: &str) -> String {
    let last = name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}
