//! File-drop descriptors and the file transfer engine.
//!
//! This module handles:
//! - Transfer descriptors ([`FileDropData`]) and their wire shape
//! - Enumerating dropped files and folders
//! - Path safety and collision-free destination names
//! - Cancellable stream wrappers ([`cancel`])
//! - Progress aggregation ([`progress`])
//! - Sending and receiving file sets over a format stream ([`engine`])

pub mod cancel;
pub mod engine;
pub mod progress;

pub use cancel::{CancellableReader, CancellableWriter};
pub use engine::{receive_files, send_files, verify_sources, CopyOptions};
pub use progress::{ProgressReporter, TransferProgress};

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::InterruptCode;

/// One file of a transfer.
///
/// The size travels as two 32-bit halves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileInfo {
    /// High 32 bits of the size
    pub size_high: u32,
    /// Low 32 bits of the size
    pub size_low: u32,
    /// Path on the sending device
    pub path: String,
    /// Name relative to the drop root, `/`-separated
    pub name: String,
}

impl FileInfo {
    /// Describe a file.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(path: impl Into<String>, name: impl Into<String>, size: u64) -> Self {
        Self {
            size_high: (size >> 32) as u32,
            size_low: size as u32,
            path: path.into(),
            name: name.into(),
        }
    }

    /// File size in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        ((self.size_high as u64) << 32) | self.size_low as u64
    }
}

/// Request/answer command carried by a descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DropCmd {
    /// The sender offers the files
    #[default]
    Request,
    /// The receiver accepts
    Accept,
    /// The receiver declines
    Reject,
}

/// Where a transfer stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InterruptInfo {
    /// File being copied
    pub last_file: String,
    /// Bytes of that file copied
    pub offset: u64,
    /// Failure cause
    pub last_error: InterruptCode,
}

/// A file-drop transfer descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileDropData {
    /// Files in transfer order
    pub files: Vec<FileInfo>,
    /// Folders to recreate, each ending in `/`
    #[serde(default)]
    pub folders: Vec<String>,
    /// Sum of all file sizes
    pub total_size: u64,
    /// Human-readable total size
    #[serde(default)]
    pub total_desc: String,
    /// Transfer identity
    #[serde(rename = "TimeStamp")]
    pub timestamp: u64,
    /// Request or answer
    #[serde(default)]
    pub cmd: DropCmd,
    /// Destination directory chosen by the receiver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_path: Option<String>,
    /// Resume bookkeeping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<InterruptInfo>,
}

impl FileDropData {
    /// A request for the given files.
    #[must_use]
    pub fn new(timestamp: u64, files: Vec<FileInfo>) -> Self {
        let total_size = files.iter().map(FileInfo::size).sum();
        Self {
            files,
            folders: Vec::new(),
            total_size,
            total_desc: format_size(total_size),
            timestamp,
            cmd: DropCmd::Request,
            dst_path: None,
            interrupt: None,
        }
    }

    /// Describe dropped files and folders.
    ///
    /// Folders are walked recursively; names are relative to the folder's
    /// parent so the folder itself is recreated on the receiver.
    ///
    /// # Errors
    ///
    /// Returns `FileOpenFailed` if a path does not exist or cannot be read.
    pub fn from_paths(paths: &[PathBuf], timestamp: u64) -> Result<Self> {
        let mut files = Vec::new();
        let mut folders = Vec::new();

        for path in paths {
            let open_failed = |reason: String| Error::FileOpenFailed {
                path: path.display().to_string(),
                reason,
            };
            let metadata = std::fs::metadata(path).map_err(|e| open_failed(e.to_string()))?;

            if metadata.is_file() {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .ok_or_else(|| open_failed("no file name".to_string()))?;
                files.push(FileInfo::new(
                    path.display().to_string(),
                    name,
                    metadata.len(),
                ));
                continue;
            }

            let base = path.parent().unwrap_or(path);
            for entry in walkdir::WalkDir::new(path).sort_by_file_name() {
                let entry = entry.map_err(|e| open_failed(e.to_string()))?;
                let Some(relative) = relative_name(entry.path(), base) else {
                    continue;
                };
                if entry.file_type().is_dir() {
                    folders.push(format!("{relative}/"));
                } else if entry.file_type().is_file() {
                    let size = entry
                        .metadata()
                        .map_err(|e| open_failed(e.to_string()))?
                        .len();
                    files.push(FileInfo::new(
                        entry.path().display().to_string(),
                        relative,
                        size,
                    ));
                }
            }
        }

        let mut descriptor = Self::new(timestamp, files);
        descriptor.folders = folders;
        Ok(descriptor)
    }

    /// The part of this transfer that still has to be copied, starting at
    /// `last_file`. An unknown name yields the whole transfer.
    #[must_use]
    pub fn remaining_from(&self, last_file: &str) -> Self {
        let start = self
            .files
            .iter()
            .position(|f| f.name == last_file)
            .unwrap_or(0);
        let mut rest = Self::new(self.timestamp, self.files[start..].to_vec());
        rest.folders.clone_from(&self.folders);
        rest.dst_path.clone_from(&self.dst_path);
        rest
    }

    /// Number of files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }
}

fn relative_name(path: &Path, base: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Validate a name received from a peer and turn it into a relative path.
///
/// # Errors
///
/// Returns `InvalidPath` for empty or absolute names and for names that
/// contain `..`.
pub fn safe_relative_path(name: &str) -> Result<PathBuf> {
    let trimmed = name.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::InvalidPath(name.to_string()));
    }

    let mut path = PathBuf::new();
    for part in trimmed.split(['/', '\\']) {
        if part.is_empty() || part == "." {
            continue;
        }
        match Path::new(part).components().next() {
            Some(Component::Normal(_)) if part != ".." => path.push(part),
            _ => return Err(Error::InvalidPath(name.to_string())),
        }
    }

    if trimmed.starts_with('/') || path.as_os_str().is_empty() {
        return Err(Error::InvalidPath(name.to_string()));
    }
    Ok(path)
}

/// A destination path that does not exist yet.
///
/// `a.txt` becomes `a (1).txt`, then `a (2).txt`, and so on.
#[must_use]
pub fn target_dst_path_name(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    (1u64..)
        .map(|n| parent.join(format!("{stem} ({n}){extension}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

/// Format a file size for display.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_size_halves() {
        let info = FileInfo::new("/a", "a", 5 * (1u64 << 32) + 7);
        assert_eq!(info.size_high, 5);
        assert_eq!(info.size_low, 7);
        assert_eq!(info.size(), 5 * (1u64 << 32) + 7);
    }

    #[test]
    fn test_collision_names() {
        let dir = TempDir::new().expect("tempdir");
        let original = dir.path().join("a.txt");

        assert_eq!(target_dst_path_name(&original), original);

        std::fs::write(&original, b"one").expect("write");
        let first = target_dst_path_name(&original);
        assert_eq!(first, dir.path().join("a (1).txt"));

        std::fs::write(&first, b"two").expect("write");
        assert_eq!(target_dst_path_name(&original), dir.path().join("a (2).txt"));
    }

    #[test]
    fn test_collision_without_extension() {
        let dir = TempDir::new().expect("tempdir");
        let original = dir.path().join("README");
        std::fs::write(&original, b"x").expect("write");

        assert_eq!(target_dst_path_name(&original), dir.path().join("README (1)"));
    }

    #[test]
    fn test_safe_relative_path() {
        assert_eq!(
            safe_relative_path("docs/notes/a.txt").expect("valid"),
            PathBuf::from("docs").join("notes").join("a.txt")
        );
        assert_eq!(
            safe_relative_path("photos/").expect("valid"),
            PathBuf::from("photos")
        );
        assert!(matches!(
            safe_relative_path("../etc/passwd"),
            Err(Error::InvalidPath(_))
        ));
        assert!(safe_relative_path("/etc/passwd").is_err());
        assert!(safe_relative_path("docs/../../x").is_err());
        assert!(safe_relative_path("").is_err());
    }

    #[test]
    fn test_from_paths_walks_folders() {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path().join("album");
        std::fs::create_dir_all(root.join("raw")).expect("mkdir");
        std::fs::write(root.join("cover.png"), vec![0u8; 10]).expect("write");
        std::fs::write(root.join("raw").join("img.dng"), vec![0u8; 20]).expect("write");
        let single = dir.path().join("notes.txt");
        std::fs::write(&single, b"hello").expect("write");

        let descriptor =
            FileDropData::from_paths(&[root, single], 42).expect("describe");

        assert_eq!(descriptor.folders, vec!["album/", "album/raw/"]);
        let names: Vec<_> = descriptor.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["album/cover.png", "album/raw/img.dng", "notes.txt"]);
        assert_eq!(descriptor.total_size, 35);
        assert_eq!(descriptor.timestamp, 42);
        assert_eq!(descriptor.cmd, DropCmd::Request);
    }

    #[test]
    fn test_from_paths_missing_file() {
        let result = FileDropData::from_paths(&[PathBuf::from("/definitely/not/here")], 1);
        assert!(matches!(result, Err(Error::FileOpenFailed { .. })));
    }

    #[test]
    fn test_remaining_from() {
        let descriptor = FileDropData::new(
            7,
            vec![
                FileInfo::new("/a", "a", 10),
                FileInfo::new("/b", "b", 20),
                FileInfo::new("/c", "c", 30),
            ],
        );

        let rest = descriptor.remaining_from("b");
        assert_eq!(rest.len(), 2);
        assert_eq!(rest.total_size, 50);
        assert_eq!(rest.timestamp, 7);

        assert_eq!(descriptor.remaining_from("zzz").len(), 3);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }
}
