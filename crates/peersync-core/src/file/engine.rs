//! Copying file sets over a format stream.
//!
//! The sender writes every declared file back to back; the receiver reads
//! exactly the declared size of each file. No per-file framing is needed
//! because both sides hold the same descriptor.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use super::cancel::{is_cancelled, CancellableReader, CancellableWriter};
use super::progress::ProgressReporter;
use super::{safe_relative_path, target_dst_path_name, FileDropData};
use crate::error::{Error, Result};
use crate::queue::CancelHandle;

/// Buffer and timeout settings of a copy.
#[derive(Debug, Clone, Copy)]
pub struct CopyOptions {
    /// Copy buffer size
    pub chunk_size: usize,
    /// Timeout of every single read or write
    pub io_timeout: Duration,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            io_timeout: Duration::from_secs(30),
        }
    }
}

fn timed_out() -> io::Error {
    io::Error::from(io::ErrorKind::TimedOut)
}

fn copy_error(err: io::Error, cancel: &CancelHandle, options: &CopyOptions) -> Error {
    if is_cancelled(&err) || cancel.is_cancelled() {
        cancel.cancellation_error()
    } else if err.kind() == io::ErrorKind::TimedOut {
        Error::Timeout(options.io_timeout)
    } else {
        Error::from_stream(err)
    }
}

/// Copy up to `len` bytes. Returns the number copied, which is short only
/// if the reader hit EOF.
async fn copy_exact<R, W>(
    reader: &mut R,
    writer: &mut W,
    len: u64,
    options: &CopyOptions,
    progress: &ProgressReporter,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; options.chunk_size];
    let mut copied = 0u64;

    while copied < len {
        let want = usize::try_from(len - copied).map_or(buf.len(), |rest| rest.min(buf.len()));
        let n = timeout(options.io_timeout, reader.read(&mut buf[..want]))
            .await
            .map_err(|_| timed_out())??;
        if n == 0 {
            break;
        }
        timeout(options.io_timeout, writer.write_all(&buf[..n]))
            .await
            .map_err(|_| timed_out())??;

        copied += n as u64;
        progress.add_bytes(n as u64);
        tracing::trace!("Copied chunk of {} bytes ({}/{})", n, copied, len);
    }

    Ok(copied)
}

/// Check that every source file of `descriptor` is still a readable file
/// of the declared size or larger.
///
/// # Errors
///
/// Returns `FileOpenFailed` for the first file that is gone or shrank.
pub async fn verify_sources(descriptor: &FileDropData) -> Result<()> {
    for info in &descriptor.files {
        let failed = |reason: String| Error::FileOpenFailed {
            path: info.path.clone(),
            reason,
        };
        let meta = tokio::fs::metadata(&info.path)
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !meta.is_file() || meta.len() < info.size() {
            return Err(failed(format!(
                "no longer a file of {} bytes",
                info.size()
            )));
        }
    }
    Ok(())
}

/// Stream every file of `descriptor` into `stream`.
///
/// # Errors
///
/// Returns `FileOpenFailed` if a source file cannot be opened, `CopyIncomplete`
/// if a file is shorter than declared, the cancellation error of `cancel` if
/// the transfer was cancelled, and a transport error if the stream fails.
pub async fn send_files<W>(
    stream: &mut W,
    descriptor: &FileDropData,
    cancel: &CancelHandle,
    options: &CopyOptions,
    progress: &ProgressReporter,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if descriptor.files.len() > 1 || !descriptor.folders.is_empty() {
        tracing::info!(
            "Sending {} files in {} folders ({})",
            descriptor.files.len(),
            descriptor.folders.len(),
            descriptor.total_desc
        );
    }

    let mut writer = CancellableWriter::new(stream, cancel.token());

    for (index, info) in descriptor.files.iter().enumerate() {
        progress.start_file(index, &info.name);

        let open_failed = |e: io::Error| Error::FileOpenFailed {
            path: info.path.clone(),
            reason: e.to_string(),
        };
        let mut file = File::open(&info.path).await.map_err(open_failed)?;
        file.seek(SeekFrom::Start(0)).await.map_err(open_failed)?;

        let mut reader = CancellableReader::new(file, cancel.token());
        let copied = copy_exact(&mut reader, &mut writer, info.size(), options, progress)
            .await
            .map_err(|e| copy_error(e, cancel, options))?;

        if copied < info.size() {
            return Err(Error::CopyIncomplete {
                file: info.name.clone(),
                expected: info.size(),
                written: copied,
            });
        }
        tracing::debug!("Sent {} ({} bytes)", info.name, copied);
    }

    timeout(options.io_timeout, writer.flush())
        .await
        .map_err(|_| timed_out())
        .and_then(|r| r)
        .map_err(|e| copy_error(e, cancel, options))
}

/// Read every file of `descriptor` from `stream` into `dst_dir`.
///
/// Folders are created first, calling `on_folder` for each. Files get
/// collision-free names. A file that fails part way is deleted.
///
/// Returns the paths written.
///
/// # Errors
///
/// Returns `InvalidPath` for unsafe names, `FileOpenFailed` if a destination
/// cannot be created, `CopyIncomplete` if the stream ends early, the
/// cancellation error of `cancel` if the transfer was cancelled, and a
/// transport error if the stream fails.
pub async fn receive_files<R, F>(
    stream: &mut R,
    descriptor: &FileDropData,
    dst_dir: &Path,
    cancel: &CancelHandle,
    options: &CopyOptions,
    progress: &ProgressReporter,
    mut on_folder: F,
) -> Result<Vec<PathBuf>>
where
    R: AsyncRead + Unpin,
    F: FnMut(&Path) + Send,
{
    let create_failed = |path: &Path, e: io::Error| Error::FileOpenFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    };

    tokio::fs::create_dir_all(dst_dir)
        .await
        .map_err(|e| create_failed(dst_dir, e))?;

    for folder in &descriptor.folders {
        let path = dst_dir.join(safe_relative_path(folder)?);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| create_failed(&path, e))?;
        on_folder(&path);
    }

    let mut reader = CancellableReader::new(stream, cancel.token());
    let mut written = Vec::with_capacity(descriptor.files.len());

    for (index, info) in descriptor.files.iter().enumerate() {
        progress.start_file(index, &info.name);

        let target = target_dst_path_name(&dst_dir.join(safe_relative_path(&info.name)?));
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| create_failed(parent, e))?;
        }
        let file = File::create(&target)
            .await
            .map_err(|e| create_failed(&target, e))?;
        let mut writer = CancellableWriter::new(file, cancel.token());

        let result = match copy_exact(&mut reader, &mut writer, info.size(), options, progress).await
        {
            Ok(n) if n == info.size() => writer
                .flush()
                .await
                .map_err(|e| copy_error(e, cancel, options)),
            Ok(n) => Err(Error::CopyIncomplete {
                file: info.name.clone(),
                expected: info.size(),
                written: n,
            }),
            Err(e) => Err(copy_error(e, cancel, options)),
        };

        if let Err(e) = result {
            drop(writer);
            if let Err(remove_err) = tokio::fs::remove_file(&target).await {
                tracing::warn!(
                    "Failed to delete partial file {}: {}",
                    target.display(),
                    remove_err
                );
            }
            return Err(e);
        }

        tracing::debug!("Received {} -> {}", info.name, target.display());
        written.push(target);
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileInfo;
    use crate::queue::{CancelOrigin, Direction};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn handle() -> CancelHandle {
        CancelHandle::child_of(&CancellationToken::new(), "desk")
    }

    #[tokio::test]
    async fn test_vanished_or_shrunk_source_is_caught() {
        let src = TempDir::new().expect("tempdir");
        let a = src.path().join("a.bin");
        std::fs::write(&a, vec![1u8; 100]).expect("write");

        let descriptor = FileDropData::from_paths(&[a.clone()], 1).expect("describe");
        verify_sources(&descriptor).await.expect("all present");

        std::fs::write(&a, vec![1u8; 40]).expect("truncate");
        assert!(matches!(
            verify_sources(&descriptor).await,
            Err(Error::FileOpenFailed { .. })
        ));

        std::fs::remove_file(&a).expect("remove");
        let err = verify_sources(&descriptor).await.expect_err("gone");
        assert_eq!(err.interrupt_code(), crate::protocol::InterruptCode::FileNotFound);
    }

    #[tokio::test]
    async fn test_send_then_receive() {
        let src = TempDir::new().expect("tempdir");
        let dst = TempDir::new().expect("tempdir");
        let a = src.path().join("a.txt");
        let b = src.path().join("b.bin");
        std::fs::write(&a, b"hello").expect("write");
        std::fs::write(&b, vec![7u8; 3000]).expect("write");

        let descriptor = FileDropData::from_paths(&[a, b], 42).expect("describe");
        let options = CopyOptions {
            chunk_size: 1024,
            ..CopyOptions::default()
        };
        let (mut tx, mut rx) = tokio::io::duplex(512);

        let sender = {
            let descriptor = descriptor.clone();
            tokio::spawn(async move {
                let progress = ProgressReporter::new("desk", &descriptor, Direction::AsSrc);
                send_files(&mut tx, &descriptor, &handle(), &options, &progress).await
            })
        };

        let progress = ProgressReporter::new("laptop", &descriptor, Direction::AsDst);
        let written = receive_files(
            &mut rx,
            &descriptor,
            dst.path(),
            &handle(),
            &options,
            &progress,
            |_| {},
        )
        .await
        .expect("receive");

        sender.await.expect("join").expect("send");
        assert_eq!(written.len(), 2);
        assert_eq!(std::fs::read(dst.path().join("a.txt")).expect("read"), b"hello");
        assert_eq!(std::fs::read(dst.path().join("b.bin")).expect("read").len(), 3000);
        assert_eq!(progress.snapshot().bytes_transferred, 3005);
    }

    #[tokio::test]
    async fn test_incomplete_receive_deletes_partial_file() {
        let dst = TempDir::new().expect("tempdir");
        let descriptor = FileDropData::new(42, vec![FileInfo::new("/src/x.bin", "x.bin", 1000)]);
        let (mut tx, mut rx) = tokio::io::duplex(4096);

        tx.write_all(&[1u8; 600]).await.expect("write");
        drop(tx);

        let progress = ProgressReporter::new("desk", &descriptor, Direction::AsDst);
        let result = receive_files(
            &mut rx,
            &descriptor,
            dst.path(),
            &handle(),
            &CopyOptions::default(),
            &progress,
            |_| {},
        )
        .await;

        match result {
            Err(Error::CopyIncomplete {
                expected, written, ..
            }) => {
                assert_eq!(expected, 1000);
                assert_eq!(written, 600);
            }
            other => panic!("expected CopyIncomplete, got {other:?}"),
        }
        assert!(!dst.path().join("x.bin").exists());
    }

    #[tokio::test]
    async fn test_local_cancel_mid_copy() {
        let dst = TempDir::new().expect("tempdir");
        let descriptor = FileDropData::new(42, vec![FileInfo::new("/src/x.bin", "x.bin", 1000)]);
        let (mut tx, mut rx) = tokio::io::duplex(4096);
        tx.write_all(&[1u8; 100]).await.expect("write");

        let cancel = handle();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel(CancelOrigin::LocalUi);
        });

        let progress = ProgressReporter::new("desk", &descriptor, Direction::AsDst);
        let result = receive_files(
            &mut rx,
            &descriptor,
            dst.path(),
            &cancel,
            &CopyOptions::default(),
            &progress,
            |_| {},
        )
        .await;

        assert!(matches!(result, Err(Error::CancelledLocal)));
        assert!(!dst.path().join("x.bin").exists());
        drop(tx);
    }

    #[tokio::test]
    async fn test_missing_source_file() {
        let descriptor =
            FileDropData::new(1, vec![FileInfo::new("/definitely/not/here.bin", "here.bin", 10)]);
        let progress = ProgressReporter::new("desk", &descriptor, Direction::AsSrc);
        let mut sink = Vec::new();

        let result = send_files(
            &mut sink,
            &descriptor,
            &handle(),
            &CopyOptions::default(),
            &progress,
        )
        .await;

        assert!(matches!(result, Err(Error::FileOpenFailed { .. })));
    }

    #[tokio::test]
    async fn test_folders_created_first() {
        let dst = TempDir::new().expect("tempdir");
        let mut descriptor = FileDropData::new(3, Vec::new());
        descriptor.folders = vec!["album/".to_string(), "album/raw/".to_string()];
        let progress = ProgressReporter::new("desk", &descriptor, Direction::AsDst);
        let mut created = Vec::new();

        receive_files(
            &mut tokio::io::empty(),
            &descriptor,
            dst.path(),
            &handle(),
            &CopyOptions::default(),
            &progress,
            |p| created.push(p.to_path_buf()),
        )
        .await
        .expect("receive");

        assert_eq!(created.len(), 2);
        assert!(dst.path().join("album").join("raw").is_dir());
    }

    #[tokio::test]
    async fn test_unsafe_name_is_rejected() {
        let dst = TempDir::new().expect("tempdir");
        let descriptor = FileDropData::new(4, vec![FileInfo::new("/x", "../escape.txt", 1)]);
        let progress = ProgressReporter::new("desk", &descriptor, Direction::AsDst);

        let result = receive_files(
            &mut tokio::io::empty(),
            &descriptor,
            dst.path(),
            &handle(),
            &CopyOptions::default(),
            &progress,
            |_| {},
        )
        .await;

        assert!(matches!(result, Err(Error::InvalidPath(_))));
    }
}
