use std::io;
use std::path::{Path, PathBuf};

use cumulus_remote::ByteStream;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use super::exclude::PARTIAL_SUFFIX;
use super::hasher::BlockHasher;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("download integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
}

/// Streams remote content to `<target>.partial`, verifies the content hash,
/// and renames over the target so readers never observe a torn file.
pub async fn stage_download(
    mut stream: ByteStream,
    target: &Path,
    expected_hash: Option<&str>,
    cancel: &CancellationToken,
) -> Result<(), TransferError> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = partial_path(target);
    let mut file = tokio::fs::File::create(&partial).await?;
    let mut hasher = expected_hash.map(|_| BlockHasher::new());

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                drop(file);
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(TransferError::Cancelled);
            }
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = chunk else { break };
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                drop(file);
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(err.into());
            }
        };
        file.write_all(&chunk).await?;
        if let Some(hasher) = hasher.as_mut() {
            hasher.consume(&chunk);
        }
    }

    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if let (Some(expected), Some(hasher)) = (expected_hash, hasher) {
        let actual = hasher.finalize();
        if actual != expected.to_ascii_lowercase() {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(TransferError::IntegrityMismatch {
                expected: expected.to_ascii_lowercase(),
                actual,
            });
        }
    }

    tokio::fs::rename(&partial, target).await?;
    Ok(())
}

/// Opens a local file as the byte stream the remote capability uploads.
pub async fn upload_stream(source: &Path) -> io::Result<(ByteStream, u64)> {
    let file = tokio::fs::File::open(source).await?;
    let len = file.metadata().await?.len();
    let stream: ByteStream = Box::pin(ReaderStream::new(file));
    Ok((stream, len))
}

pub fn partial_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(PARTIAL_SUFFIX);
    target.with_file_name(name)
}

/// Removes staging leftovers under `root`. Returns how many were deleted.
pub async fn cleanup_partials(root: &Path) -> io::Result<usize> {
    let mut removed = 0usize;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(path);
            } else if path
                .file_name()
                .map(|n| n.to_string_lossy().ends_with(PARTIAL_SUFFIX))
                .unwrap_or(false)
            {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::hasher::hash_bytes;
    use cumulus_remote::bytes_stream;
    use tempfile::tempdir;

    #[tokio::test]
    async fn stages_download_through_partial_file() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("nested/out.txt");
        let hash = hash_bytes(b"hello");
        let cancel = CancellationToken::new();

        stage_download(
            bytes_stream(b"hello".to_vec()),
            &target,
            Some(&hash),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"hello");
        assert!(!partial_path(&target).exists());
    }

    #[tokio::test]
    async fn removes_partial_on_hash_mismatch() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("bad.txt");
        let cancel = CancellationToken::new();

        let err = stage_download(
            bytes_stream(b"hello".to_vec()),
            &target,
            Some("deadbeef"),
            &cancel,
        )
        .await
        .expect_err("expected integrity mismatch");

        assert!(matches!(err, TransferError::IntegrityMismatch { .. }));
        assert!(!target.exists());
        assert!(!partial_path(&target).exists());
    }

    #[tokio::test]
    async fn cancelled_download_leaves_no_partial() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("c.txt");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = stage_download(bytes_stream(b"hello".to_vec()), &target, None, &cancel)
            .await
            .expect_err("expected cancellation");
        assert!(matches!(err, TransferError::Cancelled));
        assert!(!target.exists());
        assert!(!partial_path(&target).exists());
    }

    #[tokio::test]
    async fn upload_stream_reads_file_contents() {
        use futures_util::StreamExt;
        let dir = tempdir().unwrap();
        let source = dir.path().join("in.bin");
        tokio::fs::write(&source, b"payload").await.unwrap();

        let (mut stream, len) = upload_stream(&source).await.unwrap();
        assert_eq!(len, 7);
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"payload");
    }

    #[tokio::test]
    async fn cleanup_removes_only_partials() {
        let dir = tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("sub"))
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("keep.txt"), b"x")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("sub/stale.txt.partial"), b"x")
            .await
            .unwrap();

        let removed = cleanup_partials(dir.path()).await.unwrap();
        assert_eq!(removed, 1);
        assert!(dir.path().join("keep.txt").exists());
        assert!(!dir.path().join("sub/stale.txt.partial").exists());
    }

    #[test]
    fn partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("/x/a.txt")),
            PathBuf::from("/x/a.txt.partial")
        );
        assert_eq!(partial_path(Path::new("/x/a")), PathBuf::from("/x/a.partial"));
    }
}
