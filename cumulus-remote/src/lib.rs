//! Capability seam between the cumulus sync engine and a cloud file store.
//!
//! The engine never talks HTTP. It consumes a [`RemoteClient`], which a host
//! application implements against the real service (or in-memory, for tests).
//! The remote is case-preserving but case-insensitive, identifies file
//! versions by an opaque `rev` string, and exposes a change stream addressed
//! by an opaque cursor.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_core::Stream;
use thiserror::Error;

/// Byte stream used for file content in both directions.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Builds a [`ByteStream`] over an in-memory buffer.
pub fn bytes_stream(data: Vec<u8>) -> ByteStream {
    Box::pin(futures_util::stream::once(async move {
        Ok(Bytes::from(data))
    }))
}

/// Metadata of a single remote file version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    /// Display path, case preserved by the server.
    pub path: String,
    pub rev: String,
    pub content_hash: String,
    pub server_modified_ms: i64,
}

/// One entry in the remote change stream.
///
/// The server only ever reports deletions, folder metadata, or file metadata;
/// moves and modifications show up as fresh metadata at the new state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteChange {
    Deleted { path: String },
    Folder { path: String },
    File(FileMeta),
}

impl RemoteChange {
    pub fn path(&self) -> &str {
        match self {
            RemoteChange::Deleted { path } | RemoteChange::Folder { path } => path,
            RemoteChange::File(meta) => &meta.path,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, RemoteChange::Deleted { .. })
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, RemoteChange::Folder { .. })
    }

    pub fn is_file(&self) -> bool {
        matches!(self, RemoteChange::File(_))
    }
}

/// One page of the change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangePage {
    pub changes: Vec<RemoteChange>,
    /// Cursor to resume from after this page has been applied.
    pub cursor: String,
    /// The server invalidated the supplied cursor; `changes` is empty and the
    /// caller must re-list the full tree.
    pub reset: bool,
}

/// Error surface of the remote capability.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("authorization expired")]
    AuthExpired,
    #[error("item not found")]
    NotFound,
    #[error("revision mismatch")]
    Conflict { latest_rev: Option<String> },
    #[error("insufficient quota")]
    InsufficientQuota,
    #[error("permission denied")]
    PermissionDenied,
    #[error("server error: {0}")]
    Server(String),
}

/// Retry policy bucket for a [`RemoteError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff.
    Transient,
    /// Retry after the server-provided delay.
    RateLimit,
    /// Halt both directions until re-authorized.
    Auth,
    /// Surface to the monitor; retrying will not help.
    Permanent,
}

impl RemoteError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RemoteError::Network(_) | RemoteError::Server(_) => ErrorClass::Transient,
            RemoteError::RateLimited { .. } => ErrorClass::RateLimit,
            RemoteError::AuthExpired => ErrorClass::Auth,
            RemoteError::NotFound
            | RemoteError::Conflict { .. }
            | RemoteError::InsufficientQuota
            | RemoteError::PermissionDenied => ErrorClass::Permanent,
        }
    }
}

/// The remote file-store capability.
///
/// Implementations must be thread-safe; the engine shares a single instance
/// across its apply workers. Rate limiting is the implementation's concern.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Lists changes since `cursor`. `None` lists the full tree from scratch
    /// and returns a cursor representing the current server state.
    async fn list_changes(&self, cursor: Option<&str>) -> Result<ChangePage, RemoteError>;

    /// Long-polls until changes are available past `cursor`.
    async fn wait_for_changes(&self, cursor: &str) -> Result<(), RemoteError>;

    /// Streams the content of `path` at version `rev`.
    async fn download(&self, path: &str, rev: &str) -> Result<ByteStream, RemoteError>;

    /// Uploads file content. With `if_match`, the server rejects the write
    /// with [`RemoteError::Conflict`] when the current rev differs and stores
    /// the body as a server-side conflict copy instead.
    async fn upload(
        &self,
        path: &str,
        body: ByteStream,
        if_match: Option<&str>,
    ) -> Result<FileMeta, RemoteError>;

    async fn delete(&self, path: &str, if_match: Option<&str>) -> Result<(), RemoteError>;

    async fn create_folder(&self, path: &str) -> Result<(), RemoteError>;

    async fn move_item(
        &self,
        from: &str,
        to: &str,
        if_match: Option<&str>,
    ) -> Result<(), RemoteError>;

    /// Lists the immediate children of `path`. Full-tree snapshots go
    /// through `list_changes(None)` instead.
    async fn list_folder(&self, path: &str) -> Result<Vec<RemoteChange>, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn error_classes_follow_retry_policy() {
        assert_eq!(
            RemoteError::Network("reset".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            RemoteError::RateLimited { retry_after: None }.class(),
            ErrorClass::RateLimit
        );
        assert_eq!(RemoteError::AuthExpired.class(), ErrorClass::Auth);
        assert_eq!(RemoteError::NotFound.class(), ErrorClass::Permanent);
        assert_eq!(
            RemoteError::Conflict { latest_rev: None }.class(),
            ErrorClass::Permanent
        );
    }

    #[tokio::test]
    async fn bytes_stream_yields_buffer_once() {
        let mut stream = bytes_stream(b"hello".to_vec());
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(&first[..], b"hello");
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn change_path_accessor_covers_all_variants() {
        let deleted = RemoteChange::Deleted { path: "/a".into() };
        let folder = RemoteChange::Folder { path: "/b".into() };
        let file = RemoteChange::File(FileMeta {
            path: "/c.txt".into(),
            rev: "r1".into(),
            content_hash: "h1".into(),
            server_modified_ms: 0,
        });
        assert_eq!(deleted.path(), "/a");
        assert_eq!(folder.path(), "/b");
        assert_eq!(file.path(), "/c.txt");
        assert!(deleted.is_deleted() && folder.is_folder() && file.is_file());
    }
}
