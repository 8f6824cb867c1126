use std::sync::Arc;

use cumulus_remote::{RemoteChange, RemoteClient, RemoteError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One materialized batch of remote changes with the cursor that supersedes
/// it once the batch has been durably applied.
#[derive(Debug, Clone)]
pub struct RemoteBatch {
    pub changes: Vec<RemoteChange>,
    pub cursor: String,
    pub reset: bool,
}

/// Long-polls the remote change stream and materializes [`RemoteBatch`]es.
pub struct RemoteFetcher {
    client: Arc<dyn RemoteClient>,
}

impl RemoteFetcher {
    pub fn new(client: Arc<dyn RemoteClient>) -> Self {
        Self { client }
    }

    /// Blocks on the server long-poll until changes are available past
    /// `cursor` or the token fires. Returns `false` on cancellation.
    pub async fn wait(
        &self,
        cursor: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, RemoteError> {
        tokio::select! {
            _ = cancel.cancelled() => Ok(false),
            result = self.client.wait_for_changes(cursor) => result.map(|()| true),
        }
    }

    /// Fetches changes since `cursor`; `None` performs a full listing and
    /// yields the cursor for the current server state.
    pub async fn fetch(&self, cursor: Option<&str>) -> Result<RemoteBatch, RemoteError> {
        let page = self.client.list_changes(cursor).await?;
        if page.reset {
            info!("remote cursor was invalidated, full re-list required");
            return Ok(RemoteBatch {
                changes: Vec::new(),
                cursor: page.cursor,
                reset: true,
            });
        }
        debug!(count = page.changes.len(), "fetched remote changes");
        Ok(RemoteBatch {
            changes: page.changes,
            cursor: page.cursor,
            reset: false,
        })
    }

    /// Full listing of the remote tree plus a fresh cursor, used at first run
    /// and after a cursor reset.
    pub async fn full_listing(&self) -> Result<RemoteBatch, RemoteError> {
        self.fetch(None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cumulus_remote::{ByteStream, ChangePage, FileMeta};
    use std::sync::Mutex;

    struct ScriptedRemote {
        pages: Mutex<Vec<ChangePage>>,
    }

    #[async_trait]
    impl RemoteClient for ScriptedRemote {
        async fn list_changes(&self, _cursor: Option<&str>) -> Result<ChangePage, RemoteError> {
            Ok(self.pages.lock().unwrap().remove(0))
        }

        async fn wait_for_changes(&self, _cursor: &str) -> Result<(), RemoteError> {
            std::future::pending::<()>().await;
            unreachable!()
        }

        async fn download(&self, _path: &str, _rev: &str) -> Result<ByteStream, RemoteError> {
            Err(RemoteError::NotFound)
        }

        async fn upload(
            &self,
            _path: &str,
            _body: ByteStream,
            _if_match: Option<&str>,
        ) -> Result<FileMeta, RemoteError> {
            Err(RemoteError::NotFound)
        }

        async fn delete(&self, _path: &str, _if_match: Option<&str>) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn create_folder(&self, _path: &str) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn move_item(
            &self,
            _from: &str,
            _to: &str,
            _if_match: Option<&str>,
        ) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn list_folder(&self, _path: &str) -> Result<Vec<RemoteChange>, RemoteError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn fetch_passes_changes_and_cursor_through() {
        let remote = ScriptedRemote {
            pages: Mutex::new(vec![ChangePage {
                changes: vec![RemoteChange::Folder { path: "/p".into() }],
                cursor: "cur-1".into(),
                reset: false,
            }]),
        };
        let fetcher = RemoteFetcher::new(Arc::new(remote));
        let batch = fetcher.fetch(Some("cur-0")).await.unwrap();
        assert_eq!(batch.changes.len(), 1);
        assert_eq!(batch.cursor, "cur-1");
        assert!(!batch.reset);
    }

    #[tokio::test]
    async fn fetch_surfaces_cursor_reset() {
        let remote = ScriptedRemote {
            pages: Mutex::new(vec![ChangePage {
                changes: vec![RemoteChange::Folder { path: "/stale".into() }],
                cursor: "cur-2".into(),
                reset: true,
            }]),
        };
        let fetcher = RemoteFetcher::new(Arc::new(remote));
        let batch = fetcher.fetch(Some("bad")).await.unwrap();
        assert!(batch.reset);
        assert!(batch.changes.is_empty());
    }

    #[tokio::test]
    async fn wait_returns_false_on_cancellation() {
        let remote = ScriptedRemote {
            pages: Mutex::new(Vec::new()),
        };
        let fetcher = RemoteFetcher::new(Arc::new(remote));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!fetcher.wait("cur", &cancel).await.unwrap());
    }
}
