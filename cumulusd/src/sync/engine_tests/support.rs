//! In-memory remote store double shared by the engine and monitor tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cumulus_remote::{
    ByteStream, ChangePage, FileMeta, RemoteChange, RemoteClient, RemoteError, bytes_stream,
};
use futures_util::StreamExt;
use tokio::sync::Notify;

use crate::sync::engine::SyncEngine;
use crate::sync::exclude::{ExcludeRules, SelectiveSync};
use crate::sync::hasher::hash_bytes;
use crate::sync::index::IndexStore;
use crate::sync::paths::PathResolver;

#[derive(Debug, Clone)]
enum Stored {
    Folder { display: String },
    File { display: String, rev: String, content: Vec<u8> },
}

impl Stored {
    fn display(&self) -> &str {
        match self {
            Stored::Folder { display } | Stored::File { display, .. } => display,
        }
    }
}

#[derive(Default)]
struct RemoteState {
    items: BTreeMap<String, Stored>,
    log: Vec<RemoteChange>,
    rev_counter: u64,
    reset_pending: bool,
    fail_uploads: u32,
    fail_downloads: u32,
}

/// In-memory remote store: case-insensitive, case-preserving, rev-per-write,
/// change log addressed by an integer cursor.
pub(crate) struct FakeRemote {
    state: Mutex<RemoteState>,
    changed: Notify,
}

impl FakeRemote {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RemoteState::default()),
            changed: Notify::new(),
        })
    }

    fn canon(path: &str) -> String {
        path.to_lowercase()
    }

    fn next_rev(state: &mut RemoteState) -> String {
        state.rev_counter += 1;
        format!("r{}", state.rev_counter)
    }

    fn meta_for(path_display: &str, rev: &str, content: &[u8]) -> FileMeta {
        FileMeta {
            path: path_display.to_string(),
            rev: rev.to_string(),
            content_hash: hash_bytes(content),
            server_modified_ms: 0,
        }
    }

    /// Seeds or overwrites a file server-side, logging the change.
    pub(crate) fn put_file(&self, path: &str, content: &[u8]) -> FileMeta {
        let mut state = self.state.lock().unwrap();
        let rev = Self::next_rev(&mut state);
        state.items.insert(
            Self::canon(path),
            Stored::File {
                display: path.to_string(),
                rev: rev.clone(),
                content: content.to_vec(),
            },
        );
        let meta = Self::meta_for(path, &rev, content);
        state.log.push(RemoteChange::File(meta.clone()));
        drop(state);
        self.changed.notify_waiters();
        meta
    }

    pub(crate) fn put_folder(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        state.items.insert(
            Self::canon(path),
            Stored::Folder {
                display: path.to_string(),
            },
        );
        state.log.push(RemoteChange::Folder {
            path: path.to_string(),
        });
        drop(state);
        self.changed.notify_waiters();
    }

    pub(crate) fn delete_path(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        let canon = Self::canon(path);
        let keys: Vec<String> = state
            .items
            .keys()
            .filter(|key| crate::sync::paths::is_equal_or_under(key, &canon))
            .cloned()
            .collect();
        let mut displays: Vec<String> = Vec::new();
        for key in keys {
            if let Some(stored) = state.items.remove(&key) {
                displays.push(stored.display().to_string());
            }
        }
        // Children first so hierarchical delete order holds in the log.
        displays.sort_by_key(|display| std::cmp::Reverse(display.matches('/').count()));
        for display in displays {
            state.log.push(RemoteChange::Deleted { path: display });
        }
        drop(state);
        self.changed.notify_waiters();
    }

    pub(crate) fn invalidate_cursor(&self) {
        self.state.lock().unwrap().reset_pending = true;
        self.changed.notify_waiters();
    }

    /// Logs a file change without storing content, mimicking an item that
    /// was removed between listing and download.
    pub(crate) fn log_ghost_file(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        let rev = Self::next_rev(&mut state);
        state.log.push(RemoteChange::File(FileMeta {
            path: path.to_string(),
            rev,
            content_hash: "ghost".into(),
            server_modified_ms: 0,
        }));
        drop(state);
        self.changed.notify_waiters();
    }

    pub(crate) fn fail_next_uploads(&self, count: u32) {
        self.state.lock().unwrap().fail_uploads = count;
    }

    pub(crate) fn fail_next_downloads(&self, count: u32) {
        self.state.lock().unwrap().fail_downloads = count;
    }

    pub(crate) fn file_content(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.lock().unwrap().items.get(&Self::canon(path)) {
            Some(Stored::File { content, .. }) => Some(content.clone()),
            _ => None,
        }
    }

    pub(crate) fn file_rev(&self, path: &str) -> Option<String> {
        match self.state.lock().unwrap().items.get(&Self::canon(path)) {
            Some(Stored::File { rev, .. }) => Some(rev.clone()),
            _ => None,
        }
    }

    pub(crate) fn exists(&self, path: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .items
            .contains_key(&Self::canon(path))
    }

    fn snapshot_changes(state: &RemoteState) -> Vec<RemoteChange> {
        state
            .items
            .values()
            .map(|stored| match stored {
                Stored::Folder { display } => RemoteChange::Folder {
                    path: display.clone(),
                },
                Stored::File {
                    display,
                    rev,
                    content,
                } => RemoteChange::File(Self::meta_for(display, rev, content)),
            })
            .collect()
    }
}

#[async_trait]
impl RemoteClient for FakeRemote {
    async fn list_changes(&self, cursor: Option<&str>) -> Result<ChangePage, RemoteError> {
        let mut state = self.state.lock().unwrap();
        match cursor {
            None => Ok(ChangePage {
                changes: Self::snapshot_changes(&state),
                cursor: state.log.len().to_string(),
                reset: false,
            }),
            Some(cursor) => {
                if state.reset_pending {
                    state.reset_pending = false;
                    return Ok(ChangePage {
                        changes: Vec::new(),
                        cursor: state.log.len().to_string(),
                        reset: true,
                    });
                }
                let from: usize = cursor
                    .parse()
                    .map_err(|_| RemoteError::Server("bad cursor".into()))?;
                let from = from.min(state.log.len());
                Ok(ChangePage {
                    changes: state.log[from..].to_vec(),
                    cursor: state.log.len().to_string(),
                    reset: false,
                })
            }
        }
    }

    async fn wait_for_changes(&self, cursor: &str) -> Result<(), RemoteError> {
        let from: usize = cursor
            .parse()
            .map_err(|_| RemoteError::Server("bad cursor".into()))?;
        loop {
            let notified = self.changed.notified();
            {
                let state = self.state.lock().unwrap();
                if state.log.len() > from || state.reset_pending {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    async fn download(&self, path: &str, _rev: &str) -> Result<ByteStream, RemoteError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_downloads > 0 {
            state.fail_downloads -= 1;
            return Err(RemoteError::Network("injected download failure".into()));
        }
        match state.items.get(&Self::canon(path)) {
            Some(Stored::File { content, .. }) => Ok(bytes_stream(content.clone())),
            _ => Err(RemoteError::NotFound),
        }
    }

    async fn upload(
        &self,
        path: &str,
        mut body: ByteStream,
        if_match: Option<&str>,
    ) -> Result<FileMeta, RemoteError> {
        let mut content = Vec::new();
        while let Some(chunk) = body.next().await {
            content.extend_from_slice(&chunk.map_err(|e| RemoteError::Network(e.to_string()))?);
        }

        let mut state = self.state.lock().unwrap();
        if state.fail_uploads > 0 {
            state.fail_uploads -= 1;
            return Err(RemoteError::Network("injected upload failure".into()));
        }

        let canon = Self::canon(path);
        let current_rev = match state.items.get(&canon) {
            Some(Stored::File { rev, .. }) => Some(rev.clone()),
            Some(Stored::Folder { .. }) => Some(crate::sync::index::FOLDER_REV.to_string()),
            None => None,
        };
        if let Some(if_match) = if_match
            && current_rev.as_deref() != Some(if_match)
        {
            // The server keeps the rejected body as a conflict copy.
            let copy_path = crate::sync::conflict::conflict_copy_path(
                path,
                crate::sync::conflict::CONFLICT_COPY_SUFFIX,
                &|candidate: &str| state.items.contains_key(&Self::canon(candidate)),
            );
            let rev = Self::next_rev(&mut state);
            state.items.insert(
                Self::canon(&copy_path),
                Stored::File {
                    display: copy_path.clone(),
                    rev: rev.clone(),
                    content: content.clone(),
                },
            );
            let meta = Self::meta_for(&copy_path, &rev, &content);
            state.log.push(RemoteChange::File(meta));
            drop(state);
            self.changed.notify_waiters();
            return Err(RemoteError::Conflict {
                latest_rev: current_rev,
            });
        }

        let rev = Self::next_rev(&mut state);
        state.items.insert(
            canon,
            Stored::File {
                display: path.to_string(),
                rev: rev.clone(),
                content: content.clone(),
            },
        );
        let meta = Self::meta_for(path, &rev, &content);
        state.log.push(RemoteChange::File(meta.clone()));
        drop(state);
        self.changed.notify_waiters();
        Ok(meta)
    }

    async fn delete(&self, path: &str, _if_match: Option<&str>) -> Result<(), RemoteError> {
        if !self.exists(path) {
            return Err(RemoteError::NotFound);
        }
        self.delete_path(path);
        Ok(())
    }

    async fn create_folder(&self, path: &str) -> Result<(), RemoteError> {
        self.put_folder(path);
        Ok(())
    }

    async fn move_item(
        &self,
        from: &str,
        to: &str,
        _if_match: Option<&str>,
    ) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        let from_canon = Self::canon(from);
        let keys: Vec<String> = state
            .items
            .keys()
            .filter(|key| crate::sync::paths::is_equal_or_under(key, &from_canon))
            .cloned()
            .collect();
        if keys.is_empty() {
            return Err(RemoteError::NotFound);
        }
        for key in keys {
            let Some(stored) = state.items.remove(&key) else {
                continue;
            };
            let suffix = key.strip_prefix(&from_canon).unwrap_or("");
            let new_display = format!("{to}{suffix}");
            state
                .log
                .push(RemoteChange::Deleted { path: stored.display().to_string() });
            let replaced = match stored {
                Stored::Folder { .. } => Stored::Folder {
                    display: new_display.clone(),
                },
                Stored::File { rev, content, .. } => Stored::File {
                    display: new_display.clone(),
                    rev,
                    content,
                },
            };
            match &replaced {
                Stored::Folder { display } => state.log.push(RemoteChange::Folder {
                    path: display.clone(),
                }),
                Stored::File {
                    display,
                    rev,
                    content,
                } => {
                    let meta = Self::meta_for(display, rev, content);
                    state.log.push(RemoteChange::File(meta));
                }
            }
            state.items.insert(Self::canon(&new_display), replaced);
        }
        drop(state);
        self.changed.notify_waiters();
        Ok(())
    }

    async fn list_folder(&self, path: &str) -> Result<Vec<RemoteChange>, RemoteError> {
        let state = self.state.lock().unwrap();
        let canon = Self::canon(path);
        let prefix = if canon == "/" { String::new() } else { canon };
        let out = state
            .items
            .iter()
            .filter(|(key, _)| {
                key.starts_with(&format!("{prefix}/"))
                    && !key[prefix.len() + 1..].contains('/')
            })
            .map(|(_, stored)| match stored {
                Stored::Folder { display } => RemoteChange::Folder {
                    path: display.clone(),
                },
                Stored::File {
                    display,
                    rev,
                    content,
                } => RemoteChange::File(Self::meta_for(display, rev, content)),
            })
            .collect();
        Ok(out)
    }
}

/// A sync engine wired to a tempdir and the in-memory remote.
pub(crate) struct Harness {
    _dir: tempfile::TempDir,
    pub remote: Arc<FakeRemote>,
    pub engine: Arc<SyncEngine>,
}

impl Harness {
    pub(crate) async fn new() -> Self {
        Self::with_rules(ExcludeRules::permissive()).await
    }

    pub(crate) async fn with_selective_sync(excluded_roots: Vec<String>) -> Self {
        struct Roots(Vec<String>);
        impl SelectiveSync for Roots {
            fn is_excluded(&self, canonical_path: &str) -> bool {
                self.0
                    .iter()
                    .any(|root| crate::sync::paths::is_equal_or_under(canonical_path, root))
            }
        }
        Self::with_rules(ExcludeRules::new(Arc::new(Roots(excluded_roots)), None)).await
    }

    async fn with_rules(rules: ExcludeRules) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new();
        let resolver = Arc::new(PathResolver::new(dir.path().to_path_buf(), true));
        let index = IndexStore::in_memory().await.unwrap();
        let engine = Arc::new(SyncEngine::new(
            remote.clone(),
            index,
            resolver,
            Arc::new(rules),
        ));
        Self {
            _dir: dir,
            remote,
            engine,
        }
    }

    pub(crate) fn local_path(&self, remote_path: &str) -> std::path::PathBuf {
        self.engine
            .resolver()
            .local_path_for(remote_path)
            .unwrap()
    }

    pub(crate) async fn write_local(&self, remote_path: &str, content: &[u8]) {
        let local = self.local_path(remote_path);
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(local, content).await.unwrap();
    }

    pub(crate) async fn read_local(&self, remote_path: &str) -> Option<Vec<u8>> {
        tokio::fs::read(self.local_path(remote_path)).await.ok()
    }
}
