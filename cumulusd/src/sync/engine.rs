use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cumulus_remote::{RemoteChange, RemoteClient, RemoteError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::conflict::{self, LocalDiskState, RemoteProbe, SyncAction};
use super::exclude::ExcludeRules;
use super::fs_events::LocalChange;
use super::hasher::{self, HashError, HashOutcome};
use super::index::{EntryMutation, IndexEntry, IndexError, IndexStore, ItemType};
use super::paths::{PathError, PathResolver};
use super::transfer::{self, TransferError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("hash error: {0}")]
    Hash(#[from] HashError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error kinds as the monitor's escalation table sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SyncErrorKind {
    Network,
    RateLimited,
    TempIo,
    AuthExpired,
    NotFound,
    Conflict,
    InsufficientQuota,
    PermissionDenied,
    StorageIo,
    StorageCorrupt,
    InvalidPath,
    Cancelled,
}

/// Terminal state of one applied change. Workers never raise; they package
/// outcomes and the monitor decides what escalates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Applied,
    Skipped,
    ConflictCopied { copy_path: String },
    Renamed { new_path: String },
    Failed {
        kind: SyncErrorKind,
        message: String,
        transient: bool,
        retry_after: Option<Duration>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub path: String,
    pub status: TaskStatus,
}

impl TaskOutcome {
    pub fn is_transient_failure(&self) -> bool {
        matches!(&self.status, TaskStatus::Failed { transient: true, .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match &self.status {
            TaskStatus::Failed { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Classifies an engine error for the escalation table and retry policy.
pub fn classify(err: &EngineError) -> (SyncErrorKind, bool, Option<Duration>) {
    match err {
        EngineError::Remote(remote) => match remote {
            RemoteError::Network(_) | RemoteError::Server(_) => (SyncErrorKind::Network, true, None),
            RemoteError::RateLimited { retry_after } => {
                (SyncErrorKind::RateLimited, true, *retry_after)
            }
            RemoteError::AuthExpired => (SyncErrorKind::AuthExpired, false, None),
            RemoteError::NotFound => (SyncErrorKind::NotFound, false, None),
            RemoteError::Conflict { .. } => (SyncErrorKind::Conflict, false, None),
            RemoteError::InsufficientQuota => (SyncErrorKind::InsufficientQuota, false, None),
            RemoteError::PermissionDenied => (SyncErrorKind::PermissionDenied, false, None),
        },
        EngineError::Index(index) if index.is_corrupt() => {
            (SyncErrorKind::StorageCorrupt, false, None)
        }
        EngineError::Index(_) => (SyncErrorKind::StorageIo, true, None),
        EngineError::Transfer(TransferError::Cancelled) => (SyncErrorKind::Cancelled, false, None),
        EngineError::Transfer(_) => (SyncErrorKind::TempIo, true, None),
        EngineError::Hash(_) => (SyncErrorKind::TempIo, true, None),
        EngineError::Path(_) => (SyncErrorKind::InvalidPath, false, None),
        EngineError::Io(_) => (SyncErrorKind::TempIo, true, None),
    }
}

/// The sync engine proper: owns the index and the remote capability and
/// applies one resolved change at a time. Batch scheduling, retries and
/// cursor advancement belong to the worker pool and the monitor.
pub struct SyncEngine {
    remote: Arc<dyn RemoteClient>,
    index: IndexStore,
    resolver: Arc<PathResolver>,
    rules: Arc<ExcludeRules>,
}

impl SyncEngine {
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        index: IndexStore,
        resolver: Arc<PathResolver>,
        rules: Arc<ExcludeRules>,
    ) -> Self {
        Self {
            remote,
            index,
            resolver,
            rules,
        }
    }

    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    pub fn resolver(&self) -> &Arc<PathResolver> {
        &self.resolver
    }

    pub fn rules(&self) -> &Arc<ExcludeRules> {
        &self.rules
    }

    pub fn remote(&self) -> &Arc<dyn RemoteClient> {
        &self.remote
    }

    /// Snapshot of live index item types, keyed by canonical path, for the
    /// normalizer's type lookups.
    pub async fn type_snapshot(
        &self,
    ) -> Result<std::collections::HashMap<String, ItemType>, EngineError> {
        let mut map = std::collections::HashMap::new();
        for (key, entry) in self.index.iter_prefix("/").await? {
            if entry.rev.is_some() {
                map.insert(key, entry.item_type);
            }
        }
        Ok(map)
    }

    /// Live local state for the path a change targets.
    async fn local_disk_state(&self, remote_path: &str) -> Result<LocalDiskState, EngineError> {
        let local = self.resolver.local_path_for(remote_path)?;
        let meta = match tokio::fs::metadata(&local).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LocalDiskState::absent());
            }
            Err(err) => return Err(err.into()),
        };

        if meta.is_dir() {
            let (mtime, has_children) = self.folder_scan(&local).await?;
            return Ok(LocalDiskState {
                exists: true,
                item_type: Some(ItemType::Folder),
                mtime_ms: mtime,
                content_hash: None,
                has_children,
            });
        }

        let mtime = system_time_ms(meta.modified().ok());
        let content_hash = match hasher::hash_file(&local).await? {
            HashOutcome::Hashed(hash) => Some(hash),
            HashOutcome::Folder => None,
            HashOutcome::Vanished => return Ok(LocalDiskState::absent()),
        };
        Ok(LocalDiskState {
            exists: true,
            item_type: Some(ItemType::File),
            mtime_ms: mtime,
            content_hash,
            has_children: false,
        })
    }

    /// Newest mtime across a folder and its visible children, plus whether
    /// any visible child remains. Applies the same exclusion rules as the
    /// event pipeline.
    async fn folder_scan(&self, local: &Path) -> Result<(i64, bool), EngineError> {
        let own = tokio::fs::metadata(local).await?;
        let mut newest = system_time_ms(own.modified().ok());
        let mut has_children = false;
        let mut entries = match tokio::fs::read_dir(local).await {
            Ok(entries) => entries,
            Err(_) => return Ok((newest, false)),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if ExcludeRules::is_always_excluded(&format!("/{name}")) {
                continue;
            }
            has_children = true;
            if let Ok(meta) = entry.metadata().await {
                newest = newest.max(system_time_ms(meta.modified().ok()));
            }
        }
        Ok((newest, has_children))
    }

    /// Name-collision probe against the live local tree, used when picking
    /// conflict-copy names.
    fn local_exists_probe(&self) -> impl Fn(&str) -> bool + '_ {
        move |candidate: &str| {
            self.resolver
                .local_path_for(candidate)
                .map(|local| local.exists())
                .unwrap_or(true)
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    system_time_ms(Some(std::time::SystemTime::now()))
}

fn system_time_ms(time: Option<std::time::SystemTime>) -> i64 {
    time.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

include!("engine_impl_down.rs");
include!("engine_impl_up.rs");

#[cfg(test)]
#[path = "engine_tests/mod.rs"]
pub(crate) mod tests;
