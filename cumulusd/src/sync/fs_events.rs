use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::exclude::ExcludeRules;
use super::index::ItemType;
use super::paths::{self, PathResolver};
use super::queue::DebouncedQueue;

/// Debounce window applied to the raw event stream.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// A cleaned local mutation in remote path space. This is the only event
/// shape downstream stages ever see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalChange {
    Created { path: String, item_type: ItemType },
    Deleted { path: String, item_type: ItemType },
    Modified { path: String },
    Moved { from: String, to: String, item_type: ItemType },
}

impl LocalChange {
    /// The path the change lands on (the destination for moves).
    pub fn path(&self) -> &str {
        match self {
            LocalChange::Created { path, .. }
            | LocalChange::Deleted { path, .. }
            | LocalChange::Modified { path } => path,
            LocalChange::Moved { to, .. } => to,
        }
    }

    pub fn item_type(&self) -> ItemType {
        match self {
            LocalChange::Created { item_type, .. }
            | LocalChange::Deleted { item_type, .. }
            | LocalChange::Moved { item_type, .. } => *item_type,
            LocalChange::Modified { .. } => ItemType::File,
        }
    }

    pub fn depth(&self) -> usize {
        paths::depth(self.path())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

/// A raw watcher event in local path space, before exclusion and debouncing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: RawEventKind,
    pub path: PathBuf,
    /// Destination for moves.
    pub dest: Option<PathBuf>,
    pub is_dir: bool,
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watcher backend error: {0}")]
    Backend(#[from] notify::Error),
    #[error("watcher is not started")]
    NotStarted,
}

/// The local file-system watcher capability.
#[async_trait]
pub trait LocalWatcher: Send {
    fn start(&mut self) -> Result<(), WatchError>;
    fn stop(&mut self);
    async fn next_event(&mut self, timeout: Duration) -> Option<RawEvent>;
}

/// [`LocalWatcher`] backed by the platform's recommended notify backend.
pub struct NotifyWatcher {
    root: PathBuf,
    watcher: Option<RecommendedWatcher>,
    rx: Option<mpsc::UnboundedReceiver<RawEvent>>,
}

impl NotifyWatcher {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            watcher: None,
            rx: None,
        }
    }
}

#[async_trait]
impl LocalWatcher for NotifyWatcher {
    fn start(&mut self) -> Result<(), WatchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                for raw in map_notify_event(event) {
                    let _ = tx.send(raw);
                }
            }
        })?;
        watcher.watch(self.root.as_path(), RecursiveMode::Recursive)?;
        self.watcher = Some(watcher);
        self.rx = Some(rx);
        Ok(())
    }

    fn stop(&mut self) {
        self.watcher = None;
        self.rx = None;
    }

    async fn next_event(&mut self, timeout: Duration) -> Option<RawEvent> {
        let rx = self.rx.as_mut()?;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(event) => event,
            Err(_) => None,
        }
    }
}

fn map_notify_event(event: Event) -> Vec<RawEvent> {
    match event.kind {
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
            if event.paths.len() >= 2 {
                let is_dir = std::fs::symlink_metadata(&event.paths[1])
                    .map(|meta| meta.is_dir())
                    .unwrap_or(false);
                return vec![RawEvent {
                    kind: RawEventKind::Moved,
                    path: event.paths[0].clone(),
                    dest: Some(event.paths[1].clone()),
                    is_dir,
                }];
            }
            Vec::new()
        }
        EventKind::Create(_) => event
            .paths
            .into_iter()
            .filter_map(|path| {
                let meta = std::fs::symlink_metadata(&path).ok()?;
                if meta.file_type().is_symlink() {
                    return None;
                }
                Some(RawEvent {
                    kind: RawEventKind::Created,
                    path,
                    dest: None,
                    is_dir: meta.is_dir(),
                })
            })
            .collect(),
        EventKind::Modify(_) => event
            .paths
            .into_iter()
            .filter_map(|path| {
                let meta = std::fs::symlink_metadata(&path).ok()?;
                if meta.file_type().is_symlink() || meta.is_dir() {
                    return None;
                }
                Some(RawEvent {
                    kind: RawEventKind::Modified,
                    path,
                    dest: None,
                    is_dir: false,
                })
            })
            .collect(),
        EventKind::Remove(kind) => {
            let is_dir = matches!(kind, notify::event::RemoveKind::Folder);
            event
                .paths
                .into_iter()
                .map(|path| RawEvent {
                    kind: RawEventKind::Deleted,
                    path,
                    dest: None,
                    is_dir,
                })
                .collect()
        }
        _ => Vec::new(),
    }
}

/// Consumes the raw watcher stream and produces debounced batches of
/// [`LocalChange`]s in remote path space, with cache/index litter, hard-coded
/// ignores and mignore matches already dropped.
pub struct FsEventHandler {
    watcher: Box<dyn LocalWatcher>,
    queue: DebouncedQueue<LocalChange>,
    rules: Arc<ExcludeRules>,
    resolver: Arc<PathResolver>,
    window: Duration,
}

impl FsEventHandler {
    pub fn new(
        watcher: Box<dyn LocalWatcher>,
        rules: Arc<ExcludeRules>,
        resolver: Arc<PathResolver>,
        window: Duration,
    ) -> Self {
        Self {
            watcher,
            queue: DebouncedQueue::new(window),
            rules,
            resolver,
            window,
        }
    }

    pub fn start(&mut self) -> Result<(), WatchError> {
        self.watcher.start()
    }

    pub fn stop(&mut self) {
        self.watcher.stop();
    }

    /// Blocks until a debounced batch is available or the token fires.
    /// Returns an empty batch on cancellation.
    pub async fn wait_for_local_changes(&mut self, cancel: &CancellationToken) -> Vec<LocalChange> {
        let poll = self.window.max(Duration::from_millis(10)) / 2;
        loop {
            if self.queue.settled(Instant::now()) {
                let batch = self.queue.drain();
                debug!(count = batch.len(), "local change batch settled");
                return batch;
            }

            let event = tokio::select! {
                _ = cancel.cancelled() => return Vec::new(),
                event = self.watcher.next_event(poll) => event,
            };
            if let Some(raw) = event {
                let now = Instant::now();
                for change in self.clean(raw) {
                    self.queue.push(change, now);
                }
            }
        }
    }

    /// Maps one raw event into remote space and applies the source-level
    /// exclusion rules. A move with exactly one excluded endpoint is split
    /// into its surviving half.
    fn clean(&self, raw: RawEvent) -> Vec<LocalChange> {
        let item_type = if raw.is_dir {
            ItemType::Folder
        } else {
            ItemType::File
        };

        match raw.kind {
            RawEventKind::Moved => {
                let from = self.resolver.remote_path_for(&raw.path);
                let to = raw
                    .dest
                    .as_deref()
                    .and_then(|dest| self.resolver.remote_path_for(dest));
                let from_kept = from
                    .filter(|path| !self.rules.drop_local(&self.resolver.canonical(path), raw.is_dir));
                let to_kept = to
                    .filter(|path| !self.rules.drop_local(&self.resolver.canonical(path), raw.is_dir));
                match (from_kept, to_kept) {
                    (Some(from), Some(to)) => vec![LocalChange::Moved {
                        from,
                        to,
                        item_type,
                    }],
                    (Some(from), None) => vec![LocalChange::Deleted {
                        path: from,
                        item_type,
                    }],
                    (None, Some(to)) => vec![LocalChange::Created {
                        path: to,
                        item_type,
                    }],
                    (None, None) => Vec::new(),
                }
            }
            kind => {
                let Some(path) = self.resolver.remote_path_for(&raw.path) else {
                    return Vec::new();
                };
                if self
                    .rules
                    .drop_local(&self.resolver.canonical(&path), raw.is_dir)
                {
                    return Vec::new();
                }
                match kind {
                    RawEventKind::Created => vec![LocalChange::Created { path, item_type }],
                    RawEventKind::Modified => vec![LocalChange::Modified { path }],
                    RawEventKind::Deleted => vec![LocalChange::Deleted { path, item_type }],
                    RawEventKind::Moved => unreachable!("handled above"),
                }
            }
        }
    }
}
