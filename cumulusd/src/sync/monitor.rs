use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cumulus_remote::RemoteChange;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::engine::{EngineError, SyncEngine, SyncErrorKind, TaskOutcome, TaskStatus, now_ms};
use super::fs_events::{FsEventHandler, LocalChange};
use super::normalize;
use super::notify::{BatchSummary, SyncDirection, SyncNotifier};
use super::reconcile;
use super::remote_fetcher::{RemoteBatch, RemoteFetcher};
use super::transfer;
use super::workers::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum PauseReason {
    User,
    AuthRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum MonitorState {
    Stopped,
    Starting,
    Syncing,
    Paused(PauseReason),
    Stopping,
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    /// Apply-worker fan-out.
    pub parallelism: usize,
    /// Cadence of index compaction, orphan cleanup and re-reconciliation.
    pub maintenance_interval: Duration,
    /// A pause longer than this triggers a fresh reconciliation on resume.
    pub pause_reconcile_threshold: Duration,
    /// Wait before retrying after the remote becomes unreachable.
    pub offline_retry: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            parallelism: super::workers::DEFAULT_PARALLELISM,
            maintenance_interval: Duration::from_secs(60 * 60),
            pause_reconcile_threshold: Duration::from_secs(24 * 60 * 60),
            offline_retry: Duration::from_secs(30),
        }
    }
}

struct Shared {
    engine: Arc<SyncEngine>,
    fetcher: RemoteFetcher,
    pool: WorkerPool,
    notifier: Arc<dyn SyncNotifier>,
    config: MonitorConfig,
    state: Mutex<MonitorState>,
    syncing: watch::Sender<bool>,
    upload_halted: AtomicBool,
    download_halted: AtomicBool,
    paused_at: Mutex<Option<Instant>>,
    cancel: CancellationToken,
}

/// Lifecycle and scheduling supervisor. Owns the three long-lived loops
/// (download long-poll, upload queue, maintenance) plus startup
/// reconciliation, pause/resume and error escalation.
pub struct SyncMonitor {
    shared: Arc<Shared>,
    handler: Option<FsEventHandler>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncMonitor {
    pub fn new(
        engine: Arc<SyncEngine>,
        handler: FsEventHandler,
        notifier: Arc<dyn SyncNotifier>,
        config: MonitorConfig,
    ) -> Self {
        let fetcher = RemoteFetcher::new(engine.remote().clone());
        let (syncing, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                engine,
                fetcher,
                pool: WorkerPool::new(config.parallelism),
                notifier,
                config,
                state: Mutex::new(MonitorState::Stopped),
                syncing,
                upload_halted: AtomicBool::new(false),
                download_halted: AtomicBool::new(false),
                paused_at: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
            handler: Some(handler),
            tasks: Vec::new(),
        }
    }

    pub fn state(&self) -> MonitorState {
        *self.shared.state.lock().expect("state mutex poisoned")
    }

    /// Startup: reconcile local drift and resume the remote stream, then
    /// launch the three loops.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        set_state(&self.shared, MonitorState::Starting);

        startup_reconcile(&self.shared).await?;

        let mut handler = self.handler.take().expect("monitor already started");
        handler.start()?;

        let shared = self.shared.clone();
        self.tasks.push(tokio::spawn(async move {
            download_loop(shared).await;
        }));
        let shared = self.shared.clone();
        self.tasks.push(tokio::spawn(async move {
            upload_loop(shared, handler).await;
        }));
        let shared = self.shared.clone();
        self.tasks.push(tokio::spawn(async move {
            maintenance_loop(shared).await;
        }));

        set_state(&self.shared, MonitorState::Syncing);
        self.shared.syncing.send_replace(true);
        info!("sync monitor started");
        Ok(())
    }

    /// Stops initiating new batches; in-flight tasks complete.
    pub fn pause(&self) {
        pause_with(&self.shared, PauseReason::User);
    }

    /// Continues from the persisted cursor. A pause longer than the
    /// configured threshold triggers a fresh reconciliation first.
    pub async fn resume(&self) {
        let long_pause = {
            let paused_at = self.shared.paused_at.lock().expect("pause mutex poisoned");
            paused_at
                .map(|at| at.elapsed() >= self.shared.config.pause_reconcile_threshold)
                .unwrap_or(false)
        };
        if long_pause {
            info!("pause exceeded reconcile threshold, re-scanning");
            let _ = reconcile_local(&self.shared).await;
            let _ = self
                .shared
                .engine
                .index()
                .set_last_reconcile_ms(now_ms())
                .await;
        }
        self.shared.upload_halted.store(false, Ordering::SeqCst);
        self.shared.download_halted.store(false, Ordering::SeqCst);
        *self.shared.paused_at.lock().expect("pause mutex poisoned") = None;
        set_state(&self.shared, MonitorState::Syncing);
        self.shared.syncing.send_replace(true);
    }

    /// Cancels the waits, drains the loops and joins them.
    pub async fn stop(&mut self) {
        set_state(&self.shared, MonitorState::Stopping);
        self.shared.cancel.cancel();
        self.shared.syncing.send_replace(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        set_state(&self.shared, MonitorState::Stopped);
    }

    /// One immediate download cycle: fetch whatever is past the stored
    /// cursor (or the full tree when there is none) and apply it.
    pub async fn sync_remote_once(&self) -> Result<Vec<TaskOutcome>, EngineError> {
        let cursor = self.shared.engine.index().get_cursor().await?;
        match cursor {
            None => full_download(&self.shared).await,
            Some(cursor) => {
                let batch = self.shared.fetcher.fetch(Some(&cursor)).await?;
                if batch.reset {
                    self.shared.engine.index().clear_cursor().await?;
                    return full_download(&self.shared).await;
                }
                Ok(apply_remote_batch(&self.shared, batch).await)
            }
        }
    }

    /// One immediate local reconciliation pass.
    pub async fn reconcile_now(&self) -> Result<Vec<TaskOutcome>, EngineError> {
        reconcile_local(&self.shared).await
    }

    /// Applies a batch of local changes as the upload loop would; used by
    /// hosts that feed events from their own watcher.
    pub async fn apply_local_batch(&self, changes: Vec<LocalChange>) -> Vec<TaskOutcome> {
        apply_local_batch(&self.shared, changes).await
    }
}

fn set_state(shared: &Shared, new: MonitorState) {
    let old = {
        let mut state = shared.state.lock().expect("state mutex poisoned");
        std::mem::replace(&mut *state, new)
    };
    if old != new {
        shared.notifier.on_state_change(old, new);
    }
}

fn pause_with(shared: &Shared, reason: PauseReason) {
    shared.syncing.send_replace(false);
    *shared.paused_at.lock().expect("pause mutex poisoned") = Some(Instant::now());
    set_state(shared, MonitorState::Paused(reason));
}

async fn wait_until_syncing(shared: &Shared) -> bool {
    let mut rx = shared.syncing.subscribe();
    loop {
        if shared.cancel.is_cancelled() {
            return false;
        }
        if *rx.borrow_and_update() {
            return true;
        }
        tokio::select! {
            _ = shared.cancel.cancelled() => return false,
            changed = rx.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

async fn cancellable_sleep(shared: &Shared, delay: Duration) {
    tokio::select! {
        _ = shared.cancel.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

async fn startup_reconcile(shared: &Arc<Shared>) -> Result<(), EngineError> {
    if shared.engine.index().get_cursor().await?.is_none() {
        full_download(shared).await?;
    }
    reconcile_local(shared).await?;
    shared
        .engine
        .index()
        .set_last_reconcile_ms(now_ms())
        .await?;
    Ok(())
}

/// Full re-list: applies the complete remote tree and synthesizes deletions
/// for indexed items the listing no longer contains.
async fn full_download(shared: &Arc<Shared>) -> Result<Vec<TaskOutcome>, EngineError> {
    let mut batch = shared.fetcher.full_listing().await?;

    let listed: std::collections::HashSet<String> = batch
        .changes
        .iter()
        .map(|change| shared.engine.resolver().canonical(change.path()))
        .collect();
    for (key, entry) in shared.engine.index().iter_prefix("/").await? {
        if entry.rev.is_some() && !listed.contains(&key) {
            batch.changes.push(RemoteChange::Deleted { path: entry.path });
        }
    }

    Ok(apply_remote_batch(shared, batch).await)
}

/// Normalize, fan out, escalate, and advance the cursor only when every
/// task of the batch concluded durably.
async fn apply_remote_batch(shared: &Arc<Shared>, batch: RemoteBatch) -> Vec<TaskOutcome> {
    let snapshot = match shared.engine.type_snapshot().await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            escalate_engine_error(shared, &err, SyncDirection::Download);
            return Vec::new();
        }
    };
    let lookup = |key: &str| snapshot.get(key).copied();
    let changes = normalize::normalize_remote(
        batch.changes,
        shared.engine.resolver(),
        shared.engine.rules(),
        &lookup,
    );
    if changes.is_empty() {
        if let Err(err) = shared.engine.index().set_cursor(&batch.cursor).await {
            escalate_engine_error(shared, &err.into(), SyncDirection::Download);
        }
        return Vec::new();
    }

    let outcomes = shared
        .pool
        .run_remote_batch(&shared.engine, changes, &shared.cancel)
        .await;
    let escalation = escalate(shared, &outcomes, SyncDirection::Download);

    if escalation.relist {
        let _ = shared.engine.index().clear_cursor().await;
    } else if !escalation.any_failure {
        if let Err(err) = shared.engine.index().set_cursor(&batch.cursor).await {
            escalate_engine_error(shared, &err.into(), SyncDirection::Download);
            return outcomes;
        }
    }

    let summary = BatchSummary::from_outcomes(&outcomes);
    shared
        .notifier
        .on_batch_applied(SyncDirection::Download, summary.total(), &summary);
    outcomes
}

async fn apply_local_batch(shared: &Arc<Shared>, events: Vec<LocalChange>) -> Vec<TaskOutcome> {
    let snapshot = match shared.engine.type_snapshot().await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            escalate_engine_error(shared, &err, SyncDirection::Upload);
            return Vec::new();
        }
    };
    let lookup = |key: &str| snapshot.get(key).copied();
    let changes = normalize::normalize_local(
        events,
        shared.engine.resolver(),
        shared.engine.rules(),
        &lookup,
    );
    if changes.is_empty() {
        return Vec::new();
    }

    let outcomes = shared
        .pool
        .run_local_batch(&shared.engine, changes, &shared.cancel)
        .await;
    escalate(shared, &outcomes, SyncDirection::Upload);

    let summary = BatchSummary::from_outcomes(&outcomes);
    shared
        .notifier
        .on_batch_applied(SyncDirection::Upload, summary.total(), &summary);
    outcomes
}

async fn reconcile_local(shared: &Arc<Shared>) -> Result<Vec<TaskOutcome>, EngineError> {
    let observed =
        reconcile::walk_local_tree(shared.engine.resolver(), shared.engine.rules()).await?;
    let entries = shared.engine.index().iter_prefix("/").await?;
    let drift = reconcile::diff_against_index(&observed, &entries, shared.engine.resolver());
    if drift.is_empty() {
        return Ok(Vec::new());
    }
    info!(count = drift.len(), "applying reconciliation drift");
    Ok(apply_local_batch(shared, drift).await)
}

struct Escalation {
    any_failure: bool,
    relist: bool,
}

/// The error-policy table: decides, per failed outcome, what halts, what
/// pauses and what forces a re-list.
fn escalate(shared: &Arc<Shared>, outcomes: &[TaskOutcome], direction: SyncDirection) -> Escalation {
    let mut escalation = Escalation {
        any_failure: false,
        relist: false,
    };
    for outcome in outcomes {
        let TaskStatus::Failed { kind, message, .. } = &outcome.status else {
            continue;
        };
        escalation.any_failure = true;
        shared
            .notifier
            .on_error(*kind, Some(&outcome.path), message);
        match kind {
            SyncErrorKind::AuthExpired => {
                warn!("authorization expired, pausing both directions");
                pause_with(shared, PauseReason::AuthRequired);
            }
            SyncErrorKind::StorageCorrupt => {
                error!("index storage is corrupt, halting; rebuild required");
                shared.cancel.cancel();
                set_state(shared, MonitorState::Stopped);
            }
            SyncErrorKind::InsufficientQuota | SyncErrorKind::PermissionDenied => {
                // Downloads keep flowing; uploads stop until resumed.
                shared.upload_halted.store(true, Ordering::SeqCst);
            }
            SyncErrorKind::NotFound if direction == SyncDirection::Download => {
                // The item vanished between list and download.
                escalation.relist = true;
            }
            SyncErrorKind::Network
            | SyncErrorKind::RateLimited
            | SyncErrorKind::TempIo
            | SyncErrorKind::StorageIo => match direction {
                SyncDirection::Download => {
                    shared.download_halted.store(true, Ordering::SeqCst);
                }
                SyncDirection::Upload => {
                    shared.upload_halted.store(true, Ordering::SeqCst);
                }
            },
            _ => {}
        }
    }
    escalation
}

fn escalate_engine_error(shared: &Arc<Shared>, err: &EngineError, direction: SyncDirection) {
    let (kind, _, _) = super::engine::classify(err);
    shared.notifier.on_error(kind, None, &err.to_string());
    if kind == SyncErrorKind::StorageCorrupt {
        error!("index storage is corrupt, halting; rebuild required");
        shared.cancel.cancel();
        set_state(shared, MonitorState::Stopped);
    } else if kind == SyncErrorKind::AuthExpired {
        pause_with(shared, PauseReason::AuthRequired);
    } else {
        match direction {
            SyncDirection::Download => shared.download_halted.store(true, Ordering::SeqCst),
            SyncDirection::Upload => shared.upload_halted.store(true, Ordering::SeqCst),
        }
    }
}

async fn download_loop(shared: Arc<Shared>) {
    loop {
        if !wait_until_syncing(&shared).await {
            break;
        }
        if shared.download_halted.load(Ordering::SeqCst) {
            cancellable_sleep(&shared, shared.config.offline_retry).await;
            continue;
        }

        let cursor = match shared.engine.index().get_cursor().await {
            Ok(cursor) => cursor,
            Err(err) => {
                escalate_engine_error(&shared, &err.into(), SyncDirection::Download);
                cancellable_sleep(&shared, shared.config.offline_retry).await;
                continue;
            }
        };

        match cursor {
            None => {
                if let Err(err) = full_download(&shared).await {
                    escalate_engine_error(&shared, &err, SyncDirection::Download);
                    cancellable_sleep(&shared, shared.config.offline_retry).await;
                }
            }
            Some(cursor) => {
                match shared.fetcher.wait(&cursor, &shared.cancel).await {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(err) => {
                        escalate_engine_error(&shared, &err.into(), SyncDirection::Download);
                        cancellable_sleep(&shared, shared.config.offline_retry).await;
                        continue;
                    }
                }
                match shared.fetcher.fetch(Some(&cursor)).await {
                    Ok(batch) if batch.reset => {
                        info!("cursor reset, discarding and re-listing");
                        let _ = shared.engine.index().clear_cursor().await;
                    }
                    Ok(batch) => {
                        apply_remote_batch(&shared, batch).await;
                    }
                    Err(err) => {
                        escalate_engine_error(&shared, &err.into(), SyncDirection::Download);
                        cancellable_sleep(&shared, shared.config.offline_retry).await;
                    }
                }
            }
        }
    }
}

async fn upload_loop(shared: Arc<Shared>, mut handler: FsEventHandler) {
    loop {
        if !wait_until_syncing(&shared).await {
            break;
        }
        if shared.upload_halted.load(Ordering::SeqCst) {
            cancellable_sleep(&shared, shared.config.offline_retry).await;
            continue;
        }
        let events = handler.wait_for_local_changes(&shared.cancel).await;
        if events.is_empty() {
            continue;
        }
        apply_local_batch(&shared, events).await;
    }
    handler.stop();
}

async fn maintenance_loop(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.config.maintenance_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it, startup just reconciled.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !*shared.syncing.subscribe().borrow() {
            continue;
        }
        if let Err(err) = shared.engine.index().compact().await {
            warn!(error = %err, "index compaction failed");
        }
        if let Err(err) = transfer::cleanup_partials(shared.engine.resolver().sync_root()).await {
            warn!(error = %err, "partial cleanup failed");
        }

        // Re-scan only when the last reconciliation is actually stale; a
        // resume may have re-scanned moments ago.
        let stale = match shared.engine.index().get_last_reconcile_ms().await {
            Ok(Some(stamp)) => {
                now_ms().saturating_sub(stamp)
                    >= shared.config.maintenance_interval.as_millis() as i64
            }
            Ok(None) => true,
            Err(err) => {
                warn!(error = %err, "failed to read reconciliation stamp");
                true
            }
        };
        if !stale {
            continue;
        }
        if let Err(err) = reconcile_local(&shared).await {
            escalate_engine_error(&shared, &err, SyncDirection::Upload);
            continue;
        }
        if let Err(err) = shared.engine.index().set_last_reconcile_ms(now_ms()).await {
            warn!(error = %err, "failed to stamp reconciliation");
        }
    }
}

#[cfg(test)]
#[path = "monitor_tests.rs"]
mod tests;
