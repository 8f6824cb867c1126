use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cumulus_remote::RemoteChange;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::backoff::{Backoff, MAX_RETRY_ATTEMPTS};
use super::engine::{SyncEngine, TaskOutcome, TaskStatus};
use super::fs_events::LocalChange;
use super::index::ItemType;
use super::paths;

pub const DEFAULT_PARALLELISM: usize = 6;

/// Execution schedule for one normalized batch: deletions and folder
/// operations run serialized, same-depth file groups fan out.
#[derive(Debug, PartialEq, Eq)]
pub enum Phase<T> {
    Serial(Vec<T>),
    Parallel(Vec<T>),
}

/// Bounded pool applying resolved changes. At most one in-flight action per
/// canonical path across every schedule; conflicting work waits its turn.
pub struct WorkerPool {
    limit: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    backoff: Backoff,
}

impl WorkerPool {
    pub fn new(parallelism: usize) -> Self {
        Self {
            limit: Arc::new(Semaphore::new(parallelism.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            backoff: Backoff::apply_default(),
        }
    }

    pub async fn run_remote_batch(
        &self,
        engine: &Arc<SyncEngine>,
        changes: Vec<RemoteChange>,
        cancel: &CancellationToken,
    ) -> Vec<TaskOutcome> {
        let phases = remote_phases(changes);
        let mut outcomes = Vec::new();
        for phase in phases {
            match phase {
                Phase::Serial(items) => {
                    for change in items {
                        if cancel.is_cancelled() {
                            return outcomes;
                        }
                        let outcome = self.run_remote_task(engine, change, cancel).await;
                        let corrupt = is_storage_corrupt(&outcome);
                        outcomes.push(outcome);
                        if corrupt {
                            return outcomes;
                        }
                    }
                }
                Phase::Parallel(items) => {
                    let mut set = JoinSet::new();
                    for change in items {
                        let engine = engine.clone();
                        let cancel = cancel.clone();
                        let limit = self.limit.clone();
                        let in_flight = self.in_flight.clone();
                        let backoff = self.backoff;
                        let keys = vec![engine.resolver().canonical(change.path())];
                        set.spawn(async move {
                            let Ok(_permit) = limit.acquire_owned().await else {
                                return TaskOutcome {
                                    path: change.path().to_string(),
                                    status: TaskStatus::Skipped,
                                };
                            };
                            let _guards = claim_all(&in_flight, keys).await;
                            retrying(backoff, &cancel, |cancel| {
                                let engine = engine.clone();
                                let change = change.clone();
                                async move { engine.apply_remote_change(&change, &cancel).await }
                            })
                            .await
                        });
                    }
                    while let Some(joined) = set.join_next().await {
                        if let Ok(outcome) = joined {
                            outcomes.push(outcome);
                        }
                    }
                }
            }
        }
        outcomes
    }

    pub async fn run_local_batch(
        &self,
        engine: &Arc<SyncEngine>,
        changes: Vec<LocalChange>,
        cancel: &CancellationToken,
    ) -> Vec<TaskOutcome> {
        let phases = local_phases(changes);
        let mut outcomes = Vec::new();
        for phase in phases {
            match phase {
                Phase::Serial(items) => {
                    for change in items {
                        if cancel.is_cancelled() {
                            return outcomes;
                        }
                        let outcome = self.run_local_task(engine, change, cancel).await;
                        let corrupt = is_storage_corrupt(&outcome);
                        outcomes.push(outcome);
                        if corrupt {
                            return outcomes;
                        }
                    }
                }
                Phase::Parallel(items) => {
                    let mut set = JoinSet::new();
                    for change in items {
                        let engine = engine.clone();
                        let cancel = cancel.clone();
                        let limit = self.limit.clone();
                        let in_flight = self.in_flight.clone();
                        let backoff = self.backoff;
                        let keys = local_change_keys(&engine, &change);
                        set.spawn(async move {
                            let Ok(_permit) = limit.acquire_owned().await else {
                                return TaskOutcome {
                                    path: change.path().to_string(),
                                    status: TaskStatus::Skipped,
                                };
                            };
                            let _guards = claim_all(&in_flight, keys).await;
                            retrying(backoff, &cancel, |cancel| {
                                let engine = engine.clone();
                                let change = change.clone();
                                async move { engine.apply_local_change(&change, &cancel).await }
                            })
                            .await
                        });
                    }
                    while let Some(joined) = set.join_next().await {
                        if let Ok(outcome) = joined {
                            outcomes.push(outcome);
                        }
                    }
                }
            }
        }
        outcomes
    }

    async fn run_remote_task(
        &self,
        engine: &Arc<SyncEngine>,
        change: RemoteChange,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        let keys = vec![engine.resolver().canonical(change.path())];
        let _guards = claim_all(&self.in_flight, keys).await;
        retrying(self.backoff, cancel, |cancel| {
            let engine = engine.clone();
            let change = change.clone();
            async move { engine.apply_remote_change(&change, &cancel).await }
        })
        .await
    }

    async fn run_local_task(
        &self,
        engine: &Arc<SyncEngine>,
        change: LocalChange,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        let keys = local_change_keys(engine, &change);
        let _guards = claim_all(&self.in_flight, keys).await;
        retrying(self.backoff, cancel, |cancel| {
            let engine = engine.clone();
            let change = change.clone();
            async move { engine.apply_local_change(&change, &cancel).await }
        })
        .await
    }
}

/// Canonical paths a local change operates on; moves claim both endpoints.
fn local_change_keys(engine: &Arc<SyncEngine>, change: &LocalChange) -> Vec<String> {
    match change {
        LocalChange::Moved { from, to, .. } => {
            let mut keys = vec![
                engine.resolver().canonical(from),
                engine.resolver().canonical(to),
            ];
            // Deterministic claim order prevents two moves from deadlocking.
            keys.sort();
            keys
        }
        other => vec![engine.resolver().canonical(other.path())],
    }
}

fn is_storage_corrupt(outcome: &TaskOutcome) -> bool {
    matches!(
        &outcome.status,
        TaskStatus::Failed {
            kind: super::engine::SyncErrorKind::StorageCorrupt,
            ..
        }
    )
}

/// Retries transient failures with exponential backoff, honoring any
/// server-provided retry-after and observing cancellation during the waits.
async fn retrying<F, Fut>(backoff: Backoff, cancel: &CancellationToken, run: F) -> TaskOutcome
where
    F: Fn(CancellationToken) -> Fut,
    Fut: Future<Output = TaskOutcome>,
{
    let mut attempt = 0u32;
    loop {
        let outcome = run(cancel.clone()).await;
        if !outcome.is_transient_failure() || attempt + 1 >= MAX_RETRY_ATTEMPTS {
            return outcome;
        }
        let delay = outcome.retry_after().unwrap_or_else(|| backoff.delay(attempt));
        debug!(path = %outcome.path, attempt, delay_ms = delay.as_millis() as u64, "retrying task");
        tokio::select! {
            _ = cancel.cancelled() => return outcome,
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

pub(crate) struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().expect("in-flight set poisoned").remove(&self.key);
    }
}

/// Claims every key, waiting out any holder; a blocked waiter re-queues by
/// polling rather than holding the lock.
async fn claim_all(set: &Arc<Mutex<HashSet<String>>>, keys: Vec<String>) -> Vec<InFlightGuard> {
    let mut guards = Vec::with_capacity(keys.len());
    for key in keys {
        loop {
            let claimed = {
                let mut held = set.lock().expect("in-flight set poisoned");
                held.insert(key.clone())
            };
            if claimed {
                guards.push(InFlightGuard {
                    set: set.clone(),
                    key: key.clone(),
                });
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
    guards
}

#[cfg(test)]
pub(crate) async fn claim_for_test(
    set: &Arc<Mutex<HashSet<String>>>,
    keys: Vec<String>,
) -> Vec<InFlightGuard> {
    claim_all(set, keys).await
}

/// Schedules a normalized remote batch: serialized deletions, serialized
/// folder creations, then file groups fanned out per depth level.
pub(crate) fn remote_phases(changes: Vec<RemoteChange>) -> Vec<Phase<RemoteChange>> {
    let mut phases = Vec::new();
    let mut serial: Vec<RemoteChange> = Vec::new();
    let mut files: Vec<RemoteChange> = Vec::new();

    let flush_serial = |serial: &mut Vec<RemoteChange>, phases: &mut Vec<Phase<RemoteChange>>| {
        if !serial.is_empty() {
            phases.push(Phase::Serial(std::mem::take(serial)));
        }
    };
    let flush_files = |files: &mut Vec<RemoteChange>, phases: &mut Vec<Phase<RemoteChange>>| {
        if !files.is_empty() {
            phases.push(Phase::Parallel(std::mem::take(files)));
        }
    };

    for change in changes {
        match &change {
            RemoteChange::File(_) => {
                flush_serial(&mut serial, &mut phases);
                if let Some(last) = files.last()
                    && paths::depth(last.path()) != paths::depth(change.path())
                {
                    flush_files(&mut files, &mut phases);
                }
                files.push(change);
            }
            _ => {
                flush_files(&mut files, &mut phases);
                serial.push(change);
            }
        }
    }
    flush_serial(&mut serial, &mut phases);
    flush_files(&mut files, &mut phases);
    phases
}

/// Schedules a normalized local batch with the same shape as
/// [`remote_phases`]: deletions and folder operations serialize, same-depth
/// file work fans out.
pub(crate) fn local_phases(changes: Vec<LocalChange>) -> Vec<Phase<LocalChange>> {
    let mut phases = Vec::new();
    let mut serial: Vec<LocalChange> = Vec::new();
    let mut files: Vec<LocalChange> = Vec::new();

    let flush_serial = |serial: &mut Vec<LocalChange>, phases: &mut Vec<Phase<LocalChange>>| {
        if !serial.is_empty() {
            phases.push(Phase::Serial(std::mem::take(serial)));
        }
    };
    let flush_files = |files: &mut Vec<LocalChange>, phases: &mut Vec<Phase<LocalChange>>| {
        if !files.is_empty() {
            phases.push(Phase::Parallel(std::mem::take(files)));
        }
    };

    for change in changes {
        let is_file_work = match &change {
            LocalChange::Deleted { .. } => false,
            LocalChange::Created { item_type, .. } | LocalChange::Moved { item_type, .. } => {
                *item_type == ItemType::File
            }
            LocalChange::Modified { .. } => true,
        };
        if is_file_work {
            flush_serial(&mut serial, &mut phases);
            if let Some(last) = files.last()
                && paths::depth(last.path()) != paths::depth(change.path())
            {
                flush_files(&mut files, &mut phases);
            }
            files.push(change);
        } else {
            flush_files(&mut files, &mut phases);
            serial.push(change);
        }
    }
    flush_serial(&mut serial, &mut phases);
    flush_files(&mut files, &mut phases);
    phases
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulus_remote::FileMeta;

    fn file(path: &str) -> RemoteChange {
        RemoteChange::File(FileMeta {
            path: path.into(),
            rev: "r1".into(),
            content_hash: "h1".into(),
            server_modified_ms: 0,
        })
    }

    #[test]
    fn remote_phases_split_serial_and_parallel_work() {
        let phases = remote_phases(vec![
            RemoteChange::Deleted { path: "/gone".into() },
            RemoteChange::Folder { path: "/p".into() },
            file("/p/a.txt"),
            file("/p/b.txt"),
            file("/p/deeper/c.txt"),
        ]);
        assert_eq!(phases.len(), 3);
        assert!(matches!(&phases[0], Phase::Serial(items) if items.len() == 2));
        assert!(matches!(&phases[1], Phase::Parallel(items) if items.len() == 2));
        assert!(matches!(&phases[2], Phase::Parallel(items) if items.len() == 1));
    }

    #[test]
    fn local_phases_treat_folder_moves_as_serial() {
        let phases = local_phases(vec![
            LocalChange::Moved {
                from: "/a".into(),
                to: "/b".into(),
                item_type: ItemType::Folder,
            },
            LocalChange::Modified { path: "/b/x.txt".into() },
        ]);
        assert_eq!(phases.len(), 2);
        assert!(matches!(&phases[0], Phase::Serial(items) if items.len() == 1));
        assert!(matches!(&phases[1], Phase::Parallel(items) if items.len() == 1));
    }

    #[tokio::test]
    async fn claim_all_blocks_second_holder_until_release() {
        let set = Arc::new(Mutex::new(HashSet::new()));
        let guards = claim_all(&set, vec!["/a".to_string()]).await;

        let contended = {
            let set = set.clone();
            tokio::spawn(async move { claim_all(&set, vec!["/a".to_string()]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contended.is_finished());

        drop(guards);
        let second = contended.await.unwrap();
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn retrying_gives_up_after_max_attempts() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = Arc::new(AtomicU32::new(0));
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 0.0);
        let cancel = CancellationToken::new();

        let counted = calls.clone();
        let outcome = retrying(backoff, &cancel, move |_cancel| {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                TaskOutcome {
                    path: "/x".into(),
                    status: TaskStatus::Failed {
                        kind: super::super::engine::SyncErrorKind::Network,
                        message: "boom".into(),
                        transient: true,
                        retry_after: None,
                    },
                }
            }
        })
        .await;

        assert!(outcome.is_transient_failure());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_RETRY_ATTEMPTS);
    }

    #[tokio::test]
    async fn retrying_returns_first_permanent_outcome() {
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 0.0);
        let cancel = CancellationToken::new();
        let outcome = retrying(backoff, &cancel, |_cancel| async {
            TaskOutcome {
                path: "/x".into(),
                status: TaskStatus::Applied,
            }
        })
        .await;
        assert_eq!(outcome.status, TaskStatus::Applied);
    }
}
