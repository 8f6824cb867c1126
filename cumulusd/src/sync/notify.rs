use serde::Serialize;
use tracing::{error, info};

use super::engine::{SyncErrorKind, TaskOutcome, TaskStatus};
use super::monitor::MonitorState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncDirection {
    Download,
    Upload,
}

/// Compact per-batch accounting handed to the notification hook. Hosts
/// forwarding these over IPC can serialize them as-is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub applied: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub renamed: usize,
    pub failed: usize,
}

impl BatchSummary {
    pub fn from_outcomes(outcomes: &[TaskOutcome]) -> Self {
        let mut summary = Self::default();
        for outcome in outcomes {
            match &outcome.status {
                TaskStatus::Applied => summary.applied += 1,
                TaskStatus::Skipped => summary.skipped += 1,
                TaskStatus::ConflictCopied { .. } => summary.conflicts += 1,
                TaskStatus::Renamed { .. } => summary.renamed += 1,
                TaskStatus::Failed { .. } => summary.failed += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.applied + self.skipped + self.conflicts + self.renamed + self.failed
    }
}

/// Outbound notification hooks. The host wires these to desktop
/// notifications, a tray, or nothing; every method has a no-op default.
pub trait SyncNotifier: Send + Sync {
    fn on_batch_applied(&self, _direction: SyncDirection, _count: usize, _summary: &BatchSummary) {}

    fn on_error(&self, _kind: SyncErrorKind, _path: Option<&str>, _message: &str) {}

    fn on_state_change(&self, _old: MonitorState, _new: MonitorState) {}
}

/// Default notifier that reports through the log.
pub struct LogNotifier;

impl SyncNotifier for LogNotifier {
    fn on_batch_applied(&self, direction: SyncDirection, count: usize, summary: &BatchSummary) {
        info!(?direction, count, ?summary, "batch applied");
    }

    fn on_error(&self, kind: SyncErrorKind, path: Option<&str>, message: &str) {
        error!(?kind, path, message, "sync error");
    }

    fn on_state_change(&self, old: MonitorState, new: MonitorState) {
        info!(?old, ?new, "sync state change");
    }
}
