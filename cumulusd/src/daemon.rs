use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cumulus_remote::RemoteClient;

use crate::sync::engine::SyncEngine;
use crate::sync::exclude::{ExcludeRules, MignoreMatcher, NoSelectiveSync, SelectiveSync};
use crate::sync::fs_events::{DEBOUNCE_WINDOW, FsEventHandler, NotifyWatcher};
use crate::sync::index::IndexStore;
use crate::sync::monitor::{MonitorConfig, MonitorState, SyncMonitor};
use crate::sync::notify::{LogNotifier, SyncNotifier};
use crate::sync::paths::{PathResolver, probe_case_sensitivity};
use crate::sync::workers::DEFAULT_PARALLELISM;

const DEFAULT_SYNC_DIR_NAME: &str = "Cumulus";
const DEFAULT_MAINTENANCE_SECS: u64 = 60 * 60;
const DEFAULT_PAUSE_RECONCILE_SECS: u64 = 24 * 60 * 60;
const DEFAULT_OFFLINE_RETRY_SECS: u64 = 30;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub sync_root: PathBuf,
    pub index_db: PathBuf,
    pub parallelism: usize,
    pub debounce_window: Duration,
    pub maintenance_interval: Duration,
    pub pause_reconcile_threshold: Duration,
    pub offline_retry: Duration,
}

impl DaemonConfig {
    /// Reads configuration from `CUMULUS_*` environment variables, loading a
    /// local `.env` first.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let sync_root = lookup("CUMULUS_SYNC_DIR")
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| home.join(DEFAULT_SYNC_DIR_NAME));
        let index_db = match lookup("CUMULUS_INDEX_DB") {
            Some(value) => expand_with_home(&value, &home),
            None => dirs::data_dir()
                .context("data directory is unavailable")?
                .join("cumulus")
                .join("index.db"),
        };

        Ok(Self {
            sync_root,
            index_db,
            parallelism: read_usize(&lookup, "CUMULUS_PARALLELISM", DEFAULT_PARALLELISM),
            debounce_window: Duration::from_millis(read_u64(
                &lookup,
                "CUMULUS_DEBOUNCE_MS",
                DEBOUNCE_WINDOW.as_millis() as u64,
            )),
            maintenance_interval: Duration::from_secs(read_u64(
                &lookup,
                "CUMULUS_MAINTENANCE_SECS",
                DEFAULT_MAINTENANCE_SECS,
            )),
            pause_reconcile_threshold: Duration::from_secs(read_u64(
                &lookup,
                "CUMULUS_PAUSE_RECONCILE_SECS",
                DEFAULT_PAUSE_RECONCILE_SECS,
            )),
            offline_retry: Duration::from_secs(read_u64(
                &lookup,
                "CUMULUS_OFFLINE_RETRY_SECS",
                DEFAULT_OFFLINE_RETRY_SECS,
            )),
        })
    }

    fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            parallelism: self.parallelism,
            maintenance_interval: self.maintenance_interval,
            pause_reconcile_threshold: self.pause_reconcile_threshold,
            offline_retry: self.offline_retry,
        }
    }
}

/// Everything the host hands us beyond configuration: the remote capability
/// and the optional exclusion collaborators.
pub struct DaemonDeps {
    pub remote: Arc<dyn RemoteClient>,
    pub selective_sync: Arc<dyn SelectiveSync>,
    pub mignore: Option<MignoreMatcher>,
    pub notifier: Arc<dyn SyncNotifier>,
}

impl DaemonDeps {
    pub fn new(remote: Arc<dyn RemoteClient>) -> Self {
        Self {
            remote,
            selective_sync: Arc::new(NoSelectiveSync),
            mignore: None,
            notifier: Arc::new(LogNotifier),
        }
    }
}

/// Assembled engine plus monitor, ready to run inside a host process.
pub struct DaemonRuntime {
    config: DaemonConfig,
    monitor: SyncMonitor,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig, deps: DaemonDeps) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.sync_root)
            .await
            .with_context(|| format!("failed to create sync root at {:?}", config.sync_root))?;

        let case_sensitive = probe_case_sensitivity(&config.sync_root)
            .context("failed to probe file system case sensitivity")?;
        let resolver = Arc::new(PathResolver::new(config.sync_root.clone(), case_sensitive));
        let rules = Arc::new(ExcludeRules::new(deps.selective_sync, deps.mignore));

        let index = IndexStore::open(&config.index_db)
            .await
            .context("failed to initialize index store")?;
        let engine = Arc::new(SyncEngine::new(
            deps.remote,
            index,
            resolver.clone(),
            rules.clone(),
        ));

        let watcher = NotifyWatcher::new(&config.sync_root);
        let handler = FsEventHandler::new(
            Box::new(watcher),
            rules,
            resolver,
            config.debounce_window,
        );
        let monitor = SyncMonitor::new(engine, handler, deps.notifier, config.monitor_config());

        Ok(Self { config, monitor })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn state(&self) -> MonitorState {
        self.monitor.state()
    }

    pub async fn start(&mut self) -> anyhow::Result<()> {
        self.monitor.start().await
    }

    pub fn pause(&self) {
        self.monitor.pause();
    }

    pub async fn resume(&self) {
        self.monitor.resume().await;
    }

    pub async fn stop(&mut self) {
        self.monitor.stop().await;
    }

    pub fn monitor(&self) -> &SyncMonitor {
        &self.monitor
    }
}

fn expand_with_home(value: &str, home: &std::path::Path) -> PathBuf {
    if let Some(rest) = value.strip_prefix("~/") {
        home.join(rest)
    } else {
        PathBuf::from(value)
    }
}

fn read_u64<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_usize<F>(lookup: &F, name: &str, default: usize) -> usize
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}
