use std::collections::HashMap;
use std::io;

use tracing::debug;

use super::exclude::ExcludeRules;
use super::fs_events::LocalChange;
use super::index::{IndexEntry, ItemType};
use super::paths::PathResolver;

/// What one walk of the local tree observed for a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalObservation {
    pub path: String,
    pub item_type: ItemType,
    pub mtime_ms: i64,
    pub size: u64,
}

/// Walks the sync root and reports every visible item in remote path space,
/// applying the same exclusion rules as the live event pipeline.
pub async fn walk_local_tree(
    resolver: &PathResolver,
    rules: &ExcludeRules,
) -> io::Result<Vec<LocalObservation>> {
    let mut out = Vec::new();
    let mut stack = vec![resolver.sync_root().to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        while let Some(entry) = entries.next_entry().await? {
            let local = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_symlink() {
                continue;
            }
            let Some(remote) = resolver.remote_path_for(&local) else {
                continue;
            };
            let is_dir = file_type.is_dir();
            if rules.drop_local(&resolver.canonical(&remote), is_dir) {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            let mtime_ms = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis().min(i64::MAX as u128) as i64)
                .unwrap_or(0);
            out.push(LocalObservation {
                path: remote,
                item_type: if is_dir { ItemType::Folder } else { ItemType::File },
                mtime_ms,
                size: meta.len(),
            });
            if is_dir {
                stack.push(local);
            }
        }
    }
    Ok(out)
}

/// Joins an observed tree against the index and synthesizes the local
/// changes that explain the drift: creations for unknown paths, deletions
/// for indexed paths that are gone, modifications for files touched since
/// their last sync, and delete-plus-create for type flips.
pub fn diff_against_index(
    observed: &[LocalObservation],
    entries: &[(String, IndexEntry)],
    resolver: &PathResolver,
) -> Vec<LocalChange> {
    let observed_by_key: HashMap<String, &LocalObservation> = observed
        .iter()
        .map(|obs| (resolver.canonical(&obs.path), obs))
        .collect();

    let mut changes = Vec::new();

    for obs in observed {
        let key = resolver.canonical(&obs.path);
        match entries.iter().find(|(k, _)| *k == key) {
            None => changes.push(match obs.item_type {
                ItemType::Folder => LocalChange::Created {
                    path: obs.path.clone(),
                    item_type: ItemType::Folder,
                },
                ItemType::File => LocalChange::Created {
                    path: obs.path.clone(),
                    item_type: ItemType::File,
                },
            }),
            Some((_, entry)) => {
                if entry.item_type != obs.item_type {
                    changes.push(LocalChange::Deleted {
                        path: entry.path.clone(),
                        item_type: entry.item_type,
                    });
                    changes.push(LocalChange::Created {
                        path: obs.path.clone(),
                        item_type: obs.item_type,
                    });
                } else if obs.item_type == ItemType::File && obs.mtime_ms > entry.last_sync_ms {
                    changes.push(LocalChange::Modified {
                        path: obs.path.clone(),
                    });
                }
            }
        }
    }

    for (key, entry) in entries {
        if entry.rev.is_some() && !observed_by_key.contains_key(key.as_str()) {
            changes.push(LocalChange::Deleted {
                path: entry.path.clone(),
                item_type: entry.item_type,
            });
        }
    }

    debug!(count = changes.len(), "reconciliation drift");
    changes
}
