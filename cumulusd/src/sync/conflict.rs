use cumulus_remote::RemoteChange;

use super::fs_events::LocalChange;
use super::index::{FOLDER_REV, IndexEntry, ItemType};
use super::paths;

pub const CONFLICT_COPY_SUFFIX: &str = "conflicting copy";
pub const SELECTIVE_SYNC_SUFFIX: &str = "selective sync conflict";
pub const CASE_CONFLICT_SUFFIX: &str = "case conflict";

/// Resolver verdict for a single normalized change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// Execute the change as-is.
    Apply,
    /// Nothing to do.
    Skip,
    /// Skip the transfer but record the remote rev / refresh the sync stamp;
    /// content already matches.
    Acknowledge,
    /// Upload under a different name (selective-sync or case conflict).
    RenameTarget { new_path: String },
    /// Preserve the losing side as a renamed sibling, then apply.
    CreateConflictCopy { copy_path: String },
}

/// Live local file-system state for the path a change targets, gathered by
/// the engine just before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDiskState {
    pub exists: bool,
    pub item_type: Option<ItemType>,
    /// Newest mtime; for folders, the newest across visible children.
    pub mtime_ms: i64,
    /// `None` for folders and absent paths.
    pub content_hash: Option<String>,
    /// Folders only: whether any visible children remain. Deleting children
    /// bumps the parent's mtime, so emptiness decides folder deletions, not
    /// the timestamp.
    pub has_children: bool,
}

impl LocalDiskState {
    pub fn absent() -> Self {
        Self {
            exists: false,
            item_type: None,
            mtime_ms: -1,
            content_hash: None,
            has_children: false,
        }
    }
}

/// Decides what to do with one remote change, given the index record and the
/// live local state. Checks run against the index because it reflects the
/// latest fully synced state.
pub fn resolve_download(
    change: &RemoteChange,
    entry: Option<&IndexEntry>,
    local: &LocalDiskState,
    exists: &dyn Fn(&str) -> bool,
) -> SyncAction {
    let change_rev = match change {
        RemoteChange::Deleted { .. } => None,
        RemoteChange::Folder { .. } => Some(FOLDER_REV),
        RemoteChange::File(meta) => Some(meta.rev.as_str()),
    };
    let index_rev = entry.and_then(|e| e.rev.as_deref());
    if change_rev == index_rev {
        return SyncAction::Skip;
    }

    let last_sync_ms = entry.map(|e| e.last_sync_ms).unwrap_or(0);

    match change {
        RemoteChange::Deleted { path } => {
            if !local.exists {
                return SyncAction::Skip;
            }
            // A folder whose visible children are all gone holds nothing
            // worth preserving; the batch deletes children first.
            if local.item_type == Some(ItemType::Folder) && !local.has_children {
                return SyncAction::Apply;
            }
            if local.mtime_ms <= last_sync_ms {
                return SyncAction::Apply;
            }
            // Local edits since the last sync would be lost; keep them.
            SyncAction::CreateConflictCopy {
                copy_path: conflict_copy_path(path, CONFLICT_COPY_SUFFIX, exists),
            }
        }
        RemoteChange::Folder { .. } => SyncAction::Apply,
        RemoteChange::File(meta) => {
            if local.content_hash.as_deref() == Some(meta.content_hash.as_str()) {
                // Same content under a new rev; only the index needs it.
                return SyncAction::Acknowledge;
            }
            if !local.exists || local.mtime_ms <= last_sync_ms {
                return SyncAction::Apply;
            }
            SyncAction::CreateConflictCopy {
                copy_path: conflict_copy_path(&meta.path, CONFLICT_COPY_SUFFIX, exists),
            }
        }
    }
}

/// Remote-side facts the upload resolver needs, probed by the engine.
#[derive(Debug, Clone, Default)]
pub struct RemoteProbe {
    /// Target path is under a selective-sync excluded root.
    pub selective_sync_excluded: bool,
    /// An existing remote path whose name differs from the target only in
    /// case, on hosts where both can coexist locally.
    pub case_colliding_path: Option<String>,
    /// Rev currently recorded remotely for the target, if any.
    pub remote_rev: Option<String>,
}

/// Decides what to do with one local change before upload.
pub fn resolve_upload(
    change: &LocalChange,
    entry: Option<&IndexEntry>,
    local_hash: Option<&str>,
    probe: &RemoteProbe,
    exists: &dyn Fn(&str) -> bool,
) -> SyncAction {
    let target = change.path();

    if probe.selective_sync_excluded {
        // Deleting under an excluded root uploads nothing; everything else
        // is moved out of the excluded namespace before upload.
        if matches!(change, LocalChange::Deleted { .. }) {
            return SyncAction::Skip;
        }
        return SyncAction::RenameTarget {
            new_path: conflict_copy_path(target, SELECTIVE_SYNC_SUFFIX, exists),
        };
    }

    if let Some(colliding) = &probe.case_colliding_path
        && paths::differs_only_in_case(colliding, target)
    {
        return SyncAction::RenameTarget {
            new_path: conflict_copy_path(target, CASE_CONFLICT_SUFFIX, exists),
        };
    }

    match change {
        LocalChange::Modified { .. }
        | LocalChange::Created {
            item_type: ItemType::File,
            ..
        } => {
            let index_hash = entry.and_then(|e| e.content_hash.as_deref());
            if local_hash.is_some() && local_hash == index_hash {
                // Content already uploaded; just refresh the sync stamp.
                return SyncAction::Acknowledge;
            }
            if is_type_change(change, entry)
                && probe.remote_rev.is_some()
                && probe.remote_rev.as_deref() != entry.and_then(|e| e.rev.as_deref())
            {
                // The remote item we are about to replace has moved on; pull
                // it down as a conflict copy before overwriting it.
                return SyncAction::CreateConflictCopy {
                    copy_path: conflict_copy_path(target, CONFLICT_COPY_SUFFIX, exists),
                };
            }
            SyncAction::Apply
        }
        LocalChange::Created {
            item_type: ItemType::Folder,
            ..
        } => {
            if is_type_change(change, entry)
                && probe.remote_rev.is_some()
                && probe.remote_rev.as_deref() != entry.and_then(|e| e.rev.as_deref())
            {
                return SyncAction::CreateConflictCopy {
                    copy_path: conflict_copy_path(target, CONFLICT_COPY_SUFFIX, exists),
                };
            }
            // A folder the index already records as synced needs no remote
            // call; the watcher replays our own downloads as creations.
            if let Some(entry) = entry
                && entry.item_type == ItemType::Folder
                && entry.rev.is_some()
            {
                return SyncAction::Acknowledge;
            }
            SyncAction::Apply
        }
        LocalChange::Deleted { .. } | LocalChange::Moved { .. } => SyncAction::Apply,
    }
}

fn is_type_change(change: &LocalChange, entry: Option<&IndexEntry>) -> bool {
    match entry {
        Some(entry) if entry.rev.is_some() => entry.item_type != change.item_type(),
        _ => false,
    }
}

/// Builds `"<name> (<suffix>)<ext>"`, disambiguating with a counter until
/// `exists` reports the name free.
pub fn conflict_copy_path(path: &str, suffix: &str, exists: &dyn Fn(&str) -> bool) -> String {
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (format!("{dir}/"), name),
        None => (String::new(), path),
    };
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
        _ => (name.to_string(), String::new()),
    };

    let first = format!("{dir}{stem} ({suffix}){ext}");
    if !exists(&first) {
        return first;
    }
    let mut counter = 2u64;
    loop {
        let candidate = format!("{dir}{stem} ({suffix} {counter}){ext}");
        if !exists(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulus_remote::FileMeta;

    fn never(_: &str) -> bool {
        false
    }

    fn file_change(path: &str, rev: &str, hash: &str) -> RemoteChange {
        RemoteChange::File(FileMeta {
            path: path.into(),
            rev: rev.into(),
            content_hash: hash.into(),
            server_modified_ms: 0,
        })
    }

    fn synced_entry(path: &str, rev: &str, hash: &str, last_sync_ms: i64) -> IndexEntry {
        IndexEntry::file(path, rev, hash, last_sync_ms)
    }

    fn local_file(mtime_ms: i64, hash: &str) -> LocalDiskState {
        LocalDiskState {
            exists: true,
            item_type: Some(ItemType::File),
            mtime_ms,
            content_hash: Some(hash.into()),
            has_children: false,
        }
    }

    #[test]
    fn download_skips_when_rev_matches_index() {
        let change = file_change("/a.txt", "r1", "h1");
        let entry = synced_entry("/a.txt", "r1", "h1", 100);
        let action = resolve_download(&change, Some(&entry), &local_file(50, "h1"), &never);
        assert_eq!(action, SyncAction::Skip);
    }

    #[test]
    fn download_acknowledges_when_content_already_matches() {
        let change = file_change("/a.txt", "r2", "h2");
        let entry = synced_entry("/a.txt", "r1", "h1", 100);
        let action = resolve_download(&change, Some(&entry), &local_file(500, "h2"), &never);
        assert_eq!(action, SyncAction::Acknowledge);
    }

    #[test]
    fn download_applies_over_unmodified_local() {
        let change = file_change("/a.txt", "r2", "h2");
        let entry = synced_entry("/a.txt", "r1", "h1", 100);
        let action = resolve_download(&change, Some(&entry), &local_file(90, "h1"), &never);
        assert_eq!(action, SyncAction::Apply);
    }

    #[test]
    fn download_conflict_copies_over_modified_local() {
        let change = file_change("/a.txt", "r2", "h3");
        let entry = synced_entry("/a.txt", "r1", "h1", 100);
        let action = resolve_download(&change, Some(&entry), &local_file(500, "h2"), &never);
        assert_eq!(
            action,
            SyncAction::CreateConflictCopy {
                copy_path: "/a (conflicting copy).txt".into()
            }
        );
    }

    #[test]
    fn download_applies_when_local_is_absent() {
        let change = file_change("/a.txt", "r1", "h1");
        let action = resolve_download(&change, None, &LocalDiskState::absent(), &never);
        assert_eq!(action, SyncAction::Apply);
    }

    #[test]
    fn remote_delete_skips_when_local_is_gone() {
        let change = RemoteChange::Deleted { path: "/a.txt".into() };
        let entry = synced_entry("/a.txt", "r1", "h1", 100);
        let action = resolve_download(&change, Some(&entry), &LocalDiskState::absent(), &never);
        assert_eq!(action, SyncAction::Skip);
    }

    #[test]
    fn remote_delete_applies_to_unmodified_local() {
        let change = RemoteChange::Deleted { path: "/a.txt".into() };
        let entry = synced_entry("/a.txt", "r1", "h1", 100);
        let action = resolve_download(&change, Some(&entry), &local_file(100, "h1"), &never);
        assert_eq!(action, SyncAction::Apply);
    }

    #[test]
    fn remote_delete_of_emptied_folder_applies_despite_fresh_mtime() {
        let change = RemoteChange::Deleted { path: "/p".into() };
        let entry = IndexEntry::folder("/p", 100);
        let local = LocalDiskState {
            exists: true,
            item_type: Some(ItemType::Folder),
            // Deleting the children just now bumped the folder's mtime.
            mtime_ms: 9_999,
            content_hash: None,
            has_children: false,
        };
        assert_eq!(
            resolve_download(&change, Some(&entry), &local, &never),
            SyncAction::Apply
        );
    }

    #[test]
    fn remote_delete_of_folder_with_unsynced_children_keeps_a_copy() {
        let change = RemoteChange::Deleted { path: "/p".into() };
        let entry = IndexEntry::folder("/p", 100);
        let local = LocalDiskState {
            exists: true,
            item_type: Some(ItemType::Folder),
            mtime_ms: 9_999,
            content_hash: None,
            has_children: true,
        };
        assert_eq!(
            resolve_download(&change, Some(&entry), &local, &never),
            SyncAction::CreateConflictCopy {
                copy_path: "/p (conflicting copy)".into()
            }
        );
    }

    #[test]
    fn remote_delete_preserves_modified_local_as_conflict_copy() {
        let change = RemoteChange::Deleted { path: "/a.txt".into() };
        let entry = synced_entry("/a.txt", "r1", "h1", 100);
        let action = resolve_download(&change, Some(&entry), &local_file(900, "h2"), &never);
        assert_eq!(
            action,
            SyncAction::CreateConflictCopy {
                copy_path: "/a (conflicting copy).txt".into()
            }
        );
    }

    #[test]
    fn upload_renames_into_selective_sync_conflict() {
        let change = LocalChange::Created {
            path: "/excluded/y.txt".into(),
            item_type: ItemType::File,
        };
        let probe = RemoteProbe {
            selective_sync_excluded: true,
            ..Default::default()
        };
        let action = resolve_upload(&change, None, Some("h1"), &probe, &never);
        assert_eq!(
            action,
            SyncAction::RenameTarget {
                new_path: "/excluded/y (selective sync conflict).txt".into()
            }
        );
    }

    #[test]
    fn upload_renames_into_case_conflict() {
        let change = LocalChange::Created {
            path: "/foo.txt".into(),
            item_type: ItemType::File,
        };
        let probe = RemoteProbe {
            case_colliding_path: Some("/Foo.txt".into()),
            ..Default::default()
        };
        let action = resolve_upload(&change, None, Some("h1"), &probe, &never);
        assert_eq!(
            action,
            SyncAction::RenameTarget {
                new_path: "/foo (case conflict).txt".into()
            }
        );
    }

    #[test]
    fn upload_acknowledges_unchanged_content() {
        let change = LocalChange::Modified { path: "/a.txt".into() };
        let entry = synced_entry("/a.txt", "r1", "h1", 100);
        let action = resolve_upload(&change, Some(&entry), Some("h1"), &RemoteProbe::default(), &never);
        assert_eq!(action, SyncAction::Acknowledge);
    }

    #[test]
    fn upload_acknowledges_already_synced_folder() {
        let change = LocalChange::Created {
            path: "/Docs".into(),
            item_type: ItemType::Folder,
        };
        let entry = IndexEntry::folder("/Docs", 100);
        let probe = RemoteProbe {
            remote_rev: Some(FOLDER_REV.to_string()),
            ..Default::default()
        };
        let action = resolve_upload(&change, Some(&entry), None, &probe, &never);
        assert_eq!(action, SyncAction::Acknowledge);
    }

    #[test]
    fn upload_applies_folder_creation_when_index_has_no_entry() {
        let change = LocalChange::Created {
            path: "/Docs".into(),
            item_type: ItemType::Folder,
        };
        let action = resolve_upload(&change, None, None, &RemoteProbe::default(), &never);
        assert_eq!(action, SyncAction::Apply);
    }

    #[test]
    fn upload_type_change_with_stale_remote_pulls_conflict_copy_first() {
        let change = LocalChange::Created {
            path: "/x".into(),
            item_type: ItemType::File,
        };
        let entry = IndexEntry::folder("/x", 100);
        let probe = RemoteProbe {
            remote_rev: Some("r9".into()),
            ..Default::default()
        };
        let action = resolve_upload(&change, Some(&entry), Some("h1"), &probe, &never);
        assert_eq!(
            action,
            SyncAction::CreateConflictCopy {
                copy_path: "/x (conflicting copy)".into()
            }
        );
    }

    #[test]
    fn upload_applies_plain_changes() {
        let change = LocalChange::Modified { path: "/a.txt".into() };
        let entry = synced_entry("/a.txt", "r1", "h1", 100);
        let action = resolve_upload(&change, Some(&entry), Some("h2"), &RemoteProbe::default(), &never);
        assert_eq!(action, SyncAction::Apply);

        let delete = LocalChange::Deleted {
            path: "/a.txt".into(),
            item_type: ItemType::File,
        };
        let action = resolve_upload(&delete, Some(&entry), None, &RemoteProbe::default(), &never);
        assert_eq!(action, SyncAction::Apply);
    }

    #[test]
    fn conflict_copy_names_disambiguate_monotonically() {
        assert_eq!(
            conflict_copy_path("/a.txt", CONFLICT_COPY_SUFFIX, &never),
            "/a (conflicting copy).txt"
        );
        let taken = |candidate: &str| {
            candidate == "/a (conflicting copy).txt" || candidate == "/a (conflicting copy 2).txt"
        };
        assert_eq!(
            conflict_copy_path("/a.txt", CONFLICT_COPY_SUFFIX, &taken),
            "/a (conflicting copy 3).txt"
        );
    }

    #[test]
    fn conflict_copy_handles_extensionless_and_dotfiles() {
        assert_eq!(
            conflict_copy_path("/Makefile", CONFLICT_COPY_SUFFIX, &never),
            "/Makefile (conflicting copy)"
        );
        assert_eq!(
            conflict_copy_path("/.env", CONFLICT_COPY_SUFFIX, &never),
            "/.env (conflicting copy)"
        );
        assert_eq!(
            conflict_copy_path("/archive.tar.gz", CONFLICT_COPY_SUFFIX, &never),
            "/archive.tar (conflicting copy).gz"
        );
    }
}
