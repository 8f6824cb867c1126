//! Upload-direction engine tests.

use super::support::Harness;
use crate::sync::engine::TaskStatus;
use crate::sync::fs_events::LocalChange;
use crate::sync::hasher::hash_bytes;
use crate::sync::index::{IndexEntry, ItemType};
use tokio_util::sync::CancellationToken;

fn created(path: &str) -> LocalChange {
    LocalChange::Created {
        path: path.into(),
        item_type: ItemType::File,
    }
}

#[tokio::test]
async fn created_file_uploads_and_records_rev() {
    let h = Harness::new().await;
    let cancel = CancellationToken::new();
    h.write_local("/up.txt", b"payload").await;

    let outcome = h.engine.apply_local_change(&created("/up.txt"), &cancel).await;
    assert_eq!(outcome.status, TaskStatus::Applied);

    assert_eq!(h.remote.file_content("/up.txt").unwrap(), b"payload");
    let entry = h.engine.index().get("/up.txt").await.unwrap().unwrap();
    assert_eq!(entry.rev, h.remote.file_rev("/up.txt"));
    assert_eq!(
        entry.content_hash.as_deref(),
        Some(hash_bytes(b"payload").as_str())
    );
}

#[tokio::test]
async fn created_folder_is_mirrored_remotely() {
    let h = Harness::new().await;
    let cancel = CancellationToken::new();
    tokio::fs::create_dir_all(h.local_path("/Docs")).await.unwrap();

    let change = LocalChange::Created {
        path: "/Docs".into(),
        item_type: ItemType::Folder,
    };
    let outcome = h.engine.apply_local_change(&change, &cancel).await;
    assert_eq!(outcome.status, TaskStatus::Applied);
    assert!(h.remote.exists("/Docs"));
    assert_eq!(
        h.engine.index().get("/docs").await.unwrap().unwrap().item_type,
        ItemType::Folder
    );
}

#[tokio::test]
async fn replayed_creation_of_downloaded_folder_skips_remote_call() {
    let h = Harness::new().await;
    let cancel = CancellationToken::new();

    // The engine just materialized this folder from a download; the watcher
    // echoes it back as a local creation.
    tokio::fs::create_dir_all(h.local_path("/Docs")).await.unwrap();
    h.engine
        .index()
        .put("/docs", &IndexEntry::folder("/Docs", 1))
        .await
        .unwrap();

    let change = LocalChange::Created {
        path: "/Docs".into(),
        item_type: ItemType::Folder,
    };
    let outcome = h.engine.apply_local_change(&change, &cancel).await;
    assert_eq!(outcome.status, TaskStatus::Skipped);

    // No folder was round-tripped to the remote; only the stamp moved.
    assert!(!h.remote.exists("/Docs"));
    let entry = h.engine.index().get("/docs").await.unwrap().unwrap();
    assert!(entry.last_sync_ms > 1);
}

#[tokio::test]
async fn unchanged_content_skips_upload_but_refreshes_stamp() {
    let h = Harness::new().await;
    let cancel = CancellationToken::new();
    h.write_local("/a.txt", b"same").await;
    let hash = hash_bytes(b"same");
    h.engine
        .index()
        .put("/a.txt", &IndexEntry::file("/a.txt", "r1", &hash, 1))
        .await
        .unwrap();

    let change = LocalChange::Modified { path: "/a.txt".into() };
    let outcome = h.engine.apply_local_change(&change, &cancel).await;
    assert_eq!(outcome.status, TaskStatus::Skipped);

    // No upload happened, but the stamp moved forward.
    assert!(!h.remote.exists("/a.txt"));
    let entry = h.engine.index().get("/a.txt").await.unwrap().unwrap();
    assert!(entry.last_sync_ms > 1);
    assert_eq!(entry.rev.as_deref(), Some("r1"));
}

#[tokio::test]
async fn local_delete_propagates_and_tolerates_missing_remote() {
    let h = Harness::new().await;
    let cancel = CancellationToken::new();
    h.remote.put_file("/a.txt", b"x");
    h.engine
        .index()
        .put("/a.txt", &IndexEntry::file("/a.txt", "r1", "h", 1))
        .await
        .unwrap();

    let change = LocalChange::Deleted {
        path: "/a.txt".into(),
        item_type: ItemType::File,
    };
    let outcome = h.engine.apply_local_change(&change, &cancel).await;
    assert_eq!(outcome.status, TaskStatus::Applied);
    assert!(!h.remote.exists("/a.txt"));
    assert!(h.engine.index().get("/a.txt").await.unwrap().is_none());

    // Deleting again: the remote already dropped it, still success.
    let outcome = h.engine.apply_local_change(&change, &cancel).await;
    assert_eq!(outcome.status, TaskStatus::Applied);
}

#[tokio::test]
async fn local_move_propagates_remotely() {
    let h = Harness::new().await;
    let cancel = CancellationToken::new();
    h.remote.put_file("/old.txt", b"content");
    let rev = h.remote.file_rev("/old.txt").unwrap();
    h.engine
        .index()
        .put(
            "/old.txt",
            &IndexEntry::file("/old.txt", &rev, &hash_bytes(b"content"), 1),
        )
        .await
        .unwrap();

    let change = LocalChange::Moved {
        from: "/old.txt".into(),
        to: "/new.txt".into(),
        item_type: ItemType::File,
    };
    let outcome = h.engine.apply_local_change(&change, &cancel).await;
    assert_eq!(outcome.status, TaskStatus::Applied);
    assert!(!h.remote.exists("/old.txt"));
    assert_eq!(h.remote.file_content("/new.txt").unwrap(), b"content");
    assert!(h.engine.index().get("/old.txt").await.unwrap().is_none());
    assert!(h.engine.index().get("/new.txt").await.unwrap().is_some());
}

#[tokio::test]
async fn move_of_item_unknown_remotely_falls_back_to_upload() {
    let h = Harness::new().await;
    let cancel = CancellationToken::new();
    h.write_local("/fresh.txt", b"body").await;

    let change = LocalChange::Moved {
        from: "/never-uploaded.txt".into(),
        to: "/fresh.txt".into(),
        item_type: ItemType::File,
    };
    let outcome = h.engine.apply_local_change(&change, &cancel).await;
    assert_eq!(outcome.status, TaskStatus::Applied);
    assert_eq!(h.remote.file_content("/fresh.txt").unwrap(), b"body");
}

#[tokio::test]
async fn selective_sync_conflict_renames_before_upload() {
    let h = Harness::with_selective_sync(vec!["/excluded".into()]).await;
    let cancel = CancellationToken::new();
    h.write_local("/excluded/y.txt", b"kept").await;

    let outcome = h
        .engine
        .apply_local_change(&created("/excluded/y.txt"), &cancel)
        .await;
    let TaskStatus::Renamed { new_path } = &outcome.status else {
        panic!("expected rename, got {:?}", outcome.status);
    };
    assert_eq!(new_path, "/excluded/y (selective sync conflict).txt");

    // Local file moved aside and uploaded under the new name.
    assert!(h.read_local("/excluded/y.txt").await.is_none());
    assert_eq!(
        h.read_local("/excluded/y (selective sync conflict).txt")
            .await
            .unwrap(),
        b"kept"
    );
    assert_eq!(
        h.remote
            .file_content("/excluded/y (selective sync conflict).txt")
            .unwrap(),
        b"kept"
    );
}

#[tokio::test]
async fn case_conflict_renames_before_upload() {
    let h = Harness::new().await;
    let cancel = CancellationToken::new();

    // The remote already holds /Foo.txt; the index reflects it.
    let meta = h.remote.put_file("/Foo.txt", b"remote");
    h.engine
        .index()
        .put(
            "/foo.txt",
            &IndexEntry::file("/Foo.txt", &meta.rev, &meta.content_hash, 1),
        )
        .await
        .unwrap();

    h.write_local("/foo.txt", b"local").await;
    let outcome = h.engine.apply_local_change(&created("/foo.txt"), &cancel).await;
    let TaskStatus::Renamed { new_path } = &outcome.status else {
        panic!("expected rename, got {:?}", outcome.status);
    };
    assert_eq!(new_path, "/foo (case conflict).txt");
    assert_eq!(
        h.remote.file_content("/foo (case conflict).txt").unwrap(),
        b"local"
    );
    // The original remote file is untouched.
    assert_eq!(h.remote.file_content("/Foo.txt").unwrap(), b"remote");
}

#[tokio::test]
async fn rev_mismatch_defers_to_server_side_conflict_copy() {
    let h = Harness::new().await;
    let cancel = CancellationToken::new();

    // Index believes r-stale, but the remote has moved on.
    h.remote.put_file("/a.txt", b"v1");
    let live = h.remote.put_file("/a.txt", b"v2");
    h.engine
        .index()
        .put(
            "/a.txt",
            &IndexEntry::file("/a.txt", "r-stale", "h-stale", 1),
        )
        .await
        .unwrap();

    h.write_local("/a.txt", b"local version").await;
    let change = LocalChange::Modified { path: "/a.txt".into() };
    let outcome = h.engine.apply_local_change(&change, &cancel).await;
    assert_eq!(outcome.status, TaskStatus::Skipped);

    // The server kept our body as a conflict copy; the target is unchanged.
    assert_eq!(h.remote.file_content("/a.txt").unwrap(), b"v2");
    assert_eq!(h.remote.file_rev("/a.txt").as_deref(), Some(live.rev.as_str()));
    assert_eq!(
        h.remote.file_content("/a (conflicting copy).txt").unwrap(),
        b"local version"
    );
}

#[tokio::test]
async fn transient_upload_failure_is_classified_for_retry() {
    let h = Harness::new().await;
    let cancel = CancellationToken::new();
    h.write_local("/flaky.txt", b"x").await;
    h.remote.fail_next_uploads(1);

    let outcome = h.engine.apply_local_change(&created("/flaky.txt"), &cancel).await;
    assert!(outcome.is_transient_failure());

    let outcome = h.engine.apply_local_change(&created("/flaky.txt"), &cancel).await;
    assert_eq!(outcome.status, TaskStatus::Applied);
    assert_eq!(h.remote.file_content("/flaky.txt").unwrap(), b"x");
}

#[tokio::test]
async fn vanished_local_file_drops_the_event() {
    let h = Harness::new().await;
    let cancel = CancellationToken::new();
    let outcome = h
        .engine
        .apply_local_change(&created("/never-existed.txt"), &cancel)
        .await;
    assert_eq!(outcome.status, TaskStatus::Skipped);
    assert!(!h.remote.exists("/never-existed.txt"));
}

#[tokio::test]
async fn type_change_with_stale_remote_pulls_conflict_copy_first() {
    let h = Harness::new().await;
    let cancel = CancellationToken::new();

    // Index thinks /x is a folder; remotely it is now a file with new content.
    h.remote.put_file("/x", b"remote file");
    h.engine
        .index()
        .put("/x", &IndexEntry::folder("/x", 1))
        .await
        .unwrap();

    // Locally the folder was replaced by a file.
    h.write_local("/x", b"local file").await;
    let change = LocalChange::Created {
        path: "/x".into(),
        item_type: ItemType::File,
    };
    let outcome = h.engine.apply_local_change(&change, &cancel).await;
    let TaskStatus::ConflictCopied { copy_path } = &outcome.status else {
        panic!("expected conflict copy, got {:?}", outcome.status);
    };

    // Remote content preserved locally, local content uploaded.
    assert_eq!(
        h.read_local(copy_path).await.unwrap(),
        b"remote file"
    );
    assert_eq!(h.remote.file_content("/x").unwrap(), b"local file");
}
