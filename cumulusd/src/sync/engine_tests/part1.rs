//! Download-direction engine tests.

use super::support::Harness;
use crate::sync::engine::{SyncErrorKind, TaskStatus};
use crate::sync::hasher::hash_bytes;
use crate::sync::index::{FOLDER_REV, ItemType};
use cumulus_remote::{FileMeta, RemoteChange};
use tokio_util::sync::CancellationToken;

fn file_change(meta: FileMeta) -> RemoteChange {
    RemoteChange::File(meta)
}

#[tokio::test]
async fn simple_download_materializes_file_and_index() {
    let h = Harness::new().await;
    let meta = h.remote.put_file("/a.txt", b"hello");
    let cancel = CancellationToken::new();

    let outcome = h
        .engine
        .apply_remote_change(&file_change(meta.clone()), &cancel)
        .await;
    assert_eq!(outcome.status, TaskStatus::Applied);

    assert_eq!(h.read_local("/a.txt").await.unwrap(), b"hello");
    let entry = h.engine.index().get("/a.txt").await.unwrap().unwrap();
    assert_eq!(entry.rev.as_deref(), Some(meta.rev.as_str()));
    assert_eq!(entry.content_hash.as_deref(), Some(hash_bytes(b"hello").as_str()));
    assert_eq!(entry.item_type, ItemType::File);
}

#[tokio::test]
async fn folder_download_creates_directory_with_sentinel_entry() {
    let h = Harness::new().await;
    let cancel = CancellationToken::new();

    let outcome = h
        .engine
        .apply_remote_change(&RemoteChange::Folder { path: "/Docs".into() }, &cancel)
        .await;
    assert_eq!(outcome.status, TaskStatus::Applied);
    assert!(h.local_path("/Docs").is_dir());

    let entry = h.engine.index().get("/docs").await.unwrap().unwrap();
    assert_eq!(entry.rev.as_deref(), Some(FOLDER_REV));
    assert_eq!(entry.item_type, ItemType::Folder);
}

#[tokio::test]
async fn redelivered_change_is_skipped() {
    let h = Harness::new().await;
    let meta = h.remote.put_file("/a.txt", b"hello");
    let cancel = CancellationToken::new();

    let change = file_change(meta);
    let first = h.engine.apply_remote_change(&change, &cancel).await;
    assert_eq!(first.status, TaskStatus::Applied);

    // Re-delivery after a crash between apply and cursor advance.
    let second = h.engine.apply_remote_change(&change, &cancel).await;
    assert_eq!(second.status, TaskStatus::Skipped);
    assert_eq!(h.read_local("/a.txt").await.unwrap(), b"hello");
}

#[tokio::test]
async fn matching_local_content_updates_index_without_transfer() {
    let h = Harness::new().await;
    h.write_local("/a.txt", b"same").await;
    let meta = h.remote.put_file("/a.txt", b"same");
    let cancel = CancellationToken::new();

    let outcome = h.engine.apply_remote_change(&file_change(meta.clone()), &cancel).await;
    assert_eq!(outcome.status, TaskStatus::Skipped);

    let entry = h.engine.index().get("/a.txt").await.unwrap().unwrap();
    assert_eq!(entry.rev.as_deref(), Some(meta.rev.as_str()));
}

#[tokio::test]
async fn modified_local_file_is_preserved_as_conflict_copy() {
    let h = Harness::new().await;
    let cancel = CancellationToken::new();

    // Base version fully synced.
    let base = h.remote.put_file("/a.txt", b"base");
    h.engine
        .apply_remote_change(&file_change(base), &cancel)
        .await;

    // Local edit after last sync, then a newer remote version arrives.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    h.write_local("/a.txt", b"local edit").await;
    let newer = h.remote.put_file("/a.txt", b"remote edit");

    let outcome = h
        .engine
        .apply_remote_change(&file_change(newer.clone()), &cancel)
        .await;
    let TaskStatus::ConflictCopied { copy_path } = &outcome.status else {
        panic!("expected conflict copy, got {:?}", outcome.status);
    };
    assert_eq!(copy_path, "/a (conflicting copy).txt");

    assert_eq!(h.read_local("/a.txt").await.unwrap(), b"remote edit");
    assert_eq!(
        h.read_local("/a (conflicting copy).txt").await.unwrap(),
        b"local edit"
    );
    let entry = h.engine.index().get("/a.txt").await.unwrap().unwrap();
    assert_eq!(entry.rev.as_deref(), Some(newer.rev.as_str()));
}

#[tokio::test]
async fn remote_delete_of_unmodified_local_applies() {
    let h = Harness::new().await;
    let cancel = CancellationToken::new();
    let meta = h.remote.put_file("/a.txt", b"x");
    h.engine
        .apply_remote_change(&file_change(meta), &cancel)
        .await;

    let outcome = h
        .engine
        .apply_remote_change(&RemoteChange::Deleted { path: "/a.txt".into() }, &cancel)
        .await;
    assert_eq!(outcome.status, TaskStatus::Applied);
    assert!(h.read_local("/a.txt").await.is_none());
    assert!(h.engine.index().get("/a.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn remote_delete_of_modified_local_keeps_conflict_copy() {
    let h = Harness::new().await;
    let cancel = CancellationToken::new();
    let meta = h.remote.put_file("/a.txt", b"x");
    h.engine
        .apply_remote_change(&file_change(meta), &cancel)
        .await;

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    h.write_local("/a.txt", b"precious edit").await;

    let outcome = h
        .engine
        .apply_remote_change(&RemoteChange::Deleted { path: "/a.txt".into() }, &cancel)
        .await;
    assert!(matches!(outcome.status, TaskStatus::ConflictCopied { .. }));
    assert!(h.read_local("/a.txt").await.is_none());
    assert_eq!(
        h.read_local("/a (conflicting copy).txt").await.unwrap(),
        b"precious edit"
    );
}

#[tokio::test]
async fn remote_delete_of_absent_local_is_skipped() {
    let h = Harness::new().await;
    let cancel = CancellationToken::new();
    let outcome = h
        .engine
        .apply_remote_change(&RemoteChange::Deleted { path: "/never.txt".into() }, &cancel)
        .await;
    assert_eq!(outcome.status, TaskStatus::Skipped);
}

#[tokio::test]
async fn download_of_vanished_remote_item_reports_not_found() {
    let h = Harness::new().await;
    let cancel = CancellationToken::new();
    // Listed but gone by the time we download.
    let change = file_change(FileMeta {
        path: "/ghost.txt".into(),
        rev: "r404".into(),
        content_hash: "nope".into(),
        server_modified_ms: 0,
    });
    let outcome = h.engine.apply_remote_change(&change, &cancel).await;
    assert!(matches!(
        outcome.status,
        TaskStatus::Failed {
            kind: SyncErrorKind::NotFound,
            transient: false,
            ..
        }
    ));
}

#[tokio::test]
async fn transient_download_failure_is_classified_for_retry() {
    let h = Harness::new().await;
    let cancel = CancellationToken::new();
    let meta = h.remote.put_file("/a.txt", b"x");
    h.remote.fail_next_downloads(1);

    let outcome = h
        .engine
        .apply_remote_change(&file_change(meta.clone()), &cancel)
        .await;
    assert!(outcome.is_transient_failure());

    // The next attempt succeeds.
    let outcome = h.engine.apply_remote_change(&file_change(meta), &cancel).await;
    assert_eq!(outcome.status, TaskStatus::Applied);
}
