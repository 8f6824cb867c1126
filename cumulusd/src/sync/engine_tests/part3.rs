//! Batch-level properties: hierarchical order, idempotence, bounded
//! concurrency per path.

use std::sync::Arc;

use super::support::Harness;
use crate::sync::engine::TaskStatus;
use crate::sync::fs_events::LocalChange;
use crate::sync::index::ItemType;
use crate::sync::normalize;
use crate::sync::workers::WorkerPool;
use cumulus_remote::RemoteChange;
use tokio_util::sync::CancellationToken;

async fn normalized_remote(h: &Harness, changes: Vec<RemoteChange>) -> Vec<RemoteChange> {
    let snapshot = h.engine.type_snapshot().await.unwrap();
    let lookup = |key: &str| snapshot.get(key).copied();
    normalize::normalize_remote(changes, h.engine.resolver(), h.engine.rules(), &lookup)
}

#[tokio::test]
async fn remote_batch_creates_parents_before_children() {
    let h = Harness::new().await;
    let cancel = CancellationToken::new();
    let pool = WorkerPool::new(6);

    // Seed out of order: files and folders interleaved, deep first.
    let f1 = h.remote.put_file("/p/sub/deep.txt", b"deep");
    let f2 = h.remote.put_file("/p/top.txt", b"top");
    let changes = vec![
        RemoteChange::File(f1),
        RemoteChange::Folder { path: "/p/sub".into() },
        RemoteChange::File(f2),
        RemoteChange::Folder { path: "/p".into() },
    ];

    let normalized = normalized_remote(&h, changes).await;
    let outcomes = pool.run_remote_batch(&h.engine, normalized, &cancel).await;

    assert!(outcomes.iter().all(|o| o.status == TaskStatus::Applied));
    assert!(h.local_path("/p").is_dir());
    assert!(h.local_path("/p/sub").is_dir());
    assert_eq!(h.read_local("/p/sub/deep.txt").await.unwrap(), b"deep");
    assert_eq!(h.read_local("/p/top.txt").await.unwrap(), b"top");
}

#[tokio::test]
async fn applying_the_same_batch_twice_is_idempotent() {
    let h = Harness::new().await;
    let cancel = CancellationToken::new();
    let pool = WorkerPool::new(6);

    h.remote.put_folder("/p");
    let meta = h.remote.put_file("/p/a.txt", b"content");
    let changes = vec![
        RemoteChange::Folder { path: "/p".into() },
        RemoteChange::File(meta),
    ];

    let normalized = normalized_remote(&h, changes.clone()).await;
    pool.run_remote_batch(&h.engine, normalized, &cancel).await;
    let entry_after_first = h.engine.index().get("/p/a.txt").await.unwrap().unwrap();

    // Same batch re-delivered, as after a crash before the cursor advance.
    let normalized = normalized_remote(&h, changes).await;
    let outcomes = pool.run_remote_batch(&h.engine, normalized, &cancel).await;
    assert!(
        outcomes
            .iter()
            .all(|o| matches!(o.status, TaskStatus::Applied | TaskStatus::Skipped))
    );

    let entry_after_second = h.engine.index().get("/p/a.txt").await.unwrap().unwrap();
    assert_eq!(entry_after_first.rev, entry_after_second.rev);
    assert_eq!(h.read_local("/p/a.txt").await.unwrap(), b"content");
    // No conflict copies materialized by the replay.
    assert!(h.read_local("/p/a (conflicting copy).txt").await.is_none());
}

#[tokio::test]
async fn remote_deletions_run_children_before_parents() {
    let h = Harness::new().await;
    let cancel = CancellationToken::new();
    let pool = WorkerPool::new(6);

    h.remote.put_folder("/p");
    let meta = h.remote.put_file("/p/a.txt", b"x");
    let seed = normalized_remote(
        &h,
        vec![RemoteChange::Folder { path: "/p".into() }, RemoteChange::File(meta)],
    )
    .await;
    pool.run_remote_batch(&h.engine, seed, &cancel).await;

    let deletions = normalized_remote(
        &h,
        vec![
            RemoteChange::Deleted { path: "/p".into() },
            RemoteChange::Deleted { path: "/p/a.txt".into() },
        ],
    )
    .await;
    // Normalization inverted the order: the child goes first.
    assert_eq!(deletions[0].path(), "/p/a.txt");

    let outcomes = pool.run_remote_batch(&h.engine, deletions, &cancel).await;
    assert!(outcomes.iter().all(|o| o.status == TaskStatus::Applied));
    assert!(!h.local_path("/p").exists());
    assert!(h.engine.index().iter_prefix("/p").await.unwrap().is_empty());
}

#[tokio::test]
async fn local_batch_uploads_folders_before_files() {
    let h = Harness::new().await;
    let cancel = CancellationToken::new();
    let pool = WorkerPool::new(6);

    h.write_local("/p/a.txt", b"a").await;
    h.write_local("/p/b.txt", b"b").await;

    let snapshot = h.engine.type_snapshot().await.unwrap();
    let lookup = |key: &str| snapshot.get(key).copied();
    let changes = normalize::normalize_local(
        vec![
            LocalChange::Created {
                path: "/p/a.txt".into(),
                item_type: ItemType::File,
            },
            LocalChange::Created {
                path: "/p".into(),
                item_type: ItemType::Folder,
            },
            LocalChange::Created {
                path: "/p/b.txt".into(),
                item_type: ItemType::File,
            },
        ],
        h.engine.resolver(),
        h.engine.rules(),
        &lookup,
    );
    assert_eq!(changes[0].path(), "/p");

    let outcomes = pool.run_local_batch(&h.engine, changes, &cancel).await;
    assert!(outcomes.iter().all(|o| o.status == TaskStatus::Applied));
    assert!(h.remote.exists("/p"));
    assert!(h.remote.exists("/p/a.txt"));
    assert!(h.remote.exists("/p/b.txt"));
}

#[tokio::test]
async fn at_most_one_in_flight_action_per_path() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Exercise the claim set directly with many contenders per key and a
    // tracker that detects overlap.
    let set: Arc<std::sync::Mutex<std::collections::HashSet<String>>> = Arc::default();
    let active = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let set = set.clone();
        let active = active.clone();
        let max_seen = max_seen.clone();
        handles.push(tokio::spawn(async move {
            let guards = crate::sync::workers::claim_for_test(&set, vec!["/same".into()]).await;
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            drop(guards);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_task_in_batch_reports_failure_and_leaves_rest_applied() {
    let h = Harness::new().await;
    let cancel = CancellationToken::new();
    let pool = WorkerPool::new(2);

    let ok = h.remote.put_file("/ok.txt", b"fine");
    let ghost = cumulus_remote::FileMeta {
        path: "/ghost.txt".into(),
        rev: "r404".into(),
        content_hash: "nope".into(),
        server_modified_ms: 0,
    };
    let normalized = normalized_remote(
        &h,
        vec![RemoteChange::File(ok), RemoteChange::File(ghost)],
    )
    .await;
    let outcomes = pool.run_remote_batch(&h.engine, normalized, &cancel).await;

    let ok_outcome = outcomes.iter().find(|o| o.path == "/ok.txt").unwrap();
    let ghost_outcome = outcomes.iter().find(|o| o.path == "/ghost.txt").unwrap();
    assert_eq!(ok_outcome.status, TaskStatus::Applied);
    assert!(matches!(ghost_outcome.status, TaskStatus::Failed { .. }));
    assert_eq!(h.read_local("/ok.txt").await.unwrap(), b"fine");
}
