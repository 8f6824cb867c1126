use super::*;

fn file_entry(path: &str, rev: &str) -> IndexEntry {
    IndexEntry::file(path, rev, "h1", 1_000)
}

#[tokio::test]
async fn put_get_roundtrip_preserves_display_case() {
    let store = IndexStore::in_memory().await.unwrap();
    store
        .put("/docs/a.txt", &file_entry("/Docs/A.txt", "r1"))
        .await
        .unwrap();

    let entry = store.get("/docs/a.txt").await.unwrap().unwrap();
    assert_eq!(entry.path, "/Docs/A.txt");
    assert_eq!(entry.rev.as_deref(), Some("r1"));
    assert_eq!(entry.item_type, ItemType::File);
    assert!(store.get("/docs/missing").await.unwrap().is_none());
}

#[tokio::test]
async fn put_overwrites_existing_entry() {
    let store = IndexStore::in_memory().await.unwrap();
    store
        .put("/docs/a.txt", &file_entry("/Docs/A.txt", "r1"))
        .await
        .unwrap();
    store
        .put("/docs/a.txt", &file_entry("/Docs/A.txt", "r2"))
        .await
        .unwrap();

    let entry = store.get("/docs/a.txt").await.unwrap().unwrap();
    assert_eq!(entry.rev.as_deref(), Some("r2"));
    assert_eq!(store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn delete_removes_entry() {
    let store = IndexStore::in_memory().await.unwrap();
    store
        .put("/docs/a.txt", &file_entry("/Docs/A.txt", "r1"))
        .await
        .unwrap();
    store.delete("/docs/a.txt").await.unwrap();
    assert!(store.get("/docs/a.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn iter_prefix_respects_segment_boundaries() {
    let store = IndexStore::in_memory().await.unwrap();
    store
        .put("/docs", &IndexEntry::folder("/Docs", 0))
        .await
        .unwrap();
    store
        .put("/docs/a.txt", &file_entry("/Docs/A.txt", "r1"))
        .await
        .unwrap();
    store
        .put("/docs2/b.txt", &file_entry("/Docs2/B.txt", "r2"))
        .await
        .unwrap();

    let under_docs = store.iter_prefix("/docs").await.unwrap();
    let keys: Vec<_> = under_docs.iter().map(|(key, _)| key.as_str()).collect();
    assert_eq!(keys, vec!["/docs", "/docs/a.txt"]);

    let all = store.iter_prefix("/").await.unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn cursor_is_absent_until_set() {
    let store = IndexStore::in_memory().await.unwrap();
    assert!(store.get_cursor().await.unwrap().is_none());
    store.set_cursor("cur-1").await.unwrap();
    assert_eq!(store.get_cursor().await.unwrap().as_deref(), Some("cur-1"));
    store.clear_cursor().await.unwrap();
    assert!(store.get_cursor().await.unwrap().is_none());
}

#[tokio::test]
async fn commit_groups_mutations_with_cursor_advance() {
    let store = IndexStore::in_memory().await.unwrap();
    store
        .put("/old.txt", &file_entry("/old.txt", "r0"))
        .await
        .unwrap();

    store
        .commit(
            &[
                EntryMutation::Put {
                    key: "/new.txt".into(),
                    entry: file_entry("/new.txt", "r1"),
                },
                EntryMutation::Delete {
                    key: "/old.txt".into(),
                },
            ],
            Some("cur-2"),
        )
        .await
        .unwrap();

    assert!(store.get("/old.txt").await.unwrap().is_none());
    assert_eq!(
        store.get("/new.txt").await.unwrap().unwrap().rev.as_deref(),
        Some("r1")
    );
    assert_eq!(store.get_cursor().await.unwrap().as_deref(), Some("cur-2"));
}

#[tokio::test]
async fn schema_version_is_written_on_first_init() {
    let store = IndexStore::in_memory().await.unwrap();
    // Re-running init must be a no-op, not a failure.
    store.init().await.unwrap();
    let version = store.get_meta(SCHEMA_VERSION_KEY).await.unwrap().unwrap();
    assert_eq!(version, SCHEMA_VERSION.to_string());
}

#[tokio::test]
async fn last_reconcile_roundtrip() {
    let store = IndexStore::in_memory().await.unwrap();
    assert!(store.get_last_reconcile_ms().await.unwrap().is_none());
    store.set_last_reconcile_ms(123_456).await.unwrap();
    assert_eq!(store.get_last_reconcile_ms().await.unwrap(), Some(123_456));
}

#[tokio::test]
async fn folder_entries_carry_sentinels() {
    let store = IndexStore::in_memory().await.unwrap();
    store
        .put("/music", &IndexEntry::folder("/Music", 5))
        .await
        .unwrap();
    let entry = store.get("/music").await.unwrap().unwrap();
    assert_eq!(entry.rev.as_deref(), Some(FOLDER_REV));
    assert_eq!(entry.content_hash.as_deref(), Some("folder"));
    assert_eq!(entry.item_type, ItemType::Folder);
}
