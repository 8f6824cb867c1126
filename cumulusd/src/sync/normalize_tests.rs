use super::*;
use std::path::PathBuf;

use cumulus_remote::FileMeta;

fn resolver() -> PathResolver {
    PathResolver::new(PathBuf::from("/sync"), true)
}

fn no_index(_: &str) -> Option<ItemType> {
    None
}

fn created(path: &str) -> LocalChange {
    LocalChange::Created {
        path: path.into(),
        item_type: ItemType::File,
    }
}

fn created_dir(path: &str) -> LocalChange {
    LocalChange::Created {
        path: path.into(),
        item_type: ItemType::Folder,
    }
}

fn modified(path: &str) -> LocalChange {
    LocalChange::Modified { path: path.into() }
}

fn deleted(path: &str) -> LocalChange {
    LocalChange::Deleted {
        path: path.into(),
        item_type: ItemType::File,
    }
}

fn deleted_dir(path: &str) -> LocalChange {
    LocalChange::Deleted {
        path: path.into(),
        item_type: ItemType::Folder,
    }
}

fn remote_file(path: &str, rev: &str) -> RemoteChange {
    RemoteChange::File(FileMeta {
        path: path.into(),
        rev: rev.into(),
        content_hash: format!("h-{rev}"),
        server_modified_ms: 0,
    })
}

fn run_local(events: Vec<LocalChange>) -> Vec<LocalChange> {
    let resolver = resolver();
    let rules = ExcludeRules::permissive();
    normalize_local(events, &resolver, &rules, &no_index)
}

#[test]
fn created_then_modified_collapses_to_created() {
    let out = run_local(vec![created("/a.txt"), modified("/a.txt"), modified("/a.txt")]);
    assert_eq!(out, vec![created("/a.txt")]);
}

#[test]
fn created_then_deleted_is_a_noop() {
    let out = run_local(vec![created("/tmp.txt"), deleted("/tmp.txt")]);
    assert!(out.is_empty());
}

#[test]
fn deleted_then_created_same_type_is_modified() {
    let out = run_local(vec![deleted("/a.txt"), created("/a.txt")]);
    assert_eq!(out, vec![modified("/a.txt")]);
}

#[test]
fn type_change_keeps_delete_then_create() {
    let out = run_local(vec![deleted_dir("/x"), created("/x")]);
    assert_eq!(out, vec![deleted_dir("/x"), created("/x")]);
}

#[test]
fn move_survives_coalescing() {
    let mv = LocalChange::Moved {
        from: "/a.txt".into(),
        to: "/b.txt".into(),
        item_type: ItemType::File,
    };
    let out = run_local(vec![mv.clone()]);
    assert_eq!(out, vec![mv]);
}

#[test]
fn move_followed_by_modify_keeps_move_and_marks_modified() {
    let mv = LocalChange::Moved {
        from: "/a.txt".into(),
        to: "/b.txt".into(),
        item_type: ItemType::File,
    };
    let out = run_local(vec![mv.clone(), modified("/b.txt")]);
    assert_eq!(out, vec![mv, modified("/b.txt")]);
}

#[test]
fn move_with_other_destination_history_is_split() {
    let mv = LocalChange::Moved {
        from: "/a.txt".into(),
        to: "/b.txt".into(),
        item_type: ItemType::File,
    };
    // The destination was deleted afterwards: net effect is just the source
    // deletion.
    let out = run_local(vec![mv, deleted("/b.txt")]);
    assert_eq!(out, vec![deleted("/a.txt")]);
}

#[test]
fn folder_delete_prunes_child_events() {
    let out = run_local(vec![
        deleted("/p/a.txt"),
        deleted("/p/sub/b.txt"),
        deleted_dir("/p"),
    ]);
    assert_eq!(out, vec![deleted_dir("/p")]);
}

#[test]
fn folder_move_prunes_child_moves() {
    let dir_mv = LocalChange::Moved {
        from: "/a".into(),
        to: "/b".into(),
        item_type: ItemType::Folder,
    };
    let child_mv = LocalChange::Moved {
        from: "/a/x.txt".into(),
        to: "/b/x.txt".into(),
        item_type: ItemType::File,
    };
    let out = run_local(vec![dir_mv.clone(), child_mv]);
    assert_eq!(out, vec![dir_mv]);
}

#[test]
fn folder_move_prunes_plain_child_events_under_both_endpoints() {
    // Watcher backends that report a folder move as the move plus per-child
    // noise must not leak a deletion that would race the move remotely.
    let dir_mv = LocalChange::Moved {
        from: "/docs".into(),
        to: "/archive".into(),
        item_type: ItemType::Folder,
    };
    let out = run_local(vec![
        dir_mv.clone(),
        deleted("/docs/readme.txt"),
        modified("/archive/readme.txt"),
    ]);
    assert_eq!(out, vec![dir_mv]);
}

#[test]
fn deletion_type_is_fixed_from_index() {
    let resolver = resolver();
    let rules = ExcludeRules::permissive();
    let lookup = |key: &str| (key == "/p").then_some(ItemType::Folder);
    let out = normalize_local(vec![deleted("/p")], &resolver, &rules, &lookup);
    assert_eq!(out, vec![deleted_dir("/p")]);
}

#[test]
fn mignored_paths_are_dropped_locally() {
    let resolver = resolver();
    let matcher: super::super::exclude::MignoreMatcher =
        std::sync::Arc::new(|path: &str| path.ends_with(".o"));
    let rules = ExcludeRules::new(
        std::sync::Arc::new(super::super::exclude::NoSelectiveSync),
        Some(matcher),
    );
    let out = normalize_local(
        vec![created("/main.o"), created("/main.rs")],
        &resolver,
        &rules,
        &no_index,
    );
    assert_eq!(out, vec![created("/main.rs")]);
}

#[test]
fn local_order_deletes_deepest_first_then_folders_then_files() {
    let out = run_local(vec![
        created("/p/c.txt"),
        created_dir("/p"),
        deleted("/q/old/deep.txt"),
        deleted("/q/other.txt"),
        created_dir("/p/sub"),
    ]);
    assert_eq!(
        out,
        vec![
            deleted("/q/old/deep.txt"),
            deleted("/q/other.txt"),
            created_dir("/p"),
            created_dir("/p/sub"),
            created("/p/c.txt"),
        ]
    );
}

#[test]
fn remote_last_event_per_path_wins() {
    let resolver = resolver();
    let rules = ExcludeRules::permissive();
    let out = normalize_remote(
        vec![
            remote_file("/a.txt", "r1"),
            RemoteChange::Deleted { path: "/a.txt".into() },
            remote_file("/a.txt", "r2"),
        ],
        &resolver,
        &rules,
        &no_index,
    );
    assert_eq!(out, vec![remote_file("/a.txt", "r2")]);
}

#[test]
fn remote_type_flip_synthesizes_delete_first() {
    let resolver = resolver();
    let rules = ExcludeRules::permissive();
    let lookup = |key: &str| (key == "/x").then_some(ItemType::Folder);
    let out = normalize_remote(
        vec![remote_file("/x", "r1")],
        &resolver,
        &rules,
        &lookup,
    );
    assert_eq!(
        out,
        vec![
            RemoteChange::Deleted { path: "/x".into() },
            remote_file("/x", "r1"),
        ]
    );
}

#[test]
fn remote_excluded_roots_are_filtered() {
    struct Excluded;
    impl super::super::exclude::SelectiveSync for Excluded {
        fn is_excluded(&self, canonical_path: &str) -> bool {
            paths::is_equal_or_under(canonical_path, "/excluded")
        }
    }
    let resolver = resolver();
    let rules = ExcludeRules::new(std::sync::Arc::new(Excluded), None);
    let out = normalize_remote(
        vec![
            remote_file("/excluded/y.txt", "r1"),
            remote_file("/kept.txt", "r2"),
        ],
        &resolver,
        &rules,
        &no_index,
    );
    assert_eq!(out, vec![remote_file("/kept.txt", "r2")]);
}

#[test]
fn remote_order_deletes_deepest_first_then_folders_then_files() {
    let resolver = resolver();
    let rules = ExcludeRules::permissive();
    let out = normalize_remote(
        vec![
            remote_file("/p/a.txt", "r1"),
            RemoteChange::Deleted { path: "/q/deep/x".into() },
            RemoteChange::Folder { path: "/p".into() },
            RemoteChange::Deleted { path: "/q".into() },
        ],
        &resolver,
        &rules,
        &no_index,
    );
    assert_eq!(
        out,
        vec![
            RemoteChange::Deleted { path: "/q/deep/x".into() },
            RemoteChange::Deleted { path: "/q".into() },
            RemoteChange::Folder { path: "/p".into() },
            remote_file("/p/a.txt", "r1"),
        ]
    );
}

#[test]
fn coalescing_is_idempotent() {
    let input = vec![
        created("/a.txt"),
        modified("/a.txt"),
        deleted_dir("/x"),
        created("/x"),
    ];
    let once = run_local(input);
    let twice = run_local(once.clone());
    assert_eq!(once, twice);
}
