use std::collections::HashMap;

use cumulus_remote::RemoteChange;

use super::exclude::ExcludeRules;
use super::fs_events::LocalChange;
use super::index::ItemType;
use super::paths::{self, PathResolver};

/// Callback resolving the live item type recorded in the index for a
/// canonical path. Entries with a null rev must yield `None`.
pub type IndexTypeLookup<'a> = &'a dyn Fn(&str) -> Option<ItemType>;

/// Normalizes a debounced batch of local changes: exclusion filtering,
/// per-path coalescing to the net effect, move recombination, parent pruning
/// and hierarchical ordering.
pub fn normalize_local(
    events: Vec<LocalChange>,
    resolver: &PathResolver,
    rules: &ExcludeRules,
    known_type: IndexTypeLookup,
) -> Vec<LocalChange> {
    let mut work = Vec::new();
    let mut next_move_id = 0usize;

    for event in events {
        match event {
            LocalChange::Moved {
                from,
                to,
                item_type,
            } => {
                let from_drop = rules.drop_local(&resolver.canonical(&from), item_type == ItemType::Folder);
                let to_drop = rules.drop_local(&resolver.canonical(&to), item_type == ItemType::Folder);
                // A move straddling an exclusion boundary stays split.
                match (from_drop, to_drop) {
                    (true, true) => continue,
                    (true, false) => work.push(Work::new(to, Prim::Created(item_type), None)),
                    (false, true) => work.push(Work::new(from, Prim::Deleted(item_type), None)),
                    (false, false) => {
                        let id = Some(next_move_id);
                        next_move_id += 1;
                        work.push(Work::new(from, Prim::Deleted(item_type), id));
                        work.push(Work::new(to, Prim::Created(item_type), id));
                    }
                }
            }
            LocalChange::Created { path, item_type } => {
                if !rules.drop_local(&resolver.canonical(&path), item_type == ItemType::Folder) {
                    work.push(Work::new(path, Prim::Created(item_type), None));
                }
            }
            LocalChange::Deleted { path, item_type } => {
                if !rules.drop_local(&resolver.canonical(&path), item_type == ItemType::Folder) {
                    work.push(Work::new(path, Prim::Deleted(item_type), None));
                }
            }
            LocalChange::Modified { path } => {
                if !rules.drop_local(&resolver.canonical(&path), false) {
                    work.push(Work::new(path, Prim::Modified, None));
                }
            }
        }
    }

    // Per-path histories, in arrival order.
    let mut order = Vec::new();
    let mut histories: HashMap<String, Vec<Work>> = HashMap::new();
    for item in work {
        let key = resolver.canonical(&item.path);
        if !histories.contains_key(&key) {
            order.push(key.clone());
        }
        histories.entry(key).or_default().push(item);
    }

    let mut survivors = Vec::new();
    for key in order {
        let history = histories.remove(&key).expect("bucketed above");
        coalesce_path_history(history, &mut survivors);
    }

    // Fix deletion types from the index; watcher backends rarely know what a
    // removed path used to be.
    for item in &mut survivors {
        if let Prim::Deleted(item_type) = &mut item.prim
            && let Some(known) = known_type(&resolver.canonical(&item.path))
        {
            *item_type = known;
        }
    }

    let recombined = recombine_moves(survivors);
    let pruned = prune_children(recombined, resolver);
    sort_local(pruned)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Prim {
    Created(ItemType),
    Deleted(ItemType),
    Modified,
}

#[derive(Debug, Clone)]
struct Work {
    path: String,
    prim: Prim,
    move_id: Option<usize>,
    /// Coalesced-in content change riding on a surviving move half.
    modified: bool,
}

impl Work {
    fn new(path: String, prim: Prim, move_id: Option<usize>) -> Self {
        Self {
            path,
            prim,
            move_id,
            modified: false,
        }
    }
}

/// Collapses one path's history to its net effect. Mirrors the arithmetic of
/// counting creations against deletions: a surplus of creations means the
/// item exists, a surplus of deletions means it is gone, a balance means it
/// was modified, replaced with a different type, or purely transient.
fn coalesce_path_history(history: Vec<Work>, out: &mut Vec<Work>) {
    if history.len() == 1 {
        out.extend(history);
        return;
    }

    let path = history.last().expect("non-empty").path.clone();
    let n_created = history
        .iter()
        .filter(|w| matches!(w.prim, Prim::Created(_)))
        .count();
    let n_deleted = history
        .iter()
        .filter(|w| matches!(w.prim, Prim::Deleted(_)))
        .count();

    if n_created > n_deleted {
        let last_type = last_event_type(&history);
        // A move destination that only accumulated content changes survives
        // as the move plus a modification marker.
        let move_id = single_created_move_id(&history);
        let mut work = Work::new(path, Prim::Created(last_type), move_id);
        work.modified = move_id.is_some()
            && history
                .iter()
                .any(|w| matches!(w.prim, Prim::Modified));
        out.push(work);
        return;
    }

    if n_created < n_deleted {
        let first_type = first_event_type(&history);
        out.push(Work::new(path, Prim::Deleted(first_type), None));
        return;
    }

    if n_created == 0 {
        out.push(Work::new(path, Prim::Modified, None));
        return;
    }

    let first_created = history
        .iter()
        .position(|w| matches!(w.prim, Prim::Created(_)))
        .expect("counted above");
    let first_deleted = history
        .iter()
        .position(|w| matches!(w.prim, Prim::Deleted(_)))
        .expect("counted above");

    if first_deleted < first_created {
        // Replaced in place: same type is a modification, a different type
        // keeps delete-then-create so downstream sees the type change.
        let old_type = first_event_type(&history);
        let new_type = last_event_type(&history);
        if old_type == new_type {
            if old_type == ItemType::File {
                out.push(Work::new(path, Prim::Modified, None));
            }
            // A folder replaced by a folder is a no-op for sync purposes.
        } else {
            out.push(Work::new(path.clone(), Prim::Deleted(old_type), None));
            out.push(Work::new(path, Prim::Created(new_type), None));
        }
    }
    // Created before deleted: the item was only temporary.
}

fn first_event_type(history: &[Work]) -> ItemType {
    history
        .iter()
        .find_map(|w| match w.prim {
            Prim::Created(t) | Prim::Deleted(t) => Some(t),
            Prim::Modified => None,
        })
        .unwrap_or(ItemType::File)
}

fn last_event_type(history: &[Work]) -> ItemType {
    history
        .iter()
        .rev()
        .find_map(|w| match w.prim {
            Prim::Created(t) | Prim::Deleted(t) => Some(t),
            Prim::Modified => None,
        })
        .unwrap_or(ItemType::File)
}

/// The move id carried by the bucket's single creation, provided every other
/// event in the bucket is a plain modification.
fn single_created_move_id(history: &[Work]) -> Option<usize> {
    let mut id = None;
    for work in history {
        match work.prim {
            Prim::Created(_) => {
                if id.is_some() {
                    return None;
                }
                id = work.move_id;
                if id.is_none() {
                    return None;
                }
            }
            Prim::Modified => {}
            Prim::Deleted(_) => return None,
        }
    }
    id
}

struct CompleteMove {
    from: String,
    to: String,
    item_type: ItemType,
    modified: bool,
}

/// Rejoins surviving move halves into `Moved` records; orphaned halves stay
/// as plain creations or deletions.
fn recombine_moves(survivors: Vec<Work>) -> Vec<LocalChange> {
    let mut halves: HashMap<usize, Vec<&Work>> = HashMap::new();
    for work in &survivors {
        if let Some(id) = work.move_id {
            halves.entry(id).or_default().push(work);
        }
    }

    let mut complete: HashMap<usize, CompleteMove> = HashMap::new();
    for (id, parts) in &halves {
        if parts.len() != 2 {
            continue;
        }
        let deleted = parts.iter().find(|w| matches!(w.prim, Prim::Deleted(_)));
        let created = parts.iter().find(|w| matches!(w.prim, Prim::Created(_)));
        if let (Some(deleted), Some(created)) = (deleted, created) {
            let item_type = match created.prim {
                Prim::Created(t) => t,
                _ => ItemType::File,
            };
            complete.insert(
                *id,
                CompleteMove {
                    from: deleted.path.clone(),
                    to: created.path.clone(),
                    item_type,
                    modified: created.modified,
                },
            );
        }
    }

    let mut out = Vec::new();
    let mut emitted: std::collections::HashSet<usize> = std::collections::HashSet::new();
    for work in survivors {
        match work.move_id {
            Some(id) if complete.contains_key(&id) => {
                if emitted.insert(id) {
                    let mv = &complete[&id];
                    out.push(LocalChange::Moved {
                        from: mv.from.clone(),
                        to: mv.to.clone(),
                        item_type: mv.item_type,
                    });
                    if mv.modified {
                        out.push(LocalChange::Modified {
                            path: mv.to.clone(),
                        });
                    }
                }
            }
            _ => out.push(match work.prim {
                Prim::Created(item_type) => LocalChange::Created {
                    path: work.path,
                    item_type,
                },
                Prim::Deleted(item_type) => LocalChange::Deleted {
                    path: work.path,
                    item_type,
                },
                Prim::Modified => LocalChange::Modified { path: work.path },
            }),
        }
    }
    out
}

/// Folder deletions and folder moves subsume events under them.
fn prune_children(changes: Vec<LocalChange>, resolver: &PathResolver) -> Vec<LocalChange> {
    let deleted_dirs: Vec<String> = changes
        .iter()
        .filter_map(|c| match c {
            LocalChange::Deleted {
                path,
                item_type: ItemType::Folder,
            } => Some(resolver.canonical(path)),
            _ => None,
        })
        .collect();
    let moved_dirs: Vec<(String, String)> = changes
        .iter()
        .filter_map(|c| match c {
            LocalChange::Moved {
                from,
                to,
                item_type: ItemType::Folder,
            } => Some((resolver.canonical(from), resolver.canonical(to))),
            _ => None,
        })
        .collect();

    changes
        .into_iter()
        .filter(|change| {
            let under_deleted_dir = |canon: &str| {
                deleted_dirs
                    .iter()
                    .any(|dir| canon != dir.as_str() && paths::is_equal_or_under(canon, dir))
            };
            // Either endpoint of a folder move subsumes the events the move
            // itself generated underneath it.
            let under_moved_dir = |canon: &str| {
                moved_dirs.iter().any(|(dir_from, dir_to)| {
                    (canon != dir_from.as_str() && paths::is_equal_or_under(canon, dir_from))
                        || (canon != dir_to.as_str() && paths::is_equal_or_under(canon, dir_to))
                })
            };
            match change {
                LocalChange::Moved { from, to, .. } => {
                    let from_canon = resolver.canonical(from);
                    let to_canon = resolver.canonical(to);
                    !moved_dirs.iter().any(|(dir_from, dir_to)| {
                        from_canon != *dir_from
                            && paths::is_equal_or_under(&from_canon, dir_from)
                            && paths::is_equal_or_under(&to_canon, dir_to)
                    })
                }
                LocalChange::Deleted { path, .. } | LocalChange::Modified { path } => {
                    let canon = resolver.canonical(path);
                    !under_deleted_dir(&canon) && !under_moved_dir(&canon)
                }
                LocalChange::Created { .. } => true,
            }
        })
        .collect()
}

fn sort_local(mut changes: Vec<LocalChange>) -> Vec<LocalChange> {
    changes.sort_by_key(|change| {
        let (rank, depth) = match change {
            LocalChange::Deleted { .. } => (0u8, -(change.depth() as i64)),
            LocalChange::Created {
                item_type: ItemType::Folder,
                ..
            }
            | LocalChange::Moved {
                item_type: ItemType::Folder,
                ..
            } => (1, change.depth() as i64),
            _ => (2, change.depth() as i64),
        };
        (rank, depth, change.path().to_string())
    });
    changes
}

/// Normalizes a page of remote changes: exclusion filtering, per-path
/// last-event-wins coalescing, type-change synthesis against the index, and
/// hierarchical ordering.
pub fn normalize_remote(
    changes: Vec<RemoteChange>,
    resolver: &PathResolver,
    rules: &ExcludeRules,
    index_type: IndexTypeLookup,
) -> Vec<RemoteChange> {
    // The server guarantees that applying events in order reproduces its
    // state, so one surviving event per path is the last one.
    let mut order = Vec::new();
    let mut last: HashMap<String, RemoteChange> = HashMap::new();
    for change in changes {
        let key = resolver.canonical(change.path());
        if rules.drop_remote(&key) {
            continue;
        }
        if !last.contains_key(&key) {
            order.push(key.clone());
        }
        last.insert(key, change);
    }

    let mut out = Vec::new();
    for key in order {
        let change = last.remove(&key).expect("bucketed above");
        let indexed = index_type(&key);
        let type_flip = match (&change, indexed) {
            (RemoteChange::File(_), Some(ItemType::Folder)) => true,
            (RemoteChange::Folder { .. }, Some(ItemType::File)) => true,
            _ => false,
        };
        if type_flip {
            out.push(RemoteChange::Deleted {
                path: change.path().to_string(),
            });
        }
        out.push(change);
    }

    sort_remote(out)
}

fn sort_remote(mut changes: Vec<RemoteChange>) -> Vec<RemoteChange> {
    changes.sort_by_key(|change| {
        let depth = paths::depth(change.path()) as i64;
        let (rank, depth) = match change {
            RemoteChange::Deleted { .. } => (0u8, -depth),
            RemoteChange::Folder { .. } => (1, depth),
            RemoteChange::File(_) => (2, depth),
        };
        (rank, depth, change.path().to_string())
    });
    changes
}

#[cfg(test)]
#[path = "normalize_tests.rs"]
mod tests;
