impl SyncEngine {
    /// Applies one normalized local change to the remote store and the index.
    pub async fn apply_local_change(
        &self,
        change: &LocalChange,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        let path = change.path().to_string();
        match self.apply_local_change_inner(change, cancel).await {
            Ok(status) => TaskOutcome { path, status },
            Err(err) => {
                let (kind, transient, retry_after) = classify(&err);
                warn!(path = %path, error = %err, "upload task failed");
                TaskOutcome {
                    path,
                    status: TaskStatus::Failed {
                        kind,
                        message: err.to_string(),
                        transient,
                        retry_after,
                    },
                }
            }
        }
    }

    async fn apply_local_change_inner(
        &self,
        change: &LocalChange,
        cancel: &CancellationToken,
    ) -> Result<TaskStatus, EngineError> {
        let key = self.resolver.canonical(change.path());
        let entry = self.index.get(&key).await?;

        let local_hash = match change {
            LocalChange::Created {
                item_type: ItemType::File,
                ..
            }
            | LocalChange::Modified { .. } => {
                let local = self.resolver.local_path_for(change.path())?;
                match hasher::hash_file(&local).await? {
                    HashOutcome::Hashed(hash) => Some(hash),
                    HashOutcome::Folder => None,
                    // Gone before we could read it; reconciliation will pick
                    // up whatever replaced it.
                    HashOutcome::Vanished => return Ok(TaskStatus::Skipped),
                }
            }
            _ => None,
        };

        let probe = self.probe_remote(change, entry.as_ref(), &key).await?;
        let exists = self.local_exists_probe();
        let action =
            conflict::resolve_upload(change, entry.as_ref(), local_hash.as_deref(), &probe, &exists);
        debug!(path = %change.path(), action = ?action, "resolved upload");

        match action {
            SyncAction::Skip => Ok(TaskStatus::Skipped),
            SyncAction::Acknowledge => {
                if let Some(mut entry) = entry {
                    entry.last_sync_ms = now_ms();
                    self.index.put(&key, &entry).await?;
                }
                Ok(TaskStatus::Skipped)
            }
            SyncAction::RenameTarget { new_path } => {
                self.rename_local(change.path(), &new_path).await?;
                let renamed = match change {
                    LocalChange::Created { item_type, .. } => LocalChange::Created {
                        path: new_path.clone(),
                        item_type: *item_type,
                    },
                    LocalChange::Moved { item_type, from, .. } => LocalChange::Moved {
                        from: from.clone(),
                        to: new_path.clone(),
                        item_type: *item_type,
                    },
                    _ => LocalChange::Modified {
                        path: new_path.clone(),
                    },
                };
                self.execute_upload(&renamed, None, cancel).await?;
                Ok(TaskStatus::Renamed { new_path })
            }
            SyncAction::CreateConflictCopy { copy_path } => {
                // The remote item we are replacing has unseen changes; pull
                // its current content down as a conflict copy first.
                if let Some(remote_rev) = probe.remote_rev.as_deref() {
                    let copy_target = self.resolver.local_path_for(&copy_path)?;
                    let stream = self.remote.download(change.path(), remote_rev).await?;
                    transfer::stage_download(stream, &copy_target, None, cancel).await?;
                }
                // Replace against the rev we just preserved, not the stale
                // one the index remembers.
                let patched = entry.clone().map(|mut e| {
                    e.rev = probe.remote_rev.clone();
                    e
                });
                self.execute_upload(change, patched.as_ref(), cancel).await?;
                Ok(TaskStatus::ConflictCopied { copy_path })
            }
            SyncAction::Apply => self.execute_upload(change, entry.as_ref(), cancel).await,
        }
    }

    async fn execute_upload(
        &self,
        change: &LocalChange,
        entry: Option<&IndexEntry>,
        _cancel: &CancellationToken,
    ) -> Result<TaskStatus, EngineError> {
        let key = self.resolver.canonical(change.path());
        let if_match = entry.and_then(|e| e.rev.as_deref());

        match change {
            LocalChange::Created {
                path,
                item_type: ItemType::Folder,
            } => {
                match self.remote.create_folder(path).await {
                    Ok(()) => {}
                    // The folder already existing remotely is convergence.
                    Err(RemoteError::Conflict { .. }) => {}
                    Err(err) => return Err(err.into()),
                }
                self.index
                    .put(&key, &IndexEntry::folder(path, now_ms()))
                    .await?;
                Ok(TaskStatus::Applied)
            }
            LocalChange::Created { path, .. } | LocalChange::Modified { path } => {
                let local = self.resolver.local_path_for(path)?;
                let (stream, _len) = match transfer::upload_stream(&local).await {
                    Ok(pair) => pair,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        return Ok(TaskStatus::Skipped);
                    }
                    Err(err) => return Err(err.into()),
                };
                match self.remote.upload(path, stream, if_match).await {
                    Ok(meta) => {
                        self.index
                            .put(
                                &key,
                                &IndexEntry::file(&meta.path, &meta.rev, &meta.content_hash, now_ms()),
                            )
                            .await?;
                        Ok(TaskStatus::Applied)
                    }
                    Err(RemoteError::Conflict { .. }) => {
                        // The server kept our body as a conflict copy; the
                        // next remote-change cycle records both sides.
                        debug!(path = %path, "upload rejected on rev mismatch, deferring to remote copy");
                        Ok(TaskStatus::Skipped)
                    }
                    Err(err) => Err(err.into()),
                }
            }
            LocalChange::Deleted { path, .. } => {
                match self.remote.delete(path, if_match).await {
                    Ok(()) => {}
                    // Deleting something already gone is success.
                    Err(RemoteError::NotFound) => {}
                    Err(err) => return Err(err.into()),
                }
                let residue: Vec<EntryMutation> = self
                    .index
                    .iter_prefix(&key)
                    .await?
                    .into_iter()
                    .map(|(child_key, _)| EntryMutation::Delete { key: child_key })
                    .collect();
                self.index.commit(&residue, None).await?;
                Ok(TaskStatus::Applied)
            }
            LocalChange::Moved {
                from,
                to,
                item_type,
            } => {
                let from_key = self.resolver.canonical(from);
                let from_entry = self.index.get(&from_key).await?;
                let from_rev = from_entry.as_ref().and_then(|e| e.rev.as_deref());
                match self.remote.move_item(from, to, from_rev).await {
                    Ok(()) => {
                        let mut mutations = vec![EntryMutation::Delete {
                            key: from_key.clone(),
                        }];
                        let moved_entry = match from_entry {
                            Some(mut entry) => {
                                entry.path = to.clone();
                                entry.last_sync_ms = now_ms();
                                entry
                            }
                            None => match item_type {
                                ItemType::Folder => IndexEntry::folder(to, now_ms()),
                                ItemType::File => IndexEntry {
                                    path: to.clone(),
                                    item_type: ItemType::File,
                                    rev: None,
                                    content_hash: None,
                                    last_sync_ms: now_ms(),
                                },
                            },
                        };
                        mutations.push(EntryMutation::Put {
                            key,
                            entry: moved_entry,
                        });
                        self.index.commit(&mutations, None).await?;
                        Ok(TaskStatus::Applied)
                    }
                    Err(RemoteError::NotFound) => {
                        // The source never made it remotely; treat the move
                        // destination as a fresh creation.
                        let created = LocalChange::Created {
                            path: to.clone(),
                            item_type: *item_type,
                        };
                        self.index.delete(&from_key).await?;
                        Box::pin(self.execute_upload(&created, None, _cancel)).await
                    }
                    Err(RemoteError::Conflict { .. }) => Ok(TaskStatus::Skipped),
                    Err(err) => Err(err.into()),
                }
            }
        }
    }

    /// Remote-side facts for the upload resolver. Network is only touched
    /// when the change looks like a type change, where the live rev decides
    /// whether remote content must be preserved first.
    async fn probe_remote(
        &self,
        change: &LocalChange,
        entry: Option<&IndexEntry>,
        key: &str,
    ) -> Result<RemoteProbe, EngineError> {
        let selective_sync_excluded = self.rules.is_excluded_by_user(key);

        let case_colliding_path = if self.resolver.case_sensitive_host() {
            entry
                .filter(|e| e.rev.is_some())
                .filter(|e| super::paths::differs_only_in_case(&e.path, change.path()))
                .map(|e| e.path.clone())
        } else {
            None
        };

        let type_change_candidate = entry
            .map(|e| e.rev.is_some() && e.item_type != change.item_type())
            .unwrap_or(false);
        let remote_rev = if type_change_candidate {
            self.live_remote_rev(change.path()).await?
        } else {
            entry.and_then(|e| e.rev.clone())
        };

        Ok(RemoteProbe {
            selective_sync_excluded,
            case_colliding_path,
            remote_rev,
        })
    }

    /// Re-reads the parent directory listing to learn the current remote rev
    /// of `path`, if it exists.
    async fn live_remote_rev(&self, path: &str) -> Result<Option<String>, EngineError> {
        let parent = super::paths::parent_path(path).unwrap_or_else(|| "/".to_string());
        let listing = match self.remote.list_folder(&parent).await {
            Ok(listing) => listing,
            Err(RemoteError::NotFound) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let key = self.resolver.canonical(path);
        for item in listing {
            if self.resolver.canonical(item.path()) == key {
                return Ok(match item {
                    RemoteChange::File(meta) => Some(meta.rev),
                    RemoteChange::Folder { .. } => {
                        Some(super::index::FOLDER_REV.to_string())
                    }
                    RemoteChange::Deleted { .. } => None,
                });
            }
        }
        Ok(None)
    }

    async fn rename_local(&self, from: &str, to: &str) -> Result<(), EngineError> {
        let source = self.resolver.local_path_for(from)?;
        let target = self.resolver.local_path_for(to)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::rename(&source, &target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
