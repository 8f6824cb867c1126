impl SyncEngine {
    /// Applies one normalized remote change to the local tree and the index.
    pub async fn apply_remote_change(
        &self,
        change: &RemoteChange,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        let path = change.path().to_string();
        match self.apply_remote_change_inner(change, cancel).await {
            Ok(status) => TaskOutcome { path, status },
            Err(err) => {
                let (kind, transient, retry_after) = classify(&err);
                warn!(path = %path, error = %err, "download task failed");
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

    async fn apply_remote_change_inner(
        &self,
        change: &RemoteChange,
        cancel: &CancellationToken,
    ) -> Result<TaskStatus, EngineError> {
        let key = self.resolver.canonical(change.path());
        let entry = self.index.get(&key).await?;
        let local = self.local_disk_state(change.path()).await?;
        let exists = self.local_exists_probe();

        let action = conflict::resolve_download(change, entry.as_ref(), &local, &exists);
        debug!(path = %change.path(), action = ?action, "resolved download");

        match action {
            SyncAction::Skip => Ok(TaskStatus::Skipped),
            SyncAction::Acknowledge => {
                let RemoteChange::File(meta) = change else {
                    return Ok(TaskStatus::Skipped);
                };
                self.index
                    .put(
                        &key,
                        &IndexEntry::file(&meta.path, &meta.rev, &meta.content_hash, now_ms()),
                    )
                    .await?;
                Ok(TaskStatus::Skipped)
            }
            SyncAction::Apply => self.execute_download(change, &key, &local, cancel).await,
            SyncAction::CreateConflictCopy { copy_path } => {
                self.preserve_local_as_copy(change.path(), &copy_path).await?;
                match change {
                    RemoteChange::Deleted { .. } => {
                        self.index.delete(&key).await?;
                        Ok(TaskStatus::ConflictCopied { copy_path })
                    }
                    _ => {
                        self.execute_download(change, &key, &LocalDiskState::absent(), cancel)
                            .await?;
                        Ok(TaskStatus::ConflictCopied { copy_path })
                    }
                }
            }
            // The download resolver never renames the target.
            SyncAction::RenameTarget { .. } => Ok(TaskStatus::Skipped),
        }
    }

    async fn execute_download(
        &self,
        change: &RemoteChange,
        key: &str,
        local: &LocalDiskState,
        cancel: &CancellationToken,
    ) -> Result<TaskStatus, EngineError> {
        match change {
            RemoteChange::Deleted { path } => {
                let target = self.resolver.local_path_for(path)?;
                match local.item_type {
                    Some(ItemType::Folder) => match tokio::fs::remove_dir_all(&target).await {
                        Ok(()) => {}
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => return Err(err.into()),
                    },
                    _ => match tokio::fs::remove_file(&target).await {
                        Ok(()) => {}
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => return Err(err.into()),
                    },
                }
                // Children were deleted first by the batch order; drop any
                // index residue under this key as well.
                let residue: Vec<EntryMutation> = self
                    .index
                    .iter_prefix(key)
                    .await?
                    .into_iter()
                    .map(|(child_key, _)| EntryMutation::Delete { key: child_key })
                    .collect();
                self.index.commit(&residue, None).await?;
                Ok(TaskStatus::Applied)
            }
            RemoteChange::Folder { path } => {
                let target = self.resolver.local_path_for(path)?;
                // A file in the way means a remote type change; normalization
                // put the delete first, but stale leftovers still lose.
                if let Ok(meta) = tokio::fs::metadata(&target).await
                    && meta.is_file()
                {
                    tokio::fs::remove_file(&target).await?;
                }
                tokio::fs::create_dir_all(&target).await?;
                self.index
                    .put(key, &IndexEntry::folder(path, now_ms()))
                    .await?;
                Ok(TaskStatus::Applied)
            }
            RemoteChange::File(meta) => {
                let target = self.resolver.local_path_for(&meta.path)?;
                let stream = self.remote.download(&meta.path, &meta.rev).await?;
                transfer::stage_download(stream, &target, Some(&meta.content_hash), cancel).await?;
                self.index
                    .put(
                        key,
                        &IndexEntry::file(&meta.path, &meta.rev, &meta.content_hash, now_ms()),
                    )
                    .await?;
                Ok(TaskStatus::Applied)
            }
        }
    }

    /// Renames the local item aside so a conflicting download or deletion
    /// cannot destroy unsynced edits. A vanished source is fine.
    async fn preserve_local_as_copy(
        &self,
        remote_path: &str,
        copy_path: &str,
    ) -> Result<(), EngineError> {
        let source = self.resolver.local_path_for(remote_path)?;
        let target = self.resolver.local_path_for(copy_path)?;
        match tokio::fs::rename(&source, &target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
