impl IndexStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: &std::path::Path) -> Result<Self, IndexError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open_default() -> Result<Self, IndexError> {
        Self::open(&default_db_path()?).await
    }

    #[cfg(test)]
    pub async fn in_memory() -> Result<Self, IndexError> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), IndexError> {
        MIGRATOR.run(&self.pool).await?;
        let stored = self.get_meta(SCHEMA_VERSION_KEY).await?;
        match stored {
            None => {
                self.set_meta(SCHEMA_VERSION_KEY, &SCHEMA_VERSION.to_string())
                    .await?;
            }
            Some(value) => {
                // Unknown newer fields are ignored for forward compatibility,
                // but an unparseable version marker means structural damage.
                value
                    .parse::<i64>()
                    .map_err(|_| IndexError::Corrupt(format!("schema version `{value}`")))?;
            }
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<IndexEntry>, IndexError> {
        let row = sqlx::query(
            "SELECT path_display, item_type, rev, content_hash, last_sync_ms
             FROM entries WHERE path_key = ?1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(entry_from_row(&row)?))
    }

    pub async fn put(&self, key: &str, entry: &IndexEntry) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO entries (path_key, path_display, item_type, rev, content_hash, last_sync_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(path_key) DO UPDATE SET
                path_display = excluded.path_display,
                item_type = excluded.item_type,
                rev = excluded.rev,
                content_hash = excluded.content_hash,
                last_sync_ms = excluded.last_sync_ms",
        )
        .bind(key)
        .bind(&entry.path)
        .bind(entry.item_type.as_str())
        .bind(&entry.rev)
        .bind(&entry.content_hash)
        .bind(entry.last_sync_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM entries WHERE path_key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Entries at or under `key_prefix`, ordered by key.
    pub async fn iter_prefix(
        &self,
        key_prefix: &str,
    ) -> Result<Vec<(String, IndexEntry)>, IndexError> {
        let exact = key_prefix.trim_end_matches('/').to_string();
        let pattern = if exact.is_empty() {
            "/%".to_string()
        } else {
            format!("{exact}/%")
        };
        let rows = sqlx::query(
            "SELECT path_key, path_display, item_type, rev, content_hash, last_sync_ms
             FROM entries
             WHERE path_key = ?1 OR path_key LIKE ?2
             ORDER BY path_key ASC",
        )
        .bind(&exact)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("path_key")?;
            out.push((key, entry_from_row(&row)?));
        }
        Ok(out)
    }

    pub async fn count(&self) -> Result<i64, IndexError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    /// Applies a set of entry mutations and an optional cursor advance in one
    /// transaction, so a batch is never partially visible to a restart.
    pub async fn commit(
        &self,
        mutations: &[EntryMutation],
        cursor: Option<&str>,
    ) -> Result<(), IndexError> {
        let mut tx = self.pool.begin().await?;
        for mutation in mutations {
            match mutation {
                EntryMutation::Put { key, entry } => {
                    sqlx::query(
                        "INSERT INTO entries (path_key, path_display, item_type, rev, content_hash, last_sync_ms)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                         ON CONFLICT(path_key) DO UPDATE SET
                            path_display = excluded.path_display,
                            item_type = excluded.item_type,
                            rev = excluded.rev,
                            content_hash = excluded.content_hash,
                            last_sync_ms = excluded.last_sync_ms",
                    )
                    .bind(key)
                    .bind(&entry.path)
                    .bind(entry.item_type.as_str())
                    .bind(&entry.rev)
                    .bind(&entry.content_hash)
                    .bind(entry.last_sync_ms)
                    .execute(&mut *tx)
                    .await?;
                }
                EntryMutation::Delete { key } => {
                    sqlx::query("DELETE FROM entries WHERE path_key = ?1")
                        .bind(key)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        if let Some(cursor) = cursor {
            sqlx::query(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(CURSOR_KEY)
            .bind(cursor)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_cursor(&self) -> Result<Option<String>, IndexError> {
        self.get_meta(CURSOR_KEY).await
    }

    pub async fn set_cursor(&self, cursor: &str) -> Result<(), IndexError> {
        self.commit(&[], Some(cursor)).await
    }

    pub async fn clear_cursor(&self) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM meta WHERE key = ?1")
            .bind(CURSOR_KEY)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_last_reconcile_ms(&self) -> Result<Option<i64>, IndexError> {
        Ok(self
            .get_meta(LAST_RECONCILE_KEY)
            .await?
            .and_then(|value| value.parse().ok()))
    }

    pub async fn set_last_reconcile_ms(&self, stamp_ms: i64) -> Result<(), IndexError> {
        self.set_meta(LAST_RECONCILE_KEY, &stamp_ms.to_string())
            .await
    }

    /// Maintenance compaction.
    pub async fn compact(&self) -> Result<(), IndexError> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>, IndexError> {
        let row = sqlx::query("SELECT value FROM meta WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<IndexEntry, IndexError> {
    let item_type: String = row.try_get("item_type")?;
    Ok(IndexEntry {
        path: row.try_get("path_display")?,
        item_type: ItemType::parse(&item_type)?,
        rev: row.try_get("rev")?,
        content_hash: row.try_get("content_hash")?,
        last_sync_ms: row.try_get("last_sync_ms")?,
    })
}
