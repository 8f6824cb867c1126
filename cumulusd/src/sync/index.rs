use std::{fs, path::PathBuf};

use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Sentinel revision recorded for folders; files carry opaque server revs and
/// deleted / never-synced entries carry `None`.
pub const FOLDER_REV: &str = "folder";

pub const SCHEMA_VERSION: i64 = 1;

const CURSOR_KEY: &str = "__cursor__";
const SCHEMA_VERSION_KEY: &str = "__schema_version__";
const LAST_RECONCILE_KEY: &str = "__last_reconcile__";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Sqlx(sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("data directory is unavailable")]
    MissingDataDir,
    #[error("invalid item type: {0}")]
    InvalidItemType(String),
    #[error("index storage is corrupt: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for IndexError {
    fn from(err: sqlx::Error) -> Self {
        // Structural damage requires external recovery; everything else is
        // ordinary storage IO.
        if let sqlx::Error::Database(db) = &err {
            let message = db.message().to_ascii_lowercase();
            if message.contains("malformed") || message.contains("corrupt") {
                return IndexError::Corrupt(db.message().to_string());
            }
        }
        IndexError::Sqlx(err)
    }
}

impl IndexError {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, IndexError::Corrupt(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    File,
    Folder,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::File => "file",
            ItemType::Folder => "folder",
        }
    }

    pub fn parse(value: &str) -> Result<Self, IndexError> {
        match value {
            "file" => Ok(ItemType::File),
            "folder" => Ok(ItemType::Folder),
            other => Err(IndexError::InvalidItemType(other.to_string())),
        }
    }
}

/// Last-known-good sync state of one item, keyed by canonical path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Display path in remote space, case preserved.
    pub path: String,
    pub item_type: ItemType,
    /// `None` means deleted / never synced; folders carry [`FOLDER_REV`].
    pub rev: Option<String>,
    /// `None` for deleted entries; folders carry the `"folder"` sentinel.
    pub content_hash: Option<String>,
    pub last_sync_ms: i64,
}

impl IndexEntry {
    pub fn folder(path: &str, last_sync_ms: i64) -> Self {
        Self {
            path: path.to_string(),
            item_type: ItemType::Folder,
            rev: Some(FOLDER_REV.to_string()),
            content_hash: Some(super::hasher::FOLDER_HASH.to_string()),
            last_sync_ms,
        }
    }

    pub fn file(path: &str, rev: &str, content_hash: &str, last_sync_ms: i64) -> Self {
        Self {
            path: path.to_string(),
            item_type: ItemType::File,
            rev: Some(rev.to_string()),
            content_hash: Some(content_hash.to_string()),
            last_sync_ms,
        }
    }
}

/// One write grouped into an atomic [`IndexStore::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryMutation {
    Put { key: String, entry: IndexEntry },
    Delete { key: String },
}

pub struct IndexStore {
    pool: SqlitePool,
}

include!("index_store_impl.rs");

fn default_db_path() -> Result<PathBuf, IndexError> {
    let mut path = dirs::data_dir().ok_or(IndexError::MissingDataDir)?;
    path.push("cumulus");
    path.push("index.db");
    Ok(path)
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
