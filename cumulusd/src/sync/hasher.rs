use std::io::ErrorKind;
use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;

/// Sentinel content hash recorded for folders.
pub const FOLDER_HASH: &str = "folder";

/// Block size of the remote-compatible content hash.
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("file unreadable: {0}")]
    Unreadable(std::io::Error),
}

/// Result of hashing a local path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashOutcome {
    Hashed(String),
    Folder,
    /// The path disappeared while we were reading it. Upstream drops the
    /// originating event; reconciliation catches any residue.
    Vanished,
}

impl HashOutcome {
    pub fn as_hash(&self) -> Option<&str> {
        match self {
            HashOutcome::Hashed(hash) => Some(hash),
            HashOutcome::Folder => Some(FOLDER_HASH),
            HashOutcome::Vanished => None,
        }
    }
}

/// Incremental remote-compatible content hasher: SHA-256 per 4 MiB block,
/// concatenated digests hashed again, hex-encoded.
pub struct BlockHasher {
    overall: Sha256,
    block: Sha256,
    filled: usize,
}

impl BlockHasher {
    pub fn new() -> Self {
        Self {
            overall: Sha256::new(),
            block: Sha256::new(),
            filled: 0,
        }
    }

    pub fn consume(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let room = BLOCK_SIZE - self.filled;
            let take = room.min(data.len());
            self.block.update(&data[..take]);
            self.filled += take;
            data = &data[take..];
            if self.filled == BLOCK_SIZE {
                self.flush_block();
            }
        }
    }

    fn flush_block(&mut self) {
        let digest = std::mem::replace(&mut self.block, Sha256::new()).finalize();
        self.overall.update(digest);
        self.filled = 0;
    }

    pub fn finalize(mut self) -> String {
        if self.filled > 0 {
            self.flush_block();
        }
        hex::encode(self.overall.finalize())
    }
}

impl Default for BlockHasher {
    fn default() -> Self {
        Self::new()
    }
}

pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = BlockHasher::new();
    hasher.consume(data);
    hasher.finalize()
}

/// Hashes a local file with the remote-compatible block scheme. Directories
/// yield [`HashOutcome::Folder`]; a path that disappears mid-read yields
/// [`HashOutcome::Vanished`].
pub async fn hash_file(path: &Path) -> Result<HashOutcome, HashError> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(HashOutcome::Vanished),
        Err(err) => return Err(HashError::Unreadable(err)),
    };
    if meta.is_dir() {
        return Ok(HashOutcome::Folder);
    }

    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(HashOutcome::Vanished),
        Err(err) => return Err(HashError::Unreadable(err)),
    };

    let mut hasher = BlockHasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match file.read(&mut buf).await {
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(HashOutcome::Vanished),
            Err(err) => return Err(HashError::Unreadable(err)),
        };
        if n == 0 {
            break;
        }
        hasher.consume(&buf[..n]);
    }
    Ok(HashOutcome::Hashed(hasher.finalize()))
}
