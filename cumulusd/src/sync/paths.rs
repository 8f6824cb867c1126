use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("remote path is empty")]
    Empty,
    #[error("remote path contains unsupported component")]
    UnsupportedComponent,
}

/// Maps between the local sync root and remote path space and produces the
/// canonical keys the index is addressed by.
///
/// Remote paths are POSIX-like (`/Docs/A.txt`). The remote store is
/// case-preserving but case-insensitive, so canonical keys are always
/// case-folded regardless of the local file system. Local case sensitivity
/// only matters for case-conflict detection on upload.
pub struct PathResolver {
    sync_root: PathBuf,
    case_sensitive_host: bool,
}

impl PathResolver {
    pub fn new(sync_root: PathBuf, case_sensitive_host: bool) -> Self {
        Self {
            sync_root,
            case_sensitive_host,
        }
    }

    pub fn sync_root(&self) -> &Path {
        &self.sync_root
    }

    pub fn case_sensitive_host(&self) -> bool {
        self.case_sensitive_host
    }

    /// Canonical index key for a remote path: NFC, forward slashes, no
    /// trailing slash, case-folded.
    pub fn canonical(&self, remote_path: &str) -> String {
        normalize_display(remote_path).to_lowercase()
    }

    /// Absolute local path for a remote path, refusing traversal components.
    pub fn local_path_for(&self, remote_path: &str) -> Result<PathBuf, PathError> {
        if remote_path.is_empty() {
            return Err(PathError::Empty);
        }

        let mut out = self.sync_root.clone();
        for component in Path::new(remote_path).components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::RootDir | Component::CurDir => continue,
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(PathError::UnsupportedComponent);
                }
            }
        }
        Ok(out)
    }

    /// Remote path for a local path under the sync root, or `None` if the
    /// path lies outside it.
    pub fn remote_path_for(&self, local: &Path) -> Option<String> {
        let relative = local.strip_prefix(&self.sync_root).ok()?;
        let joined = PathBuf::from("/").join(relative);
        Some(normalize_display(
            &joined.to_string_lossy().replace('\\', "/"),
        ))
    }
}

/// Display-form normalization: NFC, forward slashes, single leading slash,
/// no trailing slash. Case is preserved.
pub fn normalize_display(remote_path: &str) -> String {
    let nfc: String = remote_path.nfc().collect();
    let slashes = nfc.replace('\\', "/");
    let trimmed = slashes.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

pub fn equal_ignoring_case(a: &str, b: &str) -> bool {
    normalize_display(a).to_lowercase() == normalize_display(b).to_lowercase()
}

/// True when two paths collide under case folding without being identical,
/// which is what turns an upload into a case conflict.
pub fn differs_only_in_case(a: &str, b: &str) -> bool {
    equal_ignoring_case(a, b) && normalize_display(a) != normalize_display(b)
}

/// Number of path segments; `/` is depth 0, `/a` is 1, `/a/b` is 2.
pub fn depth(remote_path: &str) -> usize {
    let trimmed = remote_path.trim_matches('/');
    if trimmed.is_empty() {
        0
    } else {
        trimmed.split('/').count()
    }
}

pub fn parent_path(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    trimmed.rfind('/').map(|idx| {
        if idx == 0 {
            "/".to_string()
        } else {
            trimmed[..idx].to_string()
        }
    })
}

pub fn basename(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

/// True when `candidate` equals `root` or lies underneath it. Both sides must
/// already be canonical.
pub fn is_equal_or_under(candidate: &str, root: &str) -> bool {
    if candidate == root {
        return true;
    }
    let root = root.trim_end_matches('/');
    candidate.starts_with(root) && candidate.as_bytes().get(root.len()) == Some(&b'/')
}

/// Probes whether the file system at `root` treats names case-sensitively.
/// Creates and removes a hidden probe file.
pub fn probe_case_sensitivity(root: &Path) -> std::io::Result<bool> {
    let lower = root.join(".cumulus_case_probe");
    let upper = root.join(".CUMULUS_CASE_PROBE");
    std::fs::write(&lower, b"")?;
    let sensitive = !upper.exists();
    let _ = std::fs::remove_file(&lower);
    Ok(sensitive)
}
