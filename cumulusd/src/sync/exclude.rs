use std::sync::Arc;

use super::paths;

/// Staging suffix used for partially downloaded files.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Basename of the engine's own cache directory inside the sync root.
pub const CACHE_DIR_NAME: &str = ".cumulus.cache";

/// Basenames that are never synced in either direction, mirroring the file
/// names the remote service itself refuses to store.
const EXCLUDED_NAMES: &[&str] = &[
    ".ds_store",
    "desktop.ini",
    "thumbs.db",
    "icon\r",
    CACHE_DIR_NAME,
];

/// Selective-sync preference store, queried with canonical remote paths.
/// Excluded roots are not materialized locally and local changes under them
/// are not uploaded as-is.
pub trait SelectiveSync: Send + Sync {
    fn is_excluded(&self, canonical_path: &str) -> bool;
}

/// Default preference store with nothing excluded.
pub struct NoSelectiveSync;

impl SelectiveSync for NoSelectiveSync {
    fn is_excluded(&self, _canonical_path: &str) -> bool {
        false
    }
}

/// User-supplied upload exclusion patterns, pre-compiled by the host into a
/// plain predicate over canonical remote paths.
pub type MignoreMatcher = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// The exclusion rules every change passes through before it reaches the
/// normalizer. Hard-coded names apply to both directions; mignore applies to
/// uploads only; selective sync applies to both.
pub struct ExcludeRules {
    selective: Arc<dyn SelectiveSync>,
    mignore: Option<MignoreMatcher>,
}

impl ExcludeRules {
    pub fn new(selective: Arc<dyn SelectiveSync>, mignore: Option<MignoreMatcher>) -> Self {
        Self { selective, mignore }
    }

    pub fn permissive() -> Self {
        Self::new(Arc::new(NoSelectiveSync), None)
    }

    /// Hard-coded exclusions: system litter files, temporary and lock files,
    /// our own staging and cache artifacts, and the root itself.
    pub fn is_always_excluded(path: &str) -> bool {
        let lower = path.to_lowercase().replace('\\', "/");
        if lower.is_empty() || lower == "/" {
            return true;
        }

        let name = paths::basename(&lower);
        if EXCLUDED_NAMES.contains(&name) {
            return true;
        }
        if lower
            .split('/')
            .any(|component| component == CACHE_DIR_NAME)
        {
            return true;
        }

        // Office and editor temp names, lock files, our download staging.
        name.starts_with("~$")
            || name.starts_with(".~")
            || (name.starts_with('~') && name.ends_with(".tmp"))
            || name.starts_with(".#")
            || name.ends_with(".lock")
            || name.ends_with(PARTIAL_SUFFIX)
    }

    pub fn is_excluded_by_user(&self, canonical_path: &str) -> bool {
        self.selective.is_excluded(canonical_path)
    }

    pub fn is_mignored(&self, canonical_path: &str, is_dir: bool) -> bool {
        let Some(matcher) = &self.mignore else {
            return false;
        };
        let mut probe = canonical_path.to_string();
        if is_dir && !probe.ends_with('/') {
            probe.push('/');
        }
        matcher(&probe)
    }

    /// Whether a local change should be dropped before upload normalization.
    pub fn drop_local(&self, canonical_path: &str, is_dir: bool) -> bool {
        Self::is_always_excluded(canonical_path) || self.is_mignored(canonical_path, is_dir)
    }

    /// Whether a remote change should be dropped before download
    /// normalization.
    pub fn drop_remote(&self, canonical_path: &str) -> bool {
        Self::is_always_excluded(canonical_path) || self.is_excluded_by_user(canonical_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ExcludedRoots(Vec<String>);

    impl SelectiveSync for ExcludedRoots {
        fn is_excluded(&self, canonical_path: &str) -> bool {
            self.0
                .iter()
                .any(|root| paths::is_equal_or_under(canonical_path, root))
        }
    }

    #[test]
    fn hard_coded_names_are_excluded() {
        assert!(ExcludeRules::is_always_excluded("/Docs/.DS_Store"));
        assert!(ExcludeRules::is_always_excluded("/desktop.ini"));
        assert!(ExcludeRules::is_always_excluded("/a/~$report.docx"));
        assert!(ExcludeRules::is_always_excluded("/a/.~lock.ods"));
        assert!(ExcludeRules::is_always_excluded("/a/~x.tmp"));
        assert!(ExcludeRules::is_always_excluded("/a/b.txt.partial"));
        assert!(ExcludeRules::is_always_excluded("/.cumulus.cache/x"));
        assert!(ExcludeRules::is_always_excluded("/"));
        assert!(!ExcludeRules::is_always_excluded("/Docs/report.docx"));
    }

    #[test]
    fn selective_sync_excludes_subtrees() {
        let rules = ExcludeRules::new(
            Arc::new(ExcludedRoots(vec!["/excluded".to_string()])),
            None,
        );
        assert!(rules.drop_remote("/excluded/y.txt"));
        assert!(rules.drop_remote("/excluded"));
        assert!(!rules.drop_remote("/kept/y.txt"));
    }

    #[test]
    fn mignore_applies_to_uploads_with_dir_suffix() {
        let matcher: MignoreMatcher = Arc::new(|path: &str| path.ends_with(".o") || path == "/build/");
        let rules = ExcludeRules::new(Arc::new(NoSelectiveSync), Some(matcher));
        assert!(rules.drop_local("/src/main.o", false));
        assert!(rules.drop_local("/build", true));
        assert!(!rules.drop_local("/src/main.rs", false));
        // mignore does not affect the download direction
        assert!(!rules.drop_remote("/src/main.o"));
    }
}
