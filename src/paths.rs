//! Cache-directory layout and well-known metadata filenames.

use std::cell::RefCell;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Repository metadata file, relative to the working-copy root.
pub const REPO_META_FILE: &str = ".strata/repository.json";

/// Dataset metadata file, relative to the dataset root.
pub const DATASET_META_FILE: &str = ".dataset.json";

/// Base directory for disposable data (index databases).
///
/// Uses `STRATA_CACHE_DIR` if set, otherwise `$XDG_CACHE_HOME/strata` or
/// `~/.cache/strata`.
pub(crate) fn cache_dir() -> PathBuf {
    if let Some(dir) = thread_local_cache_dir_override() {
        return dir;
    }

    if let Ok(dir) = std::env::var("STRATA_CACHE_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_CACHE_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".cache")
        })
        .join("strata")
}

/// Root directory for all index databases.
pub fn indexes_dir() -> PathBuf {
    cache_dir().join("indexes")
}

/// Index database path for one dataset.
///
/// Keyed by a hash of `(workdir, dataset root)` so the cache survives
/// re-opens but never collides across working copies. The database is
/// disposable: deleting it only forces a rebuild from the working copy.
pub fn index_db_path(workdir: &Path, dataset_root: &str) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(workdir.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    hasher.update(dataset_root.as_bytes());
    let digest = hasher.finalize();
    indexes_dir()
        .join(&hex::encode(digest)[..16])
        .join("index.redb")
}

thread_local! {
    static CACHE_DIR_OVERRIDE: RefCell<Option<PathBuf>> = const { RefCell::new(None) };
}

fn thread_local_cache_dir_override() -> Option<PathBuf> {
    CACHE_DIR_OVERRIDE.with(|cell| cell.borrow().clone())
}

/// Scoped override of the cache directory, for tests.
#[doc(hidden)]
pub struct CacheDirOverride {
    prev: Option<PathBuf>,
}

impl CacheDirOverride {
    pub fn new(path: Option<PathBuf>) -> Self {
        let prev = CACHE_DIR_OVERRIDE.with(|cell| cell.replace(path));
        Self { prev }
    }
}

impl Drop for CacheDirOverride {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CACHE_DIR_OVERRIDE.with(|cell| {
            cell.replace(prev);
        });
    }
}

#[doc(hidden)]
pub fn override_cache_dir_for_tests(path: Option<PathBuf>) -> CacheDirOverride {
    CacheDirOverride::new(path)
}
