//! Default index build: the counting and indexing phases.

use std::collections::BTreeSet;

use git2::Repository;
use tracing::debug;

use super::progress::ThrottledProgress;
use super::store::{DefaultEntry, IndexStore};
use super::{IndexError, IndexProgress};
use crate::buffer::{self, BufferError};
use crate::marshal::{self, SerDesRegistry};

/// Build (or refresh) the default index for a dataset.
///
/// Counting phase: walk the working tree under the dataset root, project
/// every buffer path to its object path, and record a pending sentinel for
/// each unseen object. Indexing phase: deserialize every pending entry
/// cold and store the real value, or drop the entry when the object no
/// longer resolves to data.
///
/// Idempotent: re-running on a fully indexed dataset changes nothing.
/// Returns the settled object count.
pub fn build_default_index(
    repo: &Repository,
    dataset_root: &str,
    registry: &SerDesRegistry,
    store: &IndexStore,
    progress: &mut ThrottledProgress,
) -> Result<usize, IndexError> {
    let workdir = repo
        .workdir()
        .ok_or_else(|| BufferError::InvalidPath("bare repository".into()))?;

    // Counting phase.
    let mut seen = BTreeSet::new();
    for path in buffer::list_descendant_paths(workdir, dataset_root)? {
        if path == "/" || path.starts_with(".strata/") {
            continue;
        }
        let object_path = marshal::object_path_for(&path);
        if seen.insert(object_path.clone()) {
            store.insert_pending_if_absent(&object_path)?;
            progress.report(IndexProgress::counting(seen.len()));
        }
    }

    // Entries for objects that vanished while the dataset was unloaded.
    let swept = store.retain_default(&seen)?;
    if swept > 0 {
        debug!(swept, "dropped stale default-index entries");
    }

    // Indexing phase.
    let mut pending = Vec::new();
    store.for_each_default(|path, entry| {
        if entry == DefaultEntry::Pending {
            pending.push(path.to_owned());
        }
        Ok(())
    })?;

    let total = store.default_len()? as usize;
    let mut loaded = total - pending.len();
    for object_path in pending {
        match marshal::read_object(repo, registry, &object_path, None)? {
            Some(object) => {
                store.put_default(&object_path, &DefaultEntry::Object(object))?;
            }
            None => store.delete_default(&object_path)?,
        }
        loaded += 1;
        progress.report(IndexProgress::indexing(total, loaded));
    }
    progress.flush();

    let object_count = store.default_len()? as usize;
    debug!(dataset_root, object_count, "default index settled");
    Ok(object_count)
}
