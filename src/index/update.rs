//! Incremental index maintenance after a commit or pull moved HEAD.

use std::collections::BTreeSet;
use std::sync::Arc;

use git2::{Oid, Repository};
use tracing::debug;

use super::predicate::Predicate;
use super::store::{DefaultEntry, IndexStore};
use super::{IndexError, IndexStatus};
use crate::buffer;
use crate::marshal::{self, SerDesRegistry};

/// A filtered index: predicate, stable id, and current status.
pub struct FilteredIndex {
    pub id: String,
    pub predicate: Arc<dyn Predicate>,
    pub status: IndexStatus,
}

impl FilteredIndex {
    pub fn new(id: String, predicate: Arc<dyn Predicate>) -> Self {
        FilteredIndex {
            id,
            predicate,
            status: IndexStatus::settled(0),
        }
    }
}

/// Apply a HEAD transition `(oid_before, oid_after)` to the default index,
/// then rebuild every filtered index the transition affected.
///
/// Idempotent at the default-index level: re-applying the same transition
/// converges to the same state. Each filtered index is evaluated until the
/// first object that concerns it, then taken off the check list; it will
/// be rebuilt wholesale from the already-updated default index.
pub fn update_indexes(
    repo: &Repository,
    dataset_root: &str,
    registry: &SerDesRegistry,
    store: &IndexStore,
    filtered: &mut [FilteredIndex],
    oid_before: Oid,
    oid_after: Oid,
) -> Result<(), IndexError> {
    let changed = buffer::diff_paths(
        repo,
        dataset_root,
        Some(oid_before),
        Some(oid_after),
        true,
    )?;
    let object_paths: BTreeSet<String> = changed
        .iter()
        .map(|(path, _)| marshal::object_path_for(path))
        .collect();
    if object_paths.is_empty() {
        return Ok(());
    }
    debug!(
        objects = object_paths.len(),
        %oid_before,
        %oid_after,
        "incremental index update"
    );

    let mut to_check: Vec<usize> = (0..filtered.len()).collect();
    let mut affected: Vec<usize> = Vec::new();

    for object_path in &object_paths {
        let before = marshal::read_object(repo, registry, object_path, Some(oid_before))?;
        let after = marshal::read_object(repo, registry, object_path, Some(oid_after))?;

        match &after {
            Some(object) => {
                store.put_default(object_path, &DefaultEntry::Object(object.clone()))?;
            }
            None => store.delete_default(object_path)?,
        }

        // A filtered index is affected when either version of the object
        // satisfies its predicate. Once affected it stops being checked
        // for the rest of this batch.
        to_check.retain(|&i| {
            let predicate = &filtered[i].predicate;
            let hit = after
                .as_ref()
                .is_some_and(|object| predicate.evaluate(object_path, object))
                || before
                    .as_ref()
                    .is_some_and(|object| predicate.evaluate(object_path, object));
            if hit {
                affected.push(i);
            }
            !hit
        });
    }

    for i in affected {
        rebuild_filtered(store, &mut filtered[i])?;
    }
    Ok(())
}

/// Clear and refill a filtered index from the default index.
///
/// Positions are dense integers from 0 in default-index storage order;
/// pending entries never match.
pub fn rebuild_filtered(
    store: &IndexStore,
    index: &mut FilteredIndex,
) -> Result<(), IndexError> {
    let mut matches = Vec::new();
    store.for_each_default(|path, entry| {
        if let DefaultEntry::Object(object) = &entry
            && index.predicate.evaluate(path, object)
        {
            matches.push(path.to_owned());
        }
        Ok(())
    })?;
    store.replace_filtered(&index.id, &matches)?;
    index.status = IndexStatus::settled(matches.len());
    debug!(id = %index.id, object_count = matches.len(), "filtered index rebuilt");
    Ok(())
}
