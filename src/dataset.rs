//! Dataset lifecycle: a named subtree of a working copy with its SerDes
//! specs and indexes.
//!
//! Loading a dataset opens its index database and settles the default
//! index; unloading closes every index handle. Filtered indexes are keyed
//! by their predicate hash so repeated identical queries reuse one index.

use std::sync::Arc;

use git2::{Oid, Repository};
use tracing::debug;

use crate::buffer::BufferError;
use crate::index::{
    DefaultEntry, FilteredIndex, IndexError, IndexStatus, IndexStore, Predicate, ProgressSink,
    ThrottledProgress, build_default_index, index_id, rebuild_filtered, update_indexes,
};
use crate::marshal::{Object, SerDesRegistry};
use crate::paths;

pub struct Dataset {
    root: String,
    registry: SerDesRegistry,
    store: IndexStore,
    filtered: Vec<FilteredIndex>,
    status: IndexStatus,
    ready: bool,
}

impl Dataset {
    /// Load the dataset rooted at `root` (empty = whole working copy):
    /// open its index store and build the default index to settlement.
    pub fn load(
        repo: &Repository,
        root: &str,
        registry: SerDesRegistry,
        sink: ProgressSink,
    ) -> Result<Self, IndexError> {
        let workdir = repo
            .workdir()
            .ok_or_else(|| BufferError::InvalidPath("bare repository".into()))?;
        let root = crate::buffer::normalize_path(root).to_owned();
        let store = IndexStore::open(&paths::index_db_path(workdir, &root))?;

        let mut progress = ThrottledProgress::new(sink);
        let object_count = build_default_index(repo, &root, &registry, &store, &mut progress)?;
        drop(progress);

        debug!(root = %root, object_count, "dataset loaded");
        Ok(Dataset {
            root,
            registry,
            store,
            filtered: Vec::new(),
            status: IndexStatus::settled(object_count),
            ready: true,
        })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn registry(&self) -> &SerDesRegistry {
        &self.registry
    }

    /// Default-index status; settled once `progress` is absent.
    pub fn status(&self) -> IndexStatus {
        self.status.clone()
    }

    /// Look up an object by path in the default index.
    pub fn object(&self, path: &str) -> Result<Option<Object>, IndexError> {
        if !self.ready {
            return Err(IndexError::NotReady);
        }
        let path = crate::buffer::normalize_path(path);
        match self.store.get_default(path)? {
            Some(DefaultEntry::Object(object)) => Ok(Some(object)),
            // Pending entries exist only mid-build.
            Some(DefaultEntry::Pending) | None => Ok(None),
        }
    }

    /// Find or build the filtered index for `predicate`.
    ///
    /// The id is a content hash of the predicate, so an identical query
    /// returns the already-built index. A freshly requested index is
    /// always rebuilt from the default index, since persisted contents may
    /// predate commits made while the dataset was unloaded.
    pub fn ensure_filtered(
        &mut self,
        predicate: Arc<dyn Predicate>,
    ) -> Result<(String, IndexStatus), IndexError> {
        if !self.ready {
            return Err(IndexError::NotReady);
        }
        let id = index_id(predicate.as_ref());
        if let Some(existing) = self.filtered.iter().find(|f| f.id == id) {
            return Ok((id, existing.status.clone()));
        }

        let mut index = FilteredIndex::new(id.clone(), predicate);
        rebuild_filtered(&self.store, &mut index)?;
        let status = index.status.clone();
        self.filtered.push(index);
        Ok((id, status))
    }

    pub fn filtered_status(&self, id: &str) -> Result<IndexStatus, IndexError> {
        self.filtered
            .iter()
            .find(|f| f.id == id)
            .map(|f| f.status.clone())
            .ok_or_else(|| IndexError::UnknownFilteredIndex(id.to_owned()))
    }

    /// Positional lookup: position → object path.
    pub fn filtered_path_at(&self, id: &str, position: u64) -> Result<Option<String>, IndexError> {
        self.require_filtered(id)?;
        self.store.filtered_get(id, position)
    }

    /// Inverse lookup: object path → position, by linear scan.
    pub fn filtered_position_of(
        &self,
        id: &str,
        path: &str,
    ) -> Result<Option<u64>, IndexError> {
        self.require_filtered(id)?;
        self.store
            .filtered_position_of(id, crate::buffer::normalize_path(path))
    }

    /// Apply a HEAD transition to every index of this dataset.
    /// `oid_before` is zero when HEAD was unborn.
    pub fn apply_commit(
        &mut self,
        repo: &Repository,
        oid_before: Oid,
        oid_after: Oid,
    ) -> Result<(), IndexError> {
        update_indexes(
            repo,
            &self.root,
            &self.registry,
            &self.store,
            &mut self.filtered,
            oid_before,
            oid_after,
        )?;
        self.status = IndexStatus::settled(self.store.default_len()? as usize);
        Ok(())
    }

    /// Suggest a free object path near `candidate`: the candidate itself
    /// when unoccupied, else numbered variants before the extension.
    pub fn propose_path(&self, candidate: &str) -> Result<String, IndexError> {
        let candidate = crate::buffer::normalize_path(candidate);
        if self.store.get_default(candidate)?.is_none() {
            return Ok(candidate.to_owned());
        }
        let (stem, ext) = match candidate.rsplit_once('.') {
            // Don't mistake a dotted directory for an extension.
            Some((stem, ext)) if !ext.contains('/') => (stem, Some(ext)),
            _ => (candidate, None),
        };
        for n in 2.. {
            let proposal = match ext {
                Some(ext) => format!("{stem}-{n}.{ext}"),
                None => format!("{stem}-{n}"),
            };
            if self.store.get_default(&proposal)?.is_none() {
                return Ok(proposal);
            }
        }
        unreachable!("counter space exhausted");
    }

    fn require_filtered(&self, id: &str) -> Result<(), IndexError> {
        if self.filtered.iter().any(|f| f.id == id) {
            Ok(())
        } else {
            Err(IndexError::UnknownFilteredIndex(id.to_owned()))
        }
    }
}
