//! Index engine: queryable indexes over a dataset's objects.
//!
//! Each dataset owns one default index (object path → deserialized object)
//! plus any number of filtered indexes (predicate-selected subsets with
//! dense positional addressing), all backed by an embedded ordered
//! key-value store. The store is a disposable cache, fully rebuildable
//! from the working copy.

mod build;
mod predicate;
mod progress;
mod store;
mod update;

pub use build::build_default_index;
pub use predicate::{FieldEquals, FnPredicate, PathPrefix, Predicate, index_id};
pub use progress::{ProgressSink, ThrottledProgress};
pub use store::{DefaultEntry, IndexStore};
pub use update::{FilteredIndex, rebuild_filtered, update_indexes};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::marshal::MarshalError;

/// Build/refresh progress of an index.
///
/// `loaded` is present only during the indexing phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexProgress {
    pub phase: String,
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded: Option<usize>,
}

impl IndexProgress {
    pub fn counting(total: usize) -> Self {
        IndexProgress {
            phase: "counting".into(),
            total,
            loaded: None,
        }
    }

    pub fn indexing(total: usize, loaded: usize) -> Self {
        IndexProgress {
            phase: "indexing".into(),
            total,
            loaded: Some(loaded),
        }
    }
}

/// Index status. The absence of `progress` is the canonical "settled"
/// signal consumers must check for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStatus {
    pub object_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<IndexProgress>,
}

impl IndexStatus {
    pub fn settled(object_count: usize) -> Self {
        IndexStatus {
            object_count,
            progress: None,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.progress.is_none()
    }
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index not ready: default index build has not settled")]
    NotReady,

    #[error("no filtered index with id {0}")]
    UnknownFilteredIndex(String),

    #[error("failed to open index database at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: redb::DatabaseError,
    },

    #[error("index storage directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("index transaction failed: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("index table failed: {0}")]
    Table(#[from] redb::TableError),

    #[error("index storage failed: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("index commit failed: {0}")]
    StorageCommit(#[from] redb::CommitError),

    #[error("stored index value is malformed: {0}")]
    Corrupt(#[source] serde_json::Error),

    #[error(transparent)]
    Buffer(#[from] crate::buffer::BufferError),

    #[error(transparent)]
    Marshal(#[from] MarshalError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settled_status_serializes_without_progress() {
        let status = IndexStatus::settled(7);
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, r#"{"object_count":7}"#);
        assert!(status.is_settled());
    }

    #[test]
    fn counting_progress_omits_loaded() {
        let status = IndexStatus {
            object_count: 0,
            progress: Some(IndexProgress::counting(12)),
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains(r#""phase":"counting""#));
        assert!(!json.contains("loaded"));
        assert!(!status.is_settled());
    }

    #[test]
    fn indexing_progress_carries_loaded() {
        let json =
            serde_json::to_string(&IndexProgress::indexing(10, 4)).unwrap();
        assert!(json.contains(r#""loaded":4"#));
    }
}
