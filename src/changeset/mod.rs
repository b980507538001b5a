//! Changesets: proposed old/new buffer values applied as one commit.
//!
//! A changeset maps repo-relative paths to declared prior and next values.
//! The prior value is what the proposer believes is at HEAD; the conflict
//! check in [`commit`] compares it against reality before anything is
//! written. Conflicts are a result value, never an exception.

mod commit;

pub use commit::{apply_changeset, delete_tree, move_tree, CommitOptions, CommitOutcome};

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::buffer::{BufferError, ChangeStatus};
use crate::marshal::{self, MarshalError, Object, SerDesRegistry};

/// Conflict result: every conflicting path with how it actually changed.
pub type Conflicts = BTreeMap<String, ChangeStatus>;

#[derive(Error, Debug)]
pub enum CommitError {
    #[error("changeset is empty")]
    EmptyChangeset,

    #[error("changeset contains no effective change")]
    NoOpChangeset,

    #[error("author name and email must be set")]
    InvalidAuthor,

    #[error("commit message must not be blank")]
    EmptyMessage,

    #[error("unsupported buffer encoding {0:?}")]
    UnsupportedEncoding(String),

    #[error("nothing staged: changeset produced no tree change")]
    NothingStaged,

    #[error("tree {0:?} does not exist in the working copy")]
    MissingTree(String),

    #[error("failed to move {from:?} to {to:?}: {source}")]
    MoveTree {
        from: String,
        to: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to remove tree {path:?}: {source}")]
    RemoveTree {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Marshal(#[from] MarshalError),

    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
}

/// A buffer value with its declared encoding.
///
/// Text values compare string-wise against UTF-8 content; binary values
/// compare byte-wise. The distinction also drives encoding-mismatch
/// conflict detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferValue {
    Text(String),
    Binary(Vec<u8>),
}

impl BufferValue {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            BufferValue::Text(s) => s.as_bytes(),
            BufferValue::Binary(b) => b,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            BufferValue::Text(s) => s.into_bytes(),
            BufferValue::Binary(b) => b,
        }
    }

    /// Encoding-aware equality against actual on-disk content.
    ///
    /// Mismatched encoding expectation (actual binary but text declared,
    /// or the reverse) counts as inequality.
    pub fn matches_actual(&self, actual: &[u8]) -> bool {
        match self {
            BufferValue::Text(s) => match std::str::from_utf8(actual) {
                Ok(text) => s == text,
                Err(_) => false,
            },
            BufferValue::Binary(b) => is_binary(actual) && b == actual,
        }
    }

    fn from_wire(encoding: &str, value: &str) -> Result<Self, CommitError> {
        match encoding {
            "utf-8" => Ok(BufferValue::Text(value.to_owned())),
            "hex" => hex::decode(value)
                .map(BufferValue::Binary)
                .map_err(|_| CommitError::UnsupportedEncoding("hex (malformed)".into())),
            other => Err(CommitError::UnsupportedEncoding(other.to_owned())),
        }
    }
}

/// Classify content as binary when it is not valid UTF-8.
pub fn is_binary(bytes: &[u8]) -> bool {
    std::str::from_utf8(bytes).is_err()
}

#[derive(Serialize)]
struct WireBufferValue<'a> {
    encoding: &'a str,
    value: String,
}

impl Serialize for BufferValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = match self {
            BufferValue::Text(s) => WireBufferValue {
                encoding: "utf-8",
                value: s.clone(),
            },
            BufferValue::Binary(b) => WireBufferValue {
                encoding: "hex",
                value: hex::encode(b),
            },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BufferValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Owned {
            encoding: String,
            value: String,
        }
        let wire = Owned::deserialize(deserializer)?;
        BufferValue::from_wire(&wire.encoding, &wire.value).map_err(D::Error::custom)
    }
}

/// The declared prior value of a path.
///
/// `Unchecked` opts the path out of conflict detection entirely (the
/// source's "undefined" as opposed to null); `Absent` asserts no blob
/// exists at HEAD.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Prior {
    #[default]
    Unchecked,
    Absent,
    Value(BufferValue),
}

/// One proposed change to one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferChange {
    #[serde(default)]
    pub prior: Prior,
    pub next: Option<BufferValue>,
}

impl BufferChange {
    pub fn create(next: BufferValue) -> Self {
        BufferChange {
            prior: Prior::Absent,
            next: Some(next),
        }
    }

    pub fn modify(prior: BufferValue, next: BufferValue) -> Self {
        BufferChange {
            prior: Prior::Value(prior),
            next: Some(next),
        }
    }

    pub fn delete(prior: BufferValue) -> Self {
        BufferChange {
            prior: Prior::Value(prior),
            next: None,
        }
    }

    /// True when the entry proposes no value on either side.
    fn is_noop(&self) -> bool {
        self.next.is_none() && !matches!(self.prior, Prior::Value(_))
    }
}

/// A set of proposed changes, applied as one atomic commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Changeset(pub BTreeMap<String, BufferChange>);

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl AsRef<str>, change: BufferChange) {
        self.0
            .insert(crate::buffer::normalize_path(path.as_ref()).to_owned(), change);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BufferChange)> {
        self.0.iter()
    }

    /// Reject empty and all-no-op changesets before any disk mutation.
    pub fn validate(&self) -> Result<(), CommitError> {
        if self.0.is_empty() {
            return Err(CommitError::EmptyChangeset);
        }
        if self.0.values().all(BufferChange::is_noop) {
            return Err(CommitError::NoOpChangeset);
        }
        Ok(())
    }

    /// Merge another changeset into this one; later entries win per path.
    pub fn merge(&mut self, other: Changeset) {
        self.0.extend(other.0);
    }
}

/// Conflict classification for one path: declared prior vs actual HEAD
/// content. `None` means no conflict.
pub fn classify_conflict(prior: &Prior, actual: Option<&[u8]>) -> Option<ChangeStatus> {
    match (prior, actual) {
        (Prior::Unchecked, _) => None,
        (Prior::Absent, None) => None,
        (Prior::Absent, Some(_)) => Some(ChangeStatus::Added),
        (Prior::Value(_), None) => Some(ChangeStatus::Removed),
        (Prior::Value(declared), Some(actual)) => {
            if declared.matches_actual(actual) {
                None
            } else {
                Some(ChangeStatus::Modified)
            }
        }
    }
}

// =============================================================================
// Object-level changes
// =============================================================================

/// A proposed change at the object level; serialized through the dataset's
/// SerDes rules into per-buffer changes.
#[derive(Debug, Clone)]
pub struct ObjectChange {
    pub path: String,
    /// Declared prior object; `None` asserts the object does not exist.
    pub prior: Option<Object>,
    /// New object; `None` deletes it.
    pub next: Option<Object>,
}

/// Expand object-level changes to a buffer changeset via the registry.
///
/// For composite objects the old and new fragment sets are unioned: a
/// fragment missing from the new object is deleted, one missing from the
/// old is created.
pub fn object_changes_to_changeset(
    registry: &SerDesRegistry,
    changes: &[ObjectChange],
) -> Result<Changeset, CommitError> {
    let mut changeset = Changeset::new();
    for change in changes {
        let object_path = crate::buffer::normalize_path(&change.path);
        let rule = registry.rule_for(object_path)?;

        let old_fragments = match &change.prior {
            Some(object) => marshal::absolute_fragments(
                object_path,
                rule.serialize(object_path, object)?,
            ),
            None => BTreeMap::new(),
        };
        let new_fragments = match &change.next {
            Some(object) => marshal::absolute_fragments(
                object_path,
                rule.serialize(object_path, object)?,
            ),
            None => BTreeMap::new(),
        };

        let mut paths: Vec<&String> = old_fragments.keys().chain(new_fragments.keys()).collect();
        paths.sort();
        paths.dedup();

        for path in paths {
            let prior = match old_fragments.get(path) {
                Some(bytes) => Prior::Value(bytes_to_value(bytes)),
                None => Prior::Absent,
            };
            let next = new_fragments.get(path).map(|bytes| bytes_to_value(bytes));
            changeset.insert(path, BufferChange { prior, next });
        }
    }
    Ok(changeset)
}

fn bytes_to_value(bytes: &[u8]) -> BufferValue {
    match std::str::from_utf8(bytes) {
        Ok(text) => BufferValue::Text(text.to_owned()),
        Err(_) => BufferValue::Binary(bytes.to_vec()),
    }
}
