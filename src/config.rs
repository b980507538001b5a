//! Repository and dataset metadata files.
//!
//! Both live inside the working copy: the repository metadata under
//! `.strata/repository.json` at the working-copy root, the dataset metadata
//! as `.dataset.json` under each dataset root. The index cache is derived
//! state and lives outside the working copy (see [`crate::paths`]).

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths::{DATASET_META_FILE, REPO_META_FILE};

/// Commit author identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub email: String,
}

impl Author {
    /// A usable author has a non-blank name and email.
    pub fn is_valid(&self) -> bool {
        !self.name.trim().is_empty() && !self.email.trim().is_empty()
    }
}

/// Remote configuration for a working copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    /// Whether this clone is allowed to push.
    #[serde(default)]
    pub push_allowed: bool,
}

/// Repository metadata stored at the working-copy root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoMetadata {
    pub author: Option<Author>,
    pub remote: Option<RemoteConfig>,
    pub branch: Option<String>,
}

/// Dataset metadata stored at the dataset root (committed with the data).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    /// Which extension's object specs govern this dataset.
    pub kind: String,
    /// Current schema version of the dataset's objects.
    pub version: String,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("malformed metadata in {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl RepoMetadata {
    /// Load repository metadata; a missing file yields the default.
    pub fn load(workdir: &Path) -> Result<Self, ConfigError> {
        load_json(&workdir.join(REPO_META_FILE))
            .map(|opt| opt.unwrap_or_default())
    }

    pub fn save(&self, workdir: &Path) -> Result<(), ConfigError> {
        save_json(&workdir.join(REPO_META_FILE), self)
    }
}

impl DatasetMetadata {
    /// Load dataset metadata from `<dataset root>/.dataset.json`.
    ///
    /// Returns `None` when the dataset has no metadata file (uninitialized).
    pub fn load(dataset_dir: &Path) -> Result<Option<Self>, ConfigError> {
        load_json(&dataset_dir.join(DATASET_META_FILE))
    }

    pub fn save(&self, dataset_dir: &Path) -> Result<(), ConfigError> {
        save_json(&dataset_dir.join(DATASET_META_FILE), self)
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, ConfigError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.display().to_string(),
                source: e,
            });
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| ConfigError::Malformed {
            path: path.display().to_string(),
            source: e,
        })
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let mut body = serde_json::to_vec_pretty(value).expect("metadata serializes");
    body.push(b'\n');
    fs::write(path, body).map_err(write_err)
}
