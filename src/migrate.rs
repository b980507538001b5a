//! Migration engine: walk a dataset's version chain, committing one atomic
//! changeset per step.
//!
//! Migrations are supplied externally through the [`Migration`] capability
//! trait: compiled extension code behind the plugin boundary, never
//! source text compiled at runtime. The runner halts on conflict or
//! failure and always reports what it already applied.

use std::path::Path;

use git2::Repository;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::changeset::{
    self, BufferChange, BufferValue, Changeset, CommitError, CommitOptions, Conflicts, Prior,
};
use crate::config::{Author, ConfigError, DatasetMetadata};
use crate::paths::DATASET_META_FILE;

/// Upper bound on migration steps in one run; hit only by a
/// mis-registered migration that fails to advance the version.
const MAX_STEPS: usize = 1000;

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("dataset at {0:?} has no metadata; initialize it first")]
    NoMetadata(String),

    #[error("malformed version spec {0:?}")]
    BadVersionSpec(String),

    #[error("migration for {spec:?} did not advance the version from {version:?}")]
    NoProgress { spec: String, version: String },

    #[error("migration produced no changeset: {0}")]
    Produce(String),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A version-matching spec: exact `a.b.c`, or wildcard `a.x` / `a.b.x`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionSpec(String);

impl VersionSpec {
    pub fn parse(spec: &str) -> Result<Self, MigrateError> {
        let parts: Vec<&str> = spec.split('.').collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(MigrateError::BadVersionSpec(spec.to_owned()));
        }
        for (i, part) in parts.iter().enumerate() {
            let is_last = i == parts.len() - 1;
            let wildcard_allowed = is_last && parts.len() > 1;
            if *part == "x" && wildcard_allowed {
                continue;
            }
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(MigrateError::BadVersionSpec(spec.to_owned()));
            }
        }
        Ok(VersionSpec(spec.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `version` falls under this spec.
    pub fn matches(&self, version: &str) -> bool {
        let spec_parts: Vec<&str> = self.0.split('.').collect();
        let version_parts: Vec<&str> = version.split('.').collect();
        for (i, spec_part) in spec_parts.iter().enumerate() {
            if *spec_part == "x" {
                return true;
            }
            if version_parts.get(i) != Some(spec_part) {
                return false;
            }
        }
        spec_parts.len() == version_parts.len()
    }
}

/// Context handed to a migration's changeset producer.
pub struct MigrationContext<'a> {
    pub workdir: &'a Path,
    pub dataset_root: &'a str,
    pub progress: &'a mut dyn FnMut(&str),
}

/// A versioned transform bringing a dataset from one schema version to the
/// next.
pub trait Migration: Send + Sync {
    /// Which current versions this migration applies to.
    fn version_spec(&self) -> &VersionSpec;

    /// The dataset version after this migration commits.
    fn target_version(&self) -> &str;

    /// Produce the changeset performing the transform.
    fn produce(&self, ctx: &mut MigrationContext<'_>) -> Result<Changeset, MigrateError>;
}

/// One successfully committed migration step.
#[derive(Debug, Clone)]
pub struct AppliedMigration {
    pub commit_hash: String,
    pub changeset: Changeset,
}

/// Why a migration run stopped early.
#[derive(Debug, Clone)]
pub struct MigrationFailure {
    pub version_spec: Option<String>,
    pub message: String,
    pub conflicts: Option<Conflicts>,
}

/// Outcome of a whole migration run; carries everything applied even on
/// failure.
#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub success: bool,
    pub changes_applied: Vec<AppliedMigration>,
    pub error: Option<MigrationFailure>,
}

/// Apply every pending migration for the dataset, one atomic commit per
/// step. The sequence is finished when no migration matches the current
/// version.
pub fn run_migrations(
    repo: &Repository,
    dataset_root: &str,
    migrations: &[Box<dyn Migration>],
    author: &Author,
    progress: &mut dyn FnMut(&str),
) -> MigrationOutcome {
    let mut applied = Vec::new();
    match run_inner(repo, dataset_root, migrations, author, progress, &mut applied) {
        Ok(()) => MigrationOutcome {
            success: true,
            changes_applied: applied,
            error: None,
        },
        Err(failure) => {
            warn!(message = %failure.message, "migration run stopped");
            MigrationOutcome {
                success: false,
                changes_applied: applied,
                error: Some(failure),
            }
        }
    }
}

fn run_inner(
    repo: &Repository,
    dataset_root: &str,
    migrations: &[Box<dyn Migration>],
    author: &Author,
    progress: &mut dyn FnMut(&str),
    applied: &mut Vec<AppliedMigration>,
) -> Result<(), MigrationFailure> {
    let workdir = repo.workdir().ok_or_else(|| MigrationFailure {
        version_spec: None,
        message: "bare repository".into(),
        conflicts: None,
    })?;
    let dataset_root = crate::buffer::normalize_path(dataset_root).to_owned();

    for _ in 0..MAX_STEPS {
        let (meta, meta_bytes) =
            read_metadata(repo, &dataset_root).map_err(|e| MigrationFailure {
                version_spec: None,
                message: e.to_string(),
                conflicts: None,
            })?;

        let Some(migration) = migrations
            .iter()
            .find(|m| m.version_spec().matches(&meta.version))
        else {
            // No applicable migration left: the chain is complete.
            return Ok(());
        };
        let spec = migration.version_spec().as_str().to_owned();
        let target = migration.target_version().to_owned();
        if target == meta.version {
            return Err(MigrationFailure {
                version_spec: Some(spec.clone()),
                message: MigrateError::NoProgress {
                    spec,
                    version: meta.version,
                }
                .to_string(),
                conflicts: None,
            });
        }

        progress(&format!("migrating {} -> {target}", meta.version));
        let mut ctx = MigrationContext {
            workdir,
            dataset_root: &dataset_root,
            progress: &mut *progress,
        };
        let mut changeset = migration.produce(&mut ctx).map_err(|e| MigrationFailure {
            version_spec: Some(spec.clone()),
            message: e.to_string(),
            conflicts: None,
        })?;

        // The version bump commits atomically with the migration itself.
        let new_meta = DatasetMetadata {
            kind: meta.kind.clone(),
            version: target.clone(),
        };
        changeset.insert(
            metadata_path(&dataset_root),
            BufferChange {
                prior: Prior::Value(BufferValue::Text(meta_bytes)),
                next: Some(BufferValue::Text(metadata_body(&new_meta))),
            },
        );

        let opts = CommitOptions::new(
            author.clone(),
            format!("strata(migrate): {dataset_root} {} -> {target}", meta.version),
        );
        let outcome =
            changeset::apply_changeset(repo, &changeset, &opts).map_err(|e| MigrationFailure {
                version_spec: Some(spec.clone()),
                message: e.to_string(),
                conflicts: None,
            })?;

        if outcome.is_conflict() {
            return Err(MigrationFailure {
                version_spec: Some(spec),
                message: "migration changeset conflicted with the working copy".into(),
                conflicts: Some(outcome.conflicts),
            });
        }
        let Some(commit) = outcome.new_commit else {
            return Err(MigrationFailure {
                version_spec: Some(spec),
                message: "migration commit produced no commit hash".into(),
                conflicts: None,
            });
        };

        info!(%commit, version = %target, "migration step committed");
        applied.push(AppliedMigration {
            commit_hash: commit.to_string(),
            changeset,
        });
    }

    Err(MigrationFailure {
        version_spec: None,
        message: format!("migration chain exceeded {MAX_STEPS} steps"),
        conflicts: None,
    })
}

pub(crate) fn metadata_path(dataset_root: &str) -> String {
    if dataset_root.is_empty() {
        DATASET_META_FILE.to_owned()
    } else {
        format!("{dataset_root}/{DATASET_META_FILE}")
    }
}

fn metadata_body(meta: &DatasetMetadata) -> String {
    let mut body = serde_json::to_string_pretty(meta).expect("metadata serializes");
    body.push('\n');
    body
}

fn read_metadata(
    repo: &Repository,
    dataset_root: &str,
) -> Result<(DatasetMetadata, String), MigrateError> {
    let path = metadata_path(dataset_root);
    let bytes = crate::buffer::read_buffer(repo, &path, None)
        .map_err(|e| MigrateError::Produce(e.to_string()))?
        .ok_or_else(|| MigrateError::NoMetadata(dataset_root.to_owned()))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| MigrateError::NoMetadata(dataset_root.to_owned()))?;
    let meta: DatasetMetadata = serde_json::from_str(&text).map_err(|e| {
        MigrateError::Config(ConfigError::Malformed {
            path,
            source: e,
        })
    })?;
    Ok((meta, text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_spec_matches_only_itself() {
        let spec = VersionSpec::parse("1.2.3").unwrap();
        assert!(spec.matches("1.2.3"));
        assert!(!spec.matches("1.2.4"));
        assert!(!spec.matches("1.2"));
        assert!(!spec.matches("1.2.3.4"));
    }

    #[test]
    fn wildcard_spec_matches_prefix() {
        let spec = VersionSpec::parse("1.x").unwrap();
        assert!(spec.matches("1.0"));
        assert!(spec.matches("1.9.3"));
        assert!(!spec.matches("2.0"));

        let spec = VersionSpec::parse("1.2.x").unwrap();
        assert!(spec.matches("1.2.0"));
        assert!(spec.matches("1.2.99"));
        assert!(!spec.matches("1.3.0"));
    }

    #[test]
    fn malformed_specs_rejected() {
        for bad in ["", "x", "1..2", "a.b", "1.2.3.4", "1.x.2"] {
            assert!(VersionSpec::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn metadata_path_handles_empty_root() {
        assert_eq!(metadata_path(""), ".dataset.json");
        assert_eq!(metadata_path("notes"), "notes/.dataset.json");
    }
}
