//! Buffer store: raw byte blobs at paths inside a working copy.
//!
//! Reads resolve against HEAD or an arbitrary historical commit; writes go
//! to the working tree and the git index together, and must be followed by
//! a commit or an explicit rollback. "Not found" is never an error here;
//! an absent blob reads as `None`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use git2::{ErrorCode, ObjectType, Oid, Repository, TreeWalkMode, TreeWalkResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;

/// Per-path outcome of a tree diff, and the conflict classification.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Added,
    Removed,
    Modified,
    Unchanged,
}

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("path {0:?} is not valid inside a working copy")]
    InvalidPath(String),

    #[error("failed to resolve commit {0}: {1}")]
    ResolveCommit(Oid, #[source] git2::Error),

    #[error("expected a blob at {0}")]
    NotABlob(String),

    #[error("failed to stage {path}: {source}")]
    Stage {
        path: String,
        #[source]
        source: git2::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to walk {0}: {1}")]
    Walk(PathBuf, #[source] walkdir::Error),

    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
}

/// A proposed write: `None` removes the blob at `path`.
pub type WriteEntry = (String, Option<Vec<u8>>);

/// Strip a leading `/`; buffer paths are repo-relative.
pub fn normalize_path(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

/// Read the blob at `path`, at `at_commit` or HEAD.
///
/// Absent paths (and an unborn HEAD) read as `Ok(None)`; every other git
/// failure propagates.
pub fn read_buffer(
    repo: &Repository,
    path: &str,
    at_commit: Option<Oid>,
) -> Result<Option<Vec<u8>>, BufferError> {
    let rel = normalize_path(path);
    if rel.is_empty() {
        return Err(BufferError::InvalidPath(path.to_owned()));
    }

    let tree = match tree_at(repo, at_commit)? {
        Some(tree) => tree,
        None => return Ok(None),
    };

    let entry = match tree.get_path(Path::new(rel)) {
        Ok(entry) => entry,
        Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if entry.kind() != Some(ObjectType::Blob) {
        // A directory at this path means no blob lives here.
        return Ok(None);
    }
    let blob = repo.find_blob(entry.id())?;
    Ok(Some(blob.content().to_vec()))
}

/// Write (or remove) each buffer on disk and stage it with git.
///
/// The caller owns atomicity: follow with a commit, or roll back the
/// affected paths. Partial staging must never be left behind by a failed
/// operation.
pub fn write_buffers(repo: &Repository, entries: &[WriteEntry]) -> Result<(), BufferError> {
    let workdir = repo
        .workdir()
        .ok_or_else(|| BufferError::InvalidPath("bare repository".into()))?;
    let mut index = repo.index()?;

    for (path, new_value) in entries {
        let rel = normalize_path(path);
        if rel.is_empty() {
            return Err(BufferError::InvalidPath(path.clone()));
        }
        let on_disk = workdir.join(rel);

        match new_value {
            Some(bytes) => {
                if let Some(parent) = on_disk.parent() {
                    fs::create_dir_all(parent).map_err(|e| BufferError::Write {
                        path: path.clone(),
                        source: e,
                    })?;
                }
                fs::write(&on_disk, bytes).map_err(|e| BufferError::Write {
                    path: path.clone(),
                    source: e,
                })?;
                index.add_path(Path::new(rel)).map_err(|e| BufferError::Stage {
                    path: path.clone(),
                    source: e,
                })?;
            }
            None => {
                match fs::remove_file(&on_disk) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(BufferError::Write {
                            path: path.clone(),
                            source: e,
                        });
                    }
                }
                match index.remove_path(Path::new(rel)) {
                    Ok(()) => {}
                    Err(e) if e.code() == ErrorCode::NotFound => {}
                    Err(e) => {
                        return Err(BufferError::Stage {
                            path: path.clone(),
                            source: e,
                        });
                    }
                }
            }
        }
    }

    index.write()?;
    Ok(())
}

/// Compare the leaf blobs of two commits under `root`.
///
/// Directories are skipped: only blob paths are compared, by object id.
/// With `only_changed`, `Unchanged` entries are omitted entirely. `None`
/// for either commit means an empty tree on that side.
pub fn diff_paths(
    repo: &Repository,
    root: &str,
    commit_a: Option<Oid>,
    commit_b: Option<Oid>,
    only_changed: bool,
) -> Result<Vec<(String, ChangeStatus)>, BufferError> {
    let before = tree_blobs(repo, commit_a, root)?;
    let after = tree_blobs(repo, commit_b, root)?;

    let mut paths: Vec<&String> = before.keys().chain(after.keys()).collect();
    paths.sort();
    paths.dedup();

    let mut out = Vec::new();
    for path in paths {
        let status = match (before.get(path), after.get(path)) {
            (None, Some(_)) => ChangeStatus::Added,
            (Some(_), None) => ChangeStatus::Removed,
            (Some(a), Some(b)) if a != b => ChangeStatus::Modified,
            _ => ChangeStatus::Unchanged,
        };
        if only_changed && status == ChangeStatus::Unchanged {
            continue;
        }
        out.push((path.clone(), status));
    }
    Ok(out)
}

/// All leaf blob paths under `prefix` in the given commit's tree, with
/// their blob ids.
pub fn tree_blobs(
    repo: &Repository,
    at_commit: Option<Oid>,
    prefix: &str,
) -> Result<std::collections::BTreeMap<String, Oid>, BufferError> {
    let mut blobs = std::collections::BTreeMap::new();
    let tree = match tree_at(repo, at_commit)? {
        Some(tree) => tree,
        None => return Ok(blobs),
    };
    let prefix = normalize_path(prefix);

    tree.walk(TreeWalkMode::PreOrder, |dir, entry| {
        if entry.kind() != Some(ObjectType::Blob) {
            return TreeWalkResult::Ok;
        }
        let Some(name) = entry.name() else {
            return TreeWalkResult::Ok;
        };
        let path = format!("{dir}{name}");
        if in_prefix(&path, prefix) {
            blobs.insert(path, entry.id());
        }
        TreeWalkResult::Ok
    })?;
    Ok(blobs)
}

fn in_prefix(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// Enumerate every file path under `root` on disk, repo-relative.
///
/// Filesystem-driven, not VCS-driven; `.git` internals are skipped. If the
/// root is not a directory the sequence is just `"/"` itself.
pub fn list_descendant_paths(
    workdir: &Path,
    root: &str,
) -> Result<Vec<String>, BufferError> {
    let rel = normalize_path(root);
    let abs = if rel.is_empty() {
        workdir.to_owned()
    } else {
        workdir.join(rel)
    };

    if !abs.is_dir() {
        return Ok(vec!["/".to_owned()]);
    }

    let mut out = Vec::new();
    let walker = WalkDir::new(&abs)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");
    for entry in walker {
        let entry = entry.map_err(|e| BufferError::Walk(abs.clone(), e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel_to_workdir = entry
            .path()
            .strip_prefix(workdir)
            .map_err(|_| BufferError::InvalidPath(entry.path().display().to_string()))?;
        out.push(rel_to_workdir.to_string_lossy().replace('\\', "/"));
    }
    out.sort();
    Ok(out)
}

/// Tree of `at_commit`, or of HEAD when `None`. An unborn HEAD yields `None`.
fn tree_at<'r>(
    repo: &'r Repository,
    at_commit: Option<Oid>,
) -> Result<Option<git2::Tree<'r>>, BufferError> {
    match at_commit {
        Some(oid) => {
            if oid.is_zero() {
                return Ok(None);
            }
            let commit = repo
                .find_commit(oid)
                .map_err(|e| BufferError::ResolveCommit(oid, e))?;
            Ok(Some(commit.tree()?))
        }
        None => match head_commit(repo)? {
            Some(commit) => Ok(Some(commit.tree()?)),
            None => Ok(None),
        },
    }
}

/// HEAD commit, or `None` if HEAD is unborn.
pub fn head_commit(repo: &Repository) -> Result<Option<git2::Commit<'_>>, BufferError> {
    match repo.head() {
        Ok(head) => Ok(Some(head.peel_to_commit()?)),
        Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => {
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_leading_slash() {
        assert_eq!(normalize_path("/a/b.txt"), "a/b.txt");
        assert_eq!(normalize_path("a/b.txt"), "a/b.txt");
    }

    #[test]
    fn prefix_matching_respects_component_boundaries() {
        assert!(in_prefix("notes/a.json", "notes"));
        assert!(in_prefix("notes", "notes"));
        assert!(!in_prefix("notes-extra/a.json", "notes"));
        assert!(in_prefix("anything", ""));
    }
}
