//! The commit boundary: buffer writes become one atomic, conflict-checked
//! git commit.
//!
//! State machine per attempt: validating → (conflict | writing) →
//! (committing | rolled-back). Any failure after writing begins rolls the
//! affected paths back to HEAD; the working copy is never left with
//! mismatched working-tree/index/HEAD state.

use std::fs;
use std::path::Path;

use git2::{Oid, Repository, Signature};
use tracing::{debug, warn};

use super::{Changeset, CommitError, Conflicts, classify_conflict};
use crate::buffer::{self, WriteEntry};
use crate::config::Author;

/// Options common to every commit-producing operation.
#[derive(Debug, Clone)]
pub struct CommitOptions {
    pub author: Author,
    pub message: String,
    /// Skip the conflict check entirely. Audited: every use is logged.
    pub skip_conflict_check: bool,
}

impl CommitOptions {
    pub fn new(author: Author, message: impl Into<String>) -> Self {
        CommitOptions {
            author,
            message: message.into(),
            skip_conflict_check: false,
        }
    }

    fn validate(&self) -> Result<(), CommitError> {
        if !self.author.is_valid() {
            return Err(CommitError::InvalidAuthor);
        }
        if self.message.trim().is_empty() {
            return Err(CommitError::EmptyMessage);
        }
        Ok(())
    }
}

/// Result of a commit attempt: either a new commit id, or the conflict map
/// explaining why nothing was written.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub new_commit: Option<Oid>,
    pub conflicts: Conflicts,
}

impl CommitOutcome {
    fn committed(oid: Oid) -> Self {
        CommitOutcome {
            new_commit: Some(oid),
            conflicts: Conflicts::new(),
        }
    }

    fn conflicted(conflicts: Conflicts) -> Self {
        CommitOutcome {
            new_commit: None,
            conflicts,
        }
    }

    pub fn is_conflict(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Apply a changeset as one commit.
///
/// Conflicts abort before any write and are returned as a value; validation
/// problems error before any disk mutation; failures after writing roll the
/// working copy back and re-throw.
pub fn apply_changeset(
    repo: &Repository,
    changeset: &Changeset,
    opts: &CommitOptions,
) -> Result<CommitOutcome, CommitError> {
    changeset.validate()?;
    opts.validate()?;

    if opts.skip_conflict_check {
        warn!(paths = changeset.0.len(), "conflict check explicitly skipped");
    } else {
        let mut conflicts = Conflicts::new();
        for (path, change) in changeset.iter() {
            let actual = buffer::read_buffer(repo, path, None)?;
            if let Some(status) = classify_conflict(&change.prior, actual.as_deref()) {
                conflicts.insert(path.clone(), status);
            }
        }
        if !conflicts.is_empty() {
            debug!(conflicts = conflicts.len(), "changeset rejected with conflicts");
            return Ok(CommitOutcome::conflicted(conflicts));
        }
    }

    let entries: Vec<WriteEntry> = changeset
        .iter()
        .map(|(path, change)| {
            (
                path.clone(),
                change.next.as_ref().map(|v| v.as_bytes().to_vec()),
            )
        })
        .collect();
    let affected: Vec<String> = changeset.paths().map(str::to_owned).collect();
    let written: Vec<String> = entries
        .iter()
        .filter(|(_, next)| next.is_some())
        .map(|(path, _)| path.clone())
        .collect();

    let attempt = || -> Result<Oid, CommitError> {
        buffer::write_buffers(repo, &entries)?;
        commit_staged(repo, opts)
    };

    match attempt() {
        Ok(oid) => Ok(CommitOutcome::committed(oid)),
        Err(e) => {
            rollback(repo, &affected, &written);
            Err(e)
        }
    }
}

/// Rename a subtree and commit the move, with the same rollback contract.
pub fn move_tree(
    repo: &Repository,
    from: &str,
    to: &str,
    opts: &CommitOptions,
) -> Result<CommitOutcome, CommitError> {
    opts.validate()?;
    let workdir = workdir(repo)?;
    let from = buffer::normalize_path(from).to_owned();
    let to = buffer::normalize_path(to).to_owned();
    let abs_from = workdir.join(&from);
    let abs_to = workdir.join(&to);
    if !abs_from.exists() {
        return Err(CommitError::MissingTree(from));
    }

    let attempt = || -> Result<Oid, CommitError> {
        if let Some(parent) = abs_to.parent() {
            fs::create_dir_all(parent).map_err(|e| CommitError::MoveTree {
                from: from.clone(),
                to: to.clone(),
                source: e,
            })?;
        }
        fs::rename(&abs_from, &abs_to).map_err(|e| CommitError::MoveTree {
            from: from.clone(),
            to: to.clone(),
            source: e,
        })?;

        let mut index = repo.index()?;
        index.remove_all([from.as_str()], None)?;
        index.add_all([to.as_str()], git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;

        commit_staged(repo, opts)
    };

    match attempt() {
        Ok(oid) => Ok(CommitOutcome::committed(oid)),
        Err(e) => {
            let affected = [from, to.clone()];
            rollback(repo, &affected, &[to]);
            Err(e)
        }
    }
}

/// Remove a subtree and commit the removal, with the same rollback contract.
pub fn delete_tree(
    repo: &Repository,
    path: &str,
    opts: &CommitOptions,
) -> Result<CommitOutcome, CommitError> {
    opts.validate()?;
    let workdir = workdir(repo)?;
    let path = buffer::normalize_path(path).to_owned();
    let abs = workdir.join(&path);
    if !abs.exists() {
        return Err(CommitError::MissingTree(path));
    }

    let attempt = || -> Result<Oid, CommitError> {
        let removal = if abs.is_dir() {
            fs::remove_dir_all(&abs)
        } else {
            fs::remove_file(&abs)
        };
        removal.map_err(|e| CommitError::RemoveTree {
            path: path.clone(),
            source: e,
        })?;

        let mut index = repo.index()?;
        index.remove_all([path.as_str()], None)?;
        index.write()?;

        commit_staged(repo, opts)
    };

    match attempt() {
        Ok(oid) => Ok(CommitOutcome::committed(oid)),
        Err(e) => {
            rollback(repo, std::slice::from_ref(&path), &[]);
            Err(e)
        }
    }
}

/// Build the tree from the index and commit it onto HEAD.
///
/// The tree comparison against the parent doubles as the dry run: a
/// changeset that stages nothing is caught here, before the real commit.
fn commit_staged(repo: &Repository, opts: &CommitOptions) -> Result<Oid, CommitError> {
    let mut index = repo.index()?;
    let tree_id = index.write_tree()?;
    let parent = buffer::head_commit(repo)?;

    if let Some(parent) = &parent
        && parent.tree_id() == tree_id
    {
        return Err(CommitError::NothingStaged);
    }

    let tree = repo.find_tree(tree_id)?;
    let sig = Signature::now(&opts.author.name, &opts.author.email)?;
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    let oid = repo.commit(Some("HEAD"), &sig, &sig, &opts.message, &tree, &parents)?;
    debug!(%oid, "committed changeset");
    Ok(oid)
}

/// Force the affected paths back to their HEAD state, discarding staged and
/// working-tree changes. Best effort: rollback failures are logged, the
/// original error still propagates.
fn rollback(repo: &Repository, affected: &[String], written: &[String]) {
    warn!(paths = affected.len(), "rolling back failed commit attempt");
    match buffer::head_commit(repo) {
        Ok(Some(head)) => {
            let reset =
                repo.reset_default(Some(head.as_object()), affected.iter().map(String::as_str));
            if let Err(e) = reset {
                warn!(error = %e, "rollback: index reset failed");
            }
            let mut checkout = git2::build::CheckoutBuilder::new();
            checkout.force().remove_untracked(true);
            for path in affected {
                checkout.path(path.as_str());
            }
            if let Err(e) = repo.checkout_head(Some(&mut checkout)) {
                warn!(error = %e, "rollback: forced checkout failed");
            }
        }
        Ok(None) => {
            // Unborn HEAD: unstage everything we touched and remove the
            // files this attempt wrote.
            if let Ok(mut index) = repo.index() {
                for path in affected {
                    let _ = index.remove_path(Path::new(path));
                }
                let _ = index.write();
            }
            if let Ok(workdir) = workdir(repo) {
                for path in written {
                    let _ = fs::remove_file(workdir.join(path));
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "rollback: could not resolve HEAD");
        }
    }
}

fn workdir(repo: &Repository) -> Result<&Path, CommitError> {
    repo.workdir().ok_or_else(|| {
        CommitError::Buffer(crate::buffer::BufferError::InvalidPath(
            "bare repository".into(),
        ))
    })
}
