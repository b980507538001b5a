//! Shared test fixtures: scratch git repositories and seed commits.

#![allow(dead_code)]

use std::sync::Once;

use git2::{Oid, Repository};
use strata::changeset::apply_changeset;
use strata::{Author, BufferChange, BufferValue, Changeset, CommitOptions, Prior};

/// Point the index cache at a per-process scratch directory before any
/// worker thread starts.
pub fn setup_cache() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let dir = std::env::temp_dir().join(format!("strata-test-cache-{}", std::process::id()));
        // SAFETY: called once, before any test spawns threads.
        unsafe { std::env::set_var("STRATA_CACHE_DIR", &dir) };
    });
}

pub fn scratch_repo() -> (tempfile::TempDir, Repository) {
    setup_cache();
    let dir = tempfile::tempdir().expect("tempdir");
    let repo = Repository::init(dir.path()).expect("git init");
    (dir, repo)
}

pub fn author() -> Author {
    Author {
        name: "Test Author".into(),
        email: "test@example.com".into(),
    }
}

pub fn opts(message: &str) -> CommitOptions {
    CommitOptions::new(author(), message)
}

pub fn text(s: &str) -> BufferValue {
    BufferValue::Text(s.into())
}

/// Commit files without conflict checking; returns the new commit id.
pub fn commit_files(repo: &Repository, files: &[(&str, &str)]) -> Oid {
    let mut changeset = Changeset::new();
    for (path, content) in files {
        changeset.insert(
            *path,
            BufferChange {
                prior: Prior::Unchecked,
                next: Some(text(content)),
            },
        );
    }
    apply_changeset(repo, &changeset, &opts("seed"))
        .expect("seed commit")
        .new_commit
        .expect("seed commit hash")
}

/// Commit removals, declaring the actual current content as the prior.
pub fn delete_files(repo: &Repository, paths: &[&str]) -> Oid {
    let mut changeset = Changeset::new();
    for path in paths {
        let current = read(repo, path).expect("deleting an existing file");
        let prior = match String::from_utf8(current) {
            Ok(text) => BufferValue::Text(text),
            Err(e) => BufferValue::Binary(e.into_bytes()),
        };
        changeset.insert(
            *path,
            BufferChange {
                prior: Prior::Value(prior),
                next: None,
            },
        );
    }
    apply_changeset(repo, &changeset, &opts("remove"))
        .expect("remove commit")
        .new_commit
        .expect("remove commit hash")
}

pub fn read(repo: &Repository, path: &str) -> Option<Vec<u8>> {
    strata::buffer::read_buffer(repo, path, None).expect("read buffer")
}

pub fn head_oid(repo: &Repository) -> Oid {
    repo.head().expect("head").target().expect("head oid")
}

pub fn branch_name(repo: &Repository) -> String {
    repo.head()
        .expect("head")
        .shorthand()
        .expect("branch name")
        .to_owned()
}

/// Count of non-clean status entries (any difference between HEAD, index,
/// and working tree, untracked included).
pub fn dirty_count(repo: &Repository) -> usize {
    let mut options = git2::StatusOptions::new();
    options.include_untracked(true).recurse_untracked_dirs(true);
    repo.statuses(Some(&mut options))
        .expect("statuses")
        .iter()
        .filter(|entry| entry.status() != git2::Status::CURRENT)
        .count()
}
