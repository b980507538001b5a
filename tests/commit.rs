//! Changeset engine: conflict detection, atomicity, tree operations.

mod common;

use strata::buffer::ChangeStatus;
use strata::changeset::{CommitError, apply_changeset, delete_tree, move_tree};
use strata::{BufferChange, Changeset, Prior};

use common::*;

#[test]
fn create_commit_and_read_back() {
    let (_dir, repo) = scratch_repo();

    let mut changeset = Changeset::new();
    changeset.insert("a.txt", BufferChange::create(text("hello")));
    let outcome = apply_changeset(&repo, &changeset, &opts("create a.txt")).unwrap();

    assert!(outcome.new_commit.is_some());
    assert!(outcome.conflicts.is_empty());
    assert_eq!(read(&repo, "a.txt").unwrap(), b"hello");
    assert_eq!(dirty_count(&repo), 0);
}

#[test]
fn stale_prior_conflicts_without_touching_anything() {
    let (_dir, repo) = scratch_repo();
    commit_files(&repo, &[("a.txt", "hello")]);
    let head_before = head_oid(&repo);

    let mut changeset = Changeset::new();
    changeset.insert(
        "a.txt",
        BufferChange::modify(text("wrong"), text("world")),
    );
    let outcome = apply_changeset(&repo, &changeset, &opts("update a.txt")).unwrap();

    assert!(outcome.new_commit.is_none());
    assert_eq!(outcome.conflicts.get("a.txt"), Some(&ChangeStatus::Modified));
    assert_eq!(read(&repo, "a.txt").unwrap(), b"hello");
    assert_eq!(head_oid(&repo), head_before);
    assert_eq!(dirty_count(&repo), 0);
}

#[test]
fn delete_with_correct_prior() {
    let (_dir, repo) = scratch_repo();
    commit_files(&repo, &[("a.txt", "hello"), ("keep.txt", "stay")]);

    let mut changeset = Changeset::new();
    changeset.insert("a.txt", BufferChange::delete(text("hello")));
    let outcome = apply_changeset(&repo, &changeset, &opts("delete a.txt")).unwrap();

    assert!(outcome.new_commit.is_some());
    assert_eq!(read(&repo, "a.txt"), None);
    assert_eq!(read(&repo, "keep.txt").unwrap(), b"stay");
}

#[test]
fn declared_absent_but_present_reports_added() {
    let (_dir, repo) = scratch_repo();
    commit_files(&repo, &[("a.txt", "hello")]);

    let mut changeset = Changeset::new();
    changeset.insert("a.txt", BufferChange::create(text("other")));
    let outcome = apply_changeset(&repo, &changeset, &opts("recreate")).unwrap();

    assert_eq!(outcome.conflicts.get("a.txt"), Some(&ChangeStatus::Added));
}

#[test]
fn declared_value_but_absent_reports_removed() {
    let (_dir, repo) = scratch_repo();
    commit_files(&repo, &[("other.txt", "x")]);

    let mut changeset = Changeset::new();
    changeset.insert("gone.txt", BufferChange::delete(text("was here")));
    let outcome = apply_changeset(&repo, &changeset, &opts("remove gone")).unwrap();

    assert_eq!(outcome.conflicts.get("gone.txt"), Some(&ChangeStatus::Removed));
}

#[test]
fn skip_conflict_check_forces_past_stale_prior() {
    let (_dir, repo) = scratch_repo();
    commit_files(&repo, &[("a.txt", "hello")]);

    let mut changeset = Changeset::new();
    changeset.insert("a.txt", BufferChange::modify(text("wrong"), text("forced")));
    let mut options = opts("force update");
    options.skip_conflict_check = true;
    let outcome = apply_changeset(&repo, &changeset, &options).unwrap();

    assert!(outcome.new_commit.is_some());
    assert_eq!(read(&repo, "a.txt").unwrap(), b"forced");
}

#[test]
fn partial_write_failure_rolls_back_completely() {
    let (_dir, repo) = scratch_repo();
    commit_files(&repo, &[("a.txt", "hello")]);
    let head_before = head_oid(&repo);

    // "a.txt" is written first (map order), then "a.txt/b.txt" fails
    // because a file blocks the directory.
    let mut changeset = Changeset::new();
    changeset.insert(
        "a.txt",
        BufferChange::modify(text("hello"), text("goodbye")),
    );
    changeset.insert(
        "a.txt/b.txt",
        BufferChange {
            prior: Prior::Unchecked,
            next: Some(text("nested")),
        },
    );

    let result = apply_changeset(&repo, &changeset, &opts("doomed"));
    assert!(result.is_err());

    // Working tree and HEAD are byte-identical to the pre-attempt state.
    assert_eq!(read(&repo, "a.txt").unwrap(), b"hello");
    assert_eq!(head_oid(&repo), head_before);
    assert_eq!(dirty_count(&repo), 0);
}

#[test]
fn identical_content_is_nothing_staged() {
    let (_dir, repo) = scratch_repo();
    commit_files(&repo, &[("a.txt", "hello")]);
    let head_before = head_oid(&repo);

    let mut changeset = Changeset::new();
    changeset.insert(
        "a.txt",
        BufferChange::modify(text("hello"), text("hello")),
    );
    let result = apply_changeset(&repo, &changeset, &opts("no-op"));

    assert!(matches!(result, Err(CommitError::NothingStaged)));
    assert_eq!(head_oid(&repo), head_before);
    assert_eq!(dirty_count(&repo), 0);
}

#[test]
fn validation_rejects_before_any_mutation() {
    let (_dir, repo) = scratch_repo();

    let empty = Changeset::new();
    assert!(matches!(
        apply_changeset(&repo, &empty, &opts("msg")),
        Err(CommitError::EmptyChangeset)
    ));

    let mut changeset = Changeset::new();
    changeset.insert("a.txt", BufferChange::create(text("x")));

    let mut no_author = opts("msg");
    no_author.author.name = String::new();
    assert!(matches!(
        apply_changeset(&repo, &changeset, &no_author),
        Err(CommitError::InvalidAuthor)
    ));

    assert!(matches!(
        apply_changeset(&repo, &changeset, &opts("   ")),
        Err(CommitError::EmptyMessage)
    ));

    // Nothing was written along the way.
    assert_eq!(read(&repo, "a.txt"), None);
}

#[test]
fn unchecked_prior_skips_conflict_detection() {
    let (_dir, repo) = scratch_repo();
    commit_files(&repo, &[("a.txt", "hello")]);

    let mut changeset = Changeset::new();
    changeset.insert(
        "a.txt",
        BufferChange {
            prior: Prior::Unchecked,
            next: Some(text("replaced")),
        },
    );
    let outcome = apply_changeset(&repo, &changeset, &opts("replace")).unwrap();
    assert!(outcome.new_commit.is_some());
    assert_eq!(read(&repo, "a.txt").unwrap(), b"replaced");
}

#[test]
fn move_tree_renames_and_commits() {
    let (_dir, repo) = scratch_repo();
    commit_files(&repo, &[("docs/x.txt", "one"), ("docs/sub/y.txt", "two")]);

    let outcome = move_tree(&repo, "docs", "archive", &opts("move docs")).unwrap();
    assert!(outcome.new_commit.is_some());

    assert_eq!(read(&repo, "archive/x.txt").unwrap(), b"one");
    assert_eq!(read(&repo, "archive/sub/y.txt").unwrap(), b"two");
    assert_eq!(read(&repo, "docs/x.txt"), None);
    assert_eq!(dirty_count(&repo), 0);
}

#[test]
fn delete_tree_removes_subtree() {
    let (_dir, repo) = scratch_repo();
    commit_files(&repo, &[("docs/x.txt", "one"), ("keep.txt", "stay")]);

    let outcome = delete_tree(&repo, "docs", &opts("drop docs")).unwrap();
    assert!(outcome.new_commit.is_some());

    assert_eq!(read(&repo, "docs/x.txt"), None);
    assert_eq!(read(&repo, "keep.txt").unwrap(), b"stay");
    assert_eq!(dirty_count(&repo), 0);
}

#[test]
fn delete_tree_missing_path_errors() {
    let (_dir, repo) = scratch_repo();
    commit_files(&repo, &[("a.txt", "x")]);

    assert!(matches!(
        delete_tree(&repo, "ghost", &opts("drop")),
        Err(CommitError::MissingTree(_))
    ));
}

#[test]
fn binary_buffers_round_trip_through_commits() {
    let (_dir, repo) = scratch_repo();

    let payload = vec![0u8, 159, 146, 150, 255];
    let mut changeset = Changeset::new();
    changeset.insert(
        "blob.bin",
        BufferChange::create(strata::BufferValue::Binary(payload.clone())),
    );
    apply_changeset(&repo, &changeset, &opts("binary")).unwrap();
    assert_eq!(read(&repo, "blob.bin").unwrap(), payload);

    // Deleting it requires the matching binary prior.
    let mut changeset = Changeset::new();
    changeset.insert(
        "blob.bin",
        BufferChange::delete(strata::BufferValue::Binary(payload)),
    );
    let outcome = apply_changeset(&repo, &changeset, &opts("drop binary")).unwrap();
    assert!(outcome.new_commit.is_some());
    assert_eq!(read(&repo, "blob.bin"), None);
}
