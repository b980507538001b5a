//! Worker registry: handles, serialization of mutations, eviction,
//! admission control.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use strata::changeset::{BufferChange, Changeset};
use strata::index::FieldEquals;
use strata::marshal::SerDesRegistry;
use strata::migrate::{Migration, MigrationContext, MigrateError, VersionSpec};
use strata::sync::{BusyOperation, RepoStatus};
use strata::worker::{OpenOptions, Registry, WorkerError};
use strata::{DatasetMetadata, Error, ObjectChange, Prior};

use common::*;

fn seeded_workdir() -> (tempfile::TempDir, git2::Repository) {
    let (dir, repo) = scratch_repo();
    commit_files(&repo, &[("x.json", r#"{"tag":"A"}"#), ("y.json", r#"{"tag":"B"}"#)]);
    (dir, repo)
}

#[test]
fn commit_and_read_through_the_handle() {
    let (dir, _repo) = seeded_workdir();
    let mut registry = Registry::new();
    let handle = registry.open(dir.path(), OpenOptions::default()).unwrap();

    let mut changeset = Changeset::new();
    changeset.insert("z.json", BufferChange::create(text(r#"{"tag":"A"}"#)));
    let outcome = handle.commit(changeset, opts("add z")).unwrap();
    assert!(outcome.new_commit.is_some());

    assert_eq!(
        handle.read_buffer("z.json", None).unwrap().unwrap(),
        br#"{"tag":"A"}"#
    );
    assert_eq!(handle.read_buffer("missing.json", None).unwrap(), None);
}

#[test]
fn dataset_queries_and_index_refresh_after_commit() {
    let (dir, _repo) = seeded_workdir();
    let mut registry = Registry::new();
    let handle = registry.open(dir.path(), OpenOptions::default()).unwrap();

    let status = handle
        .load_dataset("", SerDesRegistry::with_defaults(), Box::new(|_| {}))
        .unwrap();
    assert!(status.is_settled());
    assert_eq!(status.object_count, 2);

    let (id, filtered) = handle
        .ensure_filtered_index("", Arc::new(FieldEquals::new("/tag", json!("A"))))
        .unwrap();
    assert_eq!(filtered.object_count, 1);
    assert_eq!(
        handle.filtered_path_at("", &id, 0).unwrap(),
        Some("x.json".into())
    );

    // A commit through the handle refreshes both indexes.
    let mut changeset = Changeset::new();
    changeset.insert("y.json", BufferChange::modify(text(r#"{"tag":"B"}"#), text(r#"{"tag":"A"}"#)));
    handle.commit(changeset, opts("flip y")).unwrap();

    assert_eq!(
        handle.get_object("", "y.json").unwrap(),
        Some(json!({"tag": "A"}))
    );
    assert_eq!(handle.filtered_position_of("", &id, "y.json").unwrap(), Some(1));
    assert_eq!(handle.dataset_status("").unwrap().object_count, 2);
}

#[test]
fn update_objects_serializes_through_dataset_rules() {
    let (dir, _repo) = seeded_workdir();
    let mut registry = Registry::new();
    let handle = registry.open(dir.path(), OpenOptions::default()).unwrap();
    handle
        .load_dataset("", SerDesRegistry::with_defaults(), Box::new(|_| {}))
        .unwrap();

    let changes = vec![ObjectChange {
        path: "fresh.json".into(),
        prior: None,
        next: Some(json!({"tag": "C"})),
    }];
    let outcome = handle.update_objects("", changes, opts("add fresh")).unwrap();
    assert!(outcome.new_commit.is_some());

    assert_eq!(
        handle.get_object("", "fresh.json").unwrap(),
        Some(json!({"tag": "C"}))
    );

    // Stale prior at the object level surfaces as a buffer conflict.
    let changes = vec![ObjectChange {
        path: "fresh.json".into(),
        prior: Some(json!({"tag": "WRONG"})),
        next: Some(json!({"tag": "D"})),
    }];
    let outcome = handle.update_objects("", changes, opts("bad update")).unwrap();
    assert!(outcome.new_commit.is_none());
    assert!(outcome.conflicts.contains_key("fresh.json"));
}

#[test]
fn init_dataset_then_propose_unique_paths() {
    let (dir, _repo) = seeded_workdir();
    let mut registry = Registry::new();
    let handle = registry.open(dir.path(), OpenOptions::default()).unwrap();

    let outcome = handle
        .init_dataset(
            "notes",
            DatasetMetadata {
                kind: "notes".into(),
                version: "1.0.0".into(),
            },
            opts("init dataset"),
        )
        .unwrap();
    assert!(outcome.new_commit.is_some());

    // Initializing twice conflicts instead of clobbering.
    let outcome = handle
        .init_dataset(
            "notes",
            DatasetMetadata {
                kind: "notes".into(),
                version: "1.0.0".into(),
            },
            opts("init again"),
        )
        .unwrap();
    assert!(outcome.new_commit.is_none());
    assert!(outcome.conflicts.contains_key("notes/.dataset.json"));

    handle
        .load_dataset("", SerDesRegistry::with_defaults(), Box::new(|_| {}))
        .unwrap();
    // x.json exists, so the proposal steps to the next free name.
    assert_eq!(handle.propose_path("", "x.json").unwrap(), "x-2.json");
    assert_eq!(handle.propose_path("", "free.json").unwrap(), "free.json");
}

#[test]
fn unknown_dataset_is_a_typed_error() {
    let (dir, _repo) = seeded_workdir();
    let mut registry = Registry::new();
    let handle = registry.open(dir.path(), OpenOptions::default()).unwrap();

    let result = handle.get_object("never-loaded", "x.json");
    assert!(matches!(
        result,
        Err(Error::Worker(WorkerError::DatasetNotLoaded(_)))
    ));
}

#[test]
fn opening_past_capacity_evicts_the_oldest() {
    let (dir_a, _repo_a) = seeded_workdir();
    let (dir_b, _repo_b) = seeded_workdir();

    let mut registry = Registry::new();
    registry.open(dir_a.path(), OpenOptions::default()).unwrap();
    assert!(registry.get(dir_a.path()).is_some());

    registry.open(dir_b.path(), OpenOptions::default()).unwrap();
    assert!(registry.get(dir_a.path()).is_none());
    assert!(registry.get(dir_b.path()).is_some());

    assert!(registry.close(dir_b.path()));
    assert!(!registry.close(dir_b.path()));
}

#[test]
fn status_reports_commit_lifecycle() {
    let (dir, _repo) = seeded_workdir();
    let mut registry = Registry::new();
    let handle = registry.open(dir.path(), OpenOptions::default()).unwrap();

    let events = handle.subscribe_status();
    let mut changeset = Changeset::new();
    changeset.insert("s.json", BufferChange::create(text("{}")));
    handle.commit(changeset, opts("status check")).unwrap();

    let mut saw_committing = false;
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while std::time::Instant::now() < deadline {
        match events.try_recv() {
            Ok(RepoStatus::Busy { busy }) if busy.operation == BusyOperation::Committing => {
                saw_committing = true;
                break;
            }
            Ok(_) => {}
            Err(_) => std::thread::sleep(Duration::from_millis(10)),
        }
    }
    assert!(saw_committing);
    assert!(!handle.status().is_busy());
}

/// Holds the writer busy long enough to observe queue admission control.
struct SlowMigration {
    spec: VersionSpec,
}

impl Migration for SlowMigration {
    fn version_spec(&self) -> &VersionSpec {
        &self.spec
    }

    fn target_version(&self) -> &str {
        "2.0.0"
    }

    fn produce(&self, ctx: &mut MigrationContext<'_>) -> Result<Changeset, MigrateError> {
        std::thread::sleep(Duration::from_millis(800));
        let mut changeset = Changeset::new();
        changeset.insert(
            format!("{}/slow.json", ctx.dataset_root),
            BufferChange {
                prior: Prior::Absent,
                next: Some(text("{}")),
            },
        );
        Ok(changeset)
    }
}

#[test]
fn full_queue_past_timeout_is_overloaded_not_a_hang() {
    let (dir, repo) = scratch_repo();
    let meta = serde_json::to_string_pretty(&DatasetMetadata {
        kind: "notes".into(),
        version: "1.0.0".into(),
    })
    .unwrap();
    commit_files(&repo, &[("notes/.dataset.json", meta.as_str())]);

    let mut registry = Registry::new();
    let options = OpenOptions {
        queue_cap: 1,
        enqueue_timeout: Duration::from_millis(50),
        ..OpenOptions::default()
    };
    let handle = registry.open(dir.path(), options).unwrap();

    std::thread::scope(|scope| {
        // Occupies the writer for ~800ms.
        scope.spawn(|| {
            let migrations: Vec<Box<dyn Migration>> = vec![Box::new(SlowMigration {
                spec: VersionSpec::parse("1.0.0").unwrap(),
            })];
            let outcome = handle.migrate("notes", migrations, author()).unwrap();
            assert!(outcome.success);
        });
        std::thread::sleep(Duration::from_millis(150));

        // Fills the single queue slot and blocks on its response.
        scope.spawn(|| {
            let mut changeset = Changeset::new();
            changeset.insert("queued.json", BufferChange::create(text("{}")));
            handle.commit(changeset, opts("queued")).unwrap();
        });
        std::thread::sleep(Duration::from_millis(100));

        // Queue full, writer busy: admission fails fast with a retryable
        // error instead of waiting for the writer.
        let mut changeset = Changeset::new();
        changeset.insert("rejected.json", BufferChange::create(text("{}")));
        let result = handle.commit(changeset, opts("rejected"));
        match result {
            Err(Error::Worker(WorkerError::Overloaded { .. })) => {}
            other => panic!("expected overload, got {other:?}"),
        }
    });
}
