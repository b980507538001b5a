//! Index engine: default build, incremental maintenance, filtered indexes.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Value, json};
use strata::Dataset;
use strata::index::{FieldEquals, IndexProgress};
use strata::marshal::SerDesRegistry;

use common::*;

fn load_dataset(repo: &git2::Repository, root: &str) -> Dataset {
    Dataset::load(
        repo,
        root,
        SerDesRegistry::with_defaults(),
        Box::new(|_| {}),
    )
    .expect("dataset load")
}

/// Object mapping for every on-disk object path, via the default index.
fn snapshot(repo: &git2::Repository, dataset: &Dataset, root: &str) -> BTreeMap<String, Value> {
    let workdir = repo.workdir().unwrap();
    let mut out = BTreeMap::new();
    for path in strata::buffer::list_descendant_paths(workdir, root).unwrap() {
        let object_path = strata::marshal::object_path_for(&path);
        if let Some(object) = dataset.object(&object_path).unwrap() {
            out.insert(object_path, object);
        }
    }
    out
}

#[test]
fn default_build_counts_and_deserializes() {
    let (_dir, repo) = scratch_repo();
    commit_files(
        &repo,
        &[
            ("a.json", r#"{"tag":"A"}"#),
            ("b.json", r#"{"tag":"B"}"#),
            ("card.bundle/front.json", r#"{"text":"hi"}"#),
            ("card.bundle/back.json", r#"{"text":"bye"}"#),
        ],
    );

    let dataset = load_dataset(&repo, "");
    let status = dataset.status();
    assert!(status.is_settled());
    assert_eq!(status.object_count, 3);

    assert_eq!(dataset.object("a.json").unwrap(), Some(json!({"tag": "A"})));
    assert_eq!(
        dataset.object("card.bundle").unwrap(),
        Some(json!({
            "front.json": {"text": "hi"},
            "back.json": {"text": "bye"},
        }))
    );
    assert_eq!(dataset.object("missing.json").unwrap(), None);
}

#[test]
fn build_reports_counting_then_indexing_progress() {
    let (_dir, repo) = scratch_repo();
    commit_files(&repo, &[("a.json", "1"), ("b.json", "2")]);

    let events: Arc<std::sync::Mutex<Vec<IndexProgress>>> = Arc::default();
    let sink = {
        let events = Arc::clone(&events);
        Box::new(move |progress| events.lock().unwrap().push(progress))
    };
    let dataset = Dataset::load(&repo, "", SerDesRegistry::with_defaults(), sink).unwrap();
    drop(dataset);

    let events = events.lock().unwrap();
    assert!(!events.is_empty());
    assert_eq!(events[0].phase, "counting");
    // The settled count is reported through the status, not the sink.
}

#[test]
fn rebuild_is_idempotent() {
    let (_dir, repo) = scratch_repo();
    commit_files(&repo, &[("a.json", r#"{"n":1}"#), ("b.json", r#"{"n":2}"#)]);

    let first = load_dataset(&repo, "");
    let count = first.status().object_count;
    let before = snapshot(&repo, &first, "");
    drop(first);

    let second = load_dataset(&repo, "");
    assert_eq!(second.status().object_count, count);
    assert_eq!(snapshot(&repo, &second, ""), before);
}

#[test]
fn incremental_updates_converge_with_scratch_rebuild() {
    let (dir, repo) = scratch_repo();
    let c0 = commit_files(
        &repo,
        &[
            ("data/a.json", r#"{"tag":"A"}"#),
            ("data/b.json", r#"{"tag":"B"}"#),
        ],
    );

    let mut dataset = load_dataset(&repo, "data");

    let c1 = commit_files(
        &repo,
        &[
            ("data/a.json", r#"{"tag":"Z"}"#),
            ("data/c.json", r#"{"tag":"C"}"#),
        ],
    );
    dataset.apply_commit(&repo, c0, c1).unwrap();

    let c2 = delete_files(&repo, &["data/b.json"]);
    dataset.apply_commit(&repo, c1, c2).unwrap();

    assert_eq!(dataset.status().object_count, 2);
    assert_eq!(
        dataset.object("data/a.json").unwrap(),
        Some(json!({"tag": "Z"}))
    );
    assert_eq!(dataset.object("data/b.json").unwrap(), None);
    let incremental = snapshot(&repo, &dataset, "data");
    drop(dataset);

    // Scratch rebuild: discard the cache and index from nothing.
    let db = strata::paths::index_db_path(dir.path(), "data");
    std::fs::remove_file(&db).unwrap();
    let rebuilt = load_dataset(&repo, "data");
    assert_eq!(snapshot(&repo, &rebuilt, "data"), incremental);
    assert_eq!(rebuilt.status().object_count, 2);
}

#[test]
fn reapplying_a_transition_is_idempotent() {
    let (_dir, repo) = scratch_repo();
    let c0 = commit_files(&repo, &[("a.json", r#"{"n":1}"#)]);
    let mut dataset = load_dataset(&repo, "");

    let c1 = commit_files(&repo, &[("a.json", r#"{"n":2}"#)]);
    dataset.apply_commit(&repo, c0, c1).unwrap();
    let first = snapshot(&repo, &dataset, "");

    dataset.apply_commit(&repo, c0, c1).unwrap();
    assert_eq!(snapshot(&repo, &dataset, ""), first);
}

#[test]
fn filtered_index_assigns_dense_positions() {
    let (_dir, repo) = scratch_repo();
    commit_files(
        &repo,
        &[
            ("x.json", r#"{"tag":"A"}"#),
            ("y.json", r#"{"tag":"B"}"#),
            ("z.json", r#"{"tag":"A"}"#),
        ],
    );
    let mut dataset = load_dataset(&repo, "");

    let (id, status) = dataset
        .ensure_filtered(Arc::new(FieldEquals::new("/tag", json!("A"))))
        .unwrap();
    assert_eq!(status.object_count, 2);
    assert!(status.is_settled());

    // Dense positions in default-index iteration order.
    assert_eq!(dataset.filtered_path_at(&id, 0).unwrap(), Some("x.json".into()));
    assert_eq!(dataset.filtered_path_at(&id, 1).unwrap(), Some("z.json".into()));
    assert_eq!(dataset.filtered_path_at(&id, 2).unwrap(), None);
    assert_eq!(dataset.filtered_position_of(&id, "z.json").unwrap(), Some(1));
    assert_eq!(dataset.filtered_position_of(&id, "y.json").unwrap(), None);
}

#[test]
fn identical_predicate_reuses_the_same_index() {
    let (_dir, repo) = scratch_repo();
    commit_files(&repo, &[("x.json", r#"{"tag":"A"}"#)]);
    let mut dataset = load_dataset(&repo, "");

    let (first, _) = dataset
        .ensure_filtered(Arc::new(FieldEquals::new("/tag", json!("A"))))
        .unwrap();
    let (second, _) = dataset
        .ensure_filtered(Arc::new(FieldEquals::new("/tag", json!("A"))))
        .unwrap();
    assert_eq!(first, second);

    let (other, _) = dataset
        .ensure_filtered(Arc::new(FieldEquals::new("/tag", json!("B"))))
        .unwrap();
    assert_ne!(first, other);
}

#[test]
fn changed_object_leaves_affected_filtered_index() {
    let (_dir, repo) = scratch_repo();
    let c0 = commit_files(
        &repo,
        &[("x.json", r#"{"tag":"A"}"#), ("z.json", r#"{"tag":"A"}"#)],
    );
    let mut dataset = load_dataset(&repo, "");
    let (id, status) = dataset
        .ensure_filtered(Arc::new(FieldEquals::new("/tag", json!("A"))))
        .unwrap();
    assert_eq!(status.object_count, 2);

    // x flips from A to B: it must drop out of the filtered index.
    let c1 = commit_files(&repo, &[("x.json", r#"{"tag":"B"}"#)]);
    dataset.apply_commit(&repo, c0, c1).unwrap();

    assert_eq!(dataset.filtered_status(&id).unwrap().object_count, 1);
    assert_eq!(dataset.filtered_path_at(&id, 0).unwrap(), Some("z.json".into()));
    assert_eq!(dataset.filtered_path_at(&id, 1).unwrap(), None);
    assert_eq!(dataset.filtered_position_of(&id, "x.json").unwrap(), None);
}

#[test]
fn one_batch_invalidates_every_affected_filtered_index() {
    let (_dir, repo) = scratch_repo();
    let c0 = commit_files(
        &repo,
        &[
            ("x.json", r#"{"tag":"A"}"#),
            ("y.json", r#"{"tag":"B"}"#),
            ("w.json", r#"{"tag":"C"}"#),
        ],
    );
    let mut dataset = load_dataset(&repo, "");

    let (id_a, _) = dataset
        .ensure_filtered(Arc::new(FieldEquals::new("/tag", json!("A"))))
        .unwrap();
    let (id_b, _) = dataset
        .ensure_filtered(Arc::new(FieldEquals::new("/tag", json!("B"))))
        .unwrap();
    let (id_c, _) = dataset
        .ensure_filtered(Arc::new(FieldEquals::new("/tag", json!("C"))))
        .unwrap();

    // One commit moves x from A to B: both the A and B indexes are
    // affected and must rebuild; C is untouched.
    let c1 = commit_files(&repo, &[("x.json", r#"{"tag":"B"}"#)]);
    dataset.apply_commit(&repo, c0, c1).unwrap();

    assert_eq!(dataset.filtered_status(&id_a).unwrap().object_count, 0);
    let b = dataset.filtered_status(&id_b).unwrap();
    assert_eq!(b.object_count, 2);
    assert_eq!(dataset.filtered_path_at(&id_b, 0).unwrap(), Some("x.json".into()));
    assert_eq!(dataset.filtered_path_at(&id_b, 1).unwrap(), Some("y.json".into()));
    assert_eq!(dataset.filtered_status(&id_c).unwrap().object_count, 1);
    assert_eq!(dataset.filtered_path_at(&id_c, 0).unwrap(), Some("w.json".into()));
}

#[test]
fn composite_object_disappears_when_all_members_removed() {
    let (_dir, repo) = scratch_repo();
    let c0 = commit_files(
        &repo,
        &[
            ("card.bundle/front.json", r#"{"text":"hi"}"#),
            ("plain.json", r#"{"n":1}"#),
        ],
    );
    let mut dataset = load_dataset(&repo, "");
    assert_eq!(dataset.status().object_count, 2);

    let c1 = delete_files(&repo, &["card.bundle/front.json"]);
    dataset.apply_commit(&repo, c0, c1).unwrap();

    assert_eq!(dataset.object("card.bundle").unwrap(), None);
    assert_eq!(dataset.status().object_count, 1);
}

#[test]
fn stale_cache_entries_are_swept_on_load()  {
    let (_dir, repo) = scratch_repo();
    commit_files(&repo, &[("a.json", "1"), ("b.json", "2")]);
    let dataset = load_dataset(&repo, "");
    assert_eq!(dataset.status().object_count, 2);
    drop(dataset);

    // b.json vanishes while the dataset is unloaded.
    delete_files(&repo, &["b.json"]);

    let dataset = load_dataset(&repo, "");
    assert_eq!(dataset.status().object_count, 1);
    assert_eq!(dataset.object("b.json").unwrap(), None);
}
