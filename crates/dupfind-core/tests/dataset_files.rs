use dupfind_core::vocab::{FeatureShape, build_features};
use dupfind_core::{
    BugStore, JsonlBugStore, Pair, RetrievalError, Stage, build_buckets, distinct_bug_ids,
    load_bucket_table, load_pairs,
};

const VOCABULARY: &str = r#"{
    "bug_severity": {"minor": 0, "major": 1},
    "bug_status": {"NEW": 0, "CLOSED": 1},
    "component": {"UI": 0},
    "priority": {"P1": 0, "P3": 1},
    "product": {"Platform": 0},
    "version": {"3.0": 0, "3.1": 1},
    "resolution": {"FIXED": 0}
}"#;

const BUGS: &str = r#"{"bug_id": 100, "bug_severity": "major", "bug_status": "CLOSED", "component": "UI", "priority": "P3", "product": "Platform", "version": 3.1, "title_word": [4, 5, 6], "description_word": [7]}
{"bug_id": 101, "bug_severity": "minor", "bug_status": "NEW", "component": "UI", "priority": "P1", "product": "Platform", "version": "3.0", "title_word": [], "description_word": [8, 9]}
"#;

fn dataset() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("info_dict.json"), VOCABULARY).expect("vocabulary");
    std::fs::write(dir.path().join("bugs.jsonl"), BUGS).expect("bugs");
    dir
}

// ---------------------------------------------------------------------------
// Bug store
// ---------------------------------------------------------------------------

#[test]
fn store_opens_dataset_directory() {
    let dir = dataset();
    let store = JsonlBugStore::open(dir.path()).expect("open");

    assert_eq!(store.len(), 2);
    assert_eq!(store.vocabulary().info_width(), 10);
    let record = store.get(100, Stage::TrainInference).expect("record");
    assert_eq!(record.version, "3.1");

    let err = store.get(7, Stage::TrainInference).unwrap_err();
    assert_eq!(
        err.to_string(),
        "bug 7 not found in bug store (stage: train-inference)"
    );
}

#[test]
fn features_follow_field_order_and_pad_sequences() {
    let dir = dataset();
    let store = JsonlBugStore::open(dir.path()).expect("open");
    let shape = FeatureShape {
        max_title_len: 2,
        max_description_len: 4,
    };

    let record = store.get(100, Stage::TestInference).expect("record");
    let (features, unknown) = build_features(record, store.vocabulary(), shape);

    assert_eq!(unknown, 0);
    // severity(2) status(2) component(1) priority(2) product(1) version(2)
    assert_eq!(
        features.info,
        vec![0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0]
    );
    assert_eq!(features.title, vec![4, 5]);
    assert_eq!(features.description, vec![7, 0, 0, 0]);
}

#[test]
fn malformed_record_line_is_reported_with_line_number() {
    let dir = dataset();
    std::fs::write(dir.path().join("bugs.jsonl"), "{\"bug_id\": 1}\n").expect("bugs");

    let err = JsonlBugStore::open(dir.path()).unwrap_err();
    assert!(matches!(err, RetrievalError::Parse { line: Some(1), .. }), "got: {err}");
}

// ---------------------------------------------------------------------------
// Bucket table and pair files
// ---------------------------------------------------------------------------

#[test]
fn bucket_table_and_pairs_load_from_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let csv = dir.path().join("eclipse.csv");
    std::fs::write(&csv, "bug_id,dup_id\n1,[]\n2,[1]\n3,2\n4,[]\n").expect("csv");
    let pairs_path = dir.path().join("train.txt");
    std::fs::write(&pairs_path, "1 2 3\n4\n").expect("pairs");

    let buckets = build_buckets(&load_bucket_table(&csv).expect("rows")).expect("buckets");
    assert_eq!(buckets.len(), 2);
    assert_eq!(buckets.master_of(3), Some(1));
    assert_eq!(buckets.master_of(4), Some(4));

    let pairs = load_pairs(&pairs_path).expect("pairs");
    assert_eq!(pairs, vec![Pair::new(1, 2), Pair::new(1, 3)]);
    assert_eq!(distinct_bug_ids(&pairs).into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
}
