//! Read-only bug store.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::{info, instrument};

use crate::error::{Result, RetrievalError, Stage};
use crate::model::{BugId, BugRecord};
use crate::vocab::CategoryVocabulary;

/// Bug records file inside a dataset directory.
pub const BUGS_FILENAME: &str = "bugs.jsonl";
/// Categorical vocabulary file inside a dataset directory.
pub const VOCABULARY_FILENAME: &str = "info_dict.json";

/// Lookup of bug records by id. Shared read-only across inference workers.
pub trait BugStore: Sync {
    fn record(&self, bug_id: BugId) -> Option<&BugRecord>;

    fn vocabulary(&self) -> &CategoryVocabulary;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch a record.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::BugNotFound`] tagged with `stage` if the id
    /// has no record.
    fn get(&self, bug_id: BugId, stage: Stage) -> Result<&BugRecord> {
        self.record(bug_id)
            .ok_or(RetrievalError::BugNotFound { bug_id, stage })
    }
}

/// Bug store backed by a JSON Lines dump held fully in memory.
#[derive(Debug, Clone)]
pub struct JsonlBugStore {
    records: HashMap<BugId, BugRecord>,
    vocabulary: CategoryVocabulary,
}

impl JsonlBugStore {
    /// Open `<dataset_dir>/bugs.jsonl` and `<dataset_dir>/info_dict.json`.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Io`] if a file is missing and
    /// [`RetrievalError::Parse`] on a malformed record or duplicate id.
    #[instrument(skip_all, fields(dataset_dir = %dataset_dir.display()))]
    pub fn open(dataset_dir: &Path) -> Result<Self> {
        let vocabulary = CategoryVocabulary::load(&dataset_dir.join(VOCABULARY_FILENAME))?;

        let bugs_path = dataset_dir.join(BUGS_FILENAME);
        let file = File::open(&bugs_path).map_err(|err| RetrievalError::io(&bugs_path, err))?;
        let records = read_records(BufReader::new(file), &bugs_path.display().to_string())?;

        let store = Self::from_records(records, vocabulary)?;
        info!(bugs = store.len(), "bug store loaded");
        Ok(store)
    }

    /// Build a store from already-parsed records. Ids must be unique.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Parse`] if two records share an id.
    pub fn from_records(
        records: impl IntoIterator<Item = BugRecord>,
        vocabulary: CategoryVocabulary,
    ) -> Result<Self> {
        let mut by_id = HashMap::new();
        for record in records {
            let bug_id = record.bug_id;
            if by_id.insert(bug_id, record).is_some() {
                return Err(RetrievalError::parse(
                    BUGS_FILENAME,
                    None,
                    format!("duplicate record for bug {bug_id}"),
                ));
            }
        }
        Ok(Self {
            records: by_id,
            vocabulary,
        })
    }
}

impl BugStore for JsonlBugStore {
    fn record(&self, bug_id: BugId) -> Option<&BugRecord> {
        self.records.get(&bug_id)
    }

    fn vocabulary(&self) -> &CategoryVocabulary {
        &self.vocabulary
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

fn read_records<R: BufRead>(reader: R, source_name: &str) -> Result<Vec<BugRecord>> {
    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.map_err(|err| {
            RetrievalError::parse(source_name, Some(line_no), format!("unreadable line: {err}"))
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record: BugRecord = serde_json::from_str(trimmed)
            .map_err(|err| RetrievalError::parse(source_name, Some(line_no), err.to_string()))?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::model::CategoricalField;
    use crate::vocab::FieldVocabulary;

    fn vocabulary() -> CategoryVocabulary {
        let fields: BTreeMap<_, _> = CategoricalField::ALL
            .into_iter()
            .map(|field| (field, FieldVocabulary::from_values(["x"])))
            .collect();
        CategoryVocabulary::new(fields).expect("vocabulary")
    }

    const LINES: &str = r#"{"bug_id": 1, "bug_severity": "x", "bug_status": "x", "component": "x", "priority": "x", "product": "x", "version": "x", "title_word": [1], "description_word": [2]}

{"bug_id": 2, "severity": "x", "status": "x", "component": "x", "priority": "x", "product": "x", "version": "x"}
"#;

    #[test]
    fn reads_records_and_skips_blank_lines() {
        let records = read_records(LINES.as_bytes(), "bugs.jsonl").expect("parse");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].bug_id, 2);
        assert!(records[1].title.is_empty());
    }

    #[test]
    fn malformed_line_reports_line_number() {
        let err = read_records("{\"bug_id\": 1}\n".as_bytes(), "bugs.jsonl").unwrap_err();
        assert!(err.to_string().contains("bugs.jsonl:1"), "got: {err}");
    }

    #[test]
    fn missing_bug_is_not_found_with_stage() {
        let records = read_records(LINES.as_bytes(), "bugs.jsonl").expect("parse");
        let store = JsonlBugStore::from_records(records, vocabulary()).expect("store");

        assert!(store.get(1, Stage::TrainInference).is_ok());
        let err = store.get(99, Stage::TestInference).unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::BugNotFound {
                bug_id: 99,
                stage: Stage::TestInference
            }
        ));
    }

    #[test]
    fn duplicate_records_are_rejected() {
        let mut records = read_records(LINES.as_bytes(), "bugs.jsonl").expect("parse");
        records.push(records[0].clone());
        let err = JsonlBugStore::from_records(records, vocabulary()).unwrap_err();
        assert!(err.to_string().contains("duplicate record"));
    }

    #[test]
    fn open_reads_dataset_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(BUGS_FILENAME), LINES).expect("write bugs");
        std::fs::write(
            dir.path().join(VOCABULARY_FILENAME),
            r#"{"bug_severity": {"x": 0}, "bug_status": {"x": 0}, "component": {"x": 0},
                "priority": {"x": 0}, "product": {"x": 0}, "version": {"x": 0}}"#,
        )
        .expect("write vocabulary");

        let store = JsonlBugStore::open(dir.path()).expect("open");
        assert_eq!(store.len(), 2);
        assert_eq!(store.vocabulary().info_width(), 6);
    }
}
