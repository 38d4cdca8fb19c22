//! Duplicate buckets.
//!
//! The bucket table has one row per bug: either a root (`dup_id` is `[]`) or a
//! duplicate pointing at a parent bug. Parent references can chain, so every
//! duplicate is resolved by walking parents until a root is reached. Every
//! id on a walked chain is memoized against its root, making the whole table
//! resolve in a linear number of lookups.
//!
//! # Invariants
//!
//! - Each bucket is keyed by a root bug and contains it.
//! - Buckets partition the ids in the table.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::error::{ChainBreak, Result, RetrievalError};
use crate::model::BugId;
use crate::progress::stage_progress;

/// Per-row duplicate marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DuplicateMarker {
    /// Not a duplicate of anything (`[]`).
    Root,
    DuplicateOf(BugId),
}

impl DuplicateMarker {
    /// Parse a `dup_id` cell: `[]`, empty, `123` or `[123]`.
    ///
    /// # Errors
    ///
    /// Returns a message if the cell is not an id or lists several ids.
    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        let trimmed = raw.trim();
        let inner = trimmed
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(trimmed)
            .trim();

        if inner.is_empty() {
            return Ok(Self::Root);
        }
        if inner.contains(',') {
            return Err(format!("dup_id '{trimmed}' names more than one parent"));
        }
        inner
            .trim_matches(|c| c == '\'' || c == '"')
            .parse::<BugId>()
            .map(Self::DuplicateOf)
            .map_err(|_| format!("invalid dup_id '{trimmed}'"))
    }
}

/// One row of the bucket table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketRow {
    pub bug_id: BugId,
    pub marker: DuplicateMarker,
}

impl BucketRow {
    #[must_use]
    pub const fn root(bug_id: BugId) -> Self {
        Self {
            bug_id,
            marker: DuplicateMarker::Root,
        }
    }

    #[must_use]
    pub const fn duplicate(bug_id: BugId, parent: BugId) -> Self {
        Self {
            bug_id,
            marker: DuplicateMarker::DuplicateOf(parent),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    bug_id: BugId,
    #[serde(default)]
    dup_id: String,
}

/// Read `bug_id` / `dup_id` columns from a CSV bucket table.
///
/// Other columns are ignored.
///
/// # Errors
///
/// Returns [`RetrievalError::Io`] if the file cannot be opened, otherwise
/// as [`parse_bucket_table`].
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_bucket_table(path: &Path) -> Result<Vec<BucketRow>> {
    let file = File::open(path).map_err(|err| RetrievalError::io(path, err))?;
    let rows = parse_bucket_table(file, &path.display().to_string())?;
    info!(rows = rows.len(), "bucket table loaded");
    Ok(rows)
}

/// # Errors
///
/// Returns [`RetrievalError::Parse`] if a required column is missing, a
/// row has a malformed id or marker, or a bug id repeats.
pub fn parse_bucket_table<R: std::io::Read>(reader: R, source_name: &str) -> Result<Vec<BucketRow>> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = csv_reader
        .headers()
        .map_err(|err| RetrievalError::parse(source_name, Some(1), err.to_string()))?
        .clone();
    for required in ["bug_id", "dup_id"] {
        if !headers.iter().any(|header| header == required) {
            return Err(RetrievalError::parse(
                source_name,
                Some(1),
                format!("missing column '{required}'"),
            ));
        }
    }

    let mut rows = Vec::new();
    let mut first_lines: HashMap<BugId, Option<usize>> = HashMap::new();
    for record in csv_reader.records() {
        let record = record.map_err(|err| {
            let line = err.position().and_then(|pos| usize::try_from(pos.line()).ok());
            RetrievalError::parse(source_name, line, err.to_string())
        })?;
        let line = record.position().and_then(|pos| usize::try_from(pos.line()).ok());
        let row: CsvRow = record
            .deserialize(Some(&headers))
            .map_err(|err| RetrievalError::parse(source_name, line, err.to_string()))?;
        let marker = DuplicateMarker::parse(&row.dup_id)
            .map_err(|message| RetrievalError::parse(source_name, line, message))?;
        if let Some(first) = first_lines.insert(row.bug_id, line) {
            let seen =
                first.map_or_else(String::new, |first| format!(" (first at line {first})"));
            return Err(RetrievalError::parse(
                source_name,
                line,
                format!("bug {} has more than one row{seen}", row.bug_id),
            ));
        }
        rows.push(BucketRow {
            bug_id: row.bug_id,
            marker,
        });
    }
    Ok(rows)
}

/// Disjoint duplicate buckets keyed by their root ("master") bug.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buckets {
    members: BTreeMap<BugId, BTreeSet<BugId>>,
    master_of: HashMap<BugId, BugId>,
}

impl Buckets {
    /// Root of the bucket that holds `bug_id`.
    #[must_use]
    pub fn master_of(&self, bug_id: BugId) -> Option<BugId> {
        self.master_of.get(&bug_id).copied()
    }

    /// Root of `bug_id`'s bucket, or `bug_id` itself when it is not in the table.
    #[must_use]
    pub fn master_or_self(&self, bug_id: BugId) -> BugId {
        self.master_of(bug_id).unwrap_or(bug_id)
    }

    #[must_use]
    pub fn bucket(&self, master: BugId) -> Option<&BTreeSet<BugId>> {
        self.members.get(&master)
    }

    #[must_use]
    pub fn contains(&self, bug_id: BugId) -> bool {
        self.master_of.contains_key(&bug_id)
    }

    pub fn masters(&self) -> impl Iterator<Item = BugId> + '_ {
        self.members.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (BugId, &BTreeSet<BugId>)> + '_ {
        self.members.iter().map(|(master, members)| (*master, members))
    }

    /// Number of buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Number of bugs across all buckets.
    #[must_use]
    pub fn bug_count(&self) -> usize {
        self.master_of.len()
    }
}

/// Resolve the bucket table into buckets.
///
/// # Errors
///
/// - [`RetrievalError::Parse`] if a bug id has more than one row.
/// - [`RetrievalError::UnresolvedBucketChain`] if a chain has a cycle or
///   points at a bug with no row.
#[instrument(skip_all, fields(rows = rows.len()))]
pub fn build_buckets(rows: &[BucketRow]) -> Result<Buckets> {
    let mut parents: HashMap<BugId, DuplicateMarker> = HashMap::with_capacity(rows.len());
    for row in rows {
        if parents.insert(row.bug_id, row.marker).is_some() {
            return Err(RetrievalError::parse(
                "bucket rows",
                None,
                format!("bug {} has more than one row", row.bug_id),
            ));
        }
    }

    let mut buckets = Buckets::default();
    for row in rows.iter().filter(|row| row.marker == DuplicateMarker::Root) {
        buckets
            .members
            .insert(row.bug_id, BTreeSet::from([row.bug_id]));
        buckets.master_of.insert(row.bug_id, row.bug_id);
    }
    info!(roots = buckets.len(), "bucket roots created");

    let duplicates: Vec<(BugId, BugId)> = rows
        .iter()
        .filter_map(|row| match row.marker {
            DuplicateMarker::DuplicateOf(parent) => Some((row.bug_id, parent)),
            DuplicateMarker::Root => None,
        })
        .collect();

    let progress = stage_progress(duplicates.len(), "filling buckets");
    for &(bug_id, parent) in &duplicates {
        let master = resolve_master(bug_id, parent, &parents, &mut buckets.master_of)?;
        buckets.members.entry(master).or_default().insert(bug_id);
        progress.inc(1);
    }
    progress.finish_and_clear();

    info!(
        buckets = buckets.len(),
        bugs = buckets.bug_count(),
        duplicates = duplicates.len(),
        "buckets built"
    );
    Ok(buckets)
}

fn resolve_master(
    bug_id: BugId,
    parent: BugId,
    parents: &HashMap<BugId, DuplicateMarker>,
    master_of: &mut HashMap<BugId, BugId>,
) -> Result<BugId> {
    let mut chain = vec![bug_id];
    let mut visited = HashSet::from([bug_id]);
    let mut cursor = parent;

    let master = loop {
        if let Some(&master) = master_of.get(&cursor) {
            break master;
        }
        if !visited.insert(cursor) {
            return Err(RetrievalError::UnresolvedBucketChain {
                bug_id,
                chain,
                reason: ChainBreak::Cycle { at: cursor },
            });
        }
        match parents.get(&cursor) {
            Some(DuplicateMarker::DuplicateOf(next)) => {
                chain.push(cursor);
                cursor = *next;
            }
            // Roots are seeded into `master_of` before any chain is walked.
            Some(DuplicateMarker::Root) => break cursor,
            None => {
                return Err(RetrievalError::UnresolvedBucketChain {
                    bug_id,
                    chain,
                    reason: ChainBreak::Dangling { parent: cursor },
                });
            }
        }
    };

    if chain.len() > 1 {
        debug!(bug_id, master, depth = chain.len(), "resolved duplicate chain");
    }
    for id in chain {
        master_of.insert(id, master);
    }
    Ok(master)
}
