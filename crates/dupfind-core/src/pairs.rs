//! Train and test pair files.
//!
//! Each line is a whitespace-separated group of bug ids: the first is the
//! anchor, every following id is one of its known duplicates.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::{info, instrument};

use crate::error::{Result, RetrievalError};
use crate::model::{BugId, Pair};

/// Load every pair from the file at `path`, in file order.
///
/// # Errors
///
/// Returns [`RetrievalError::Io`] if the file cannot be opened and
/// [`RetrievalError::Parse`] on a malformed line.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_pairs(path: &Path) -> Result<Vec<Pair>> {
    let file = File::open(path).map_err(|err| RetrievalError::io(path, err))?;
    let pairs = parse_pairs(BufReader::new(file), &path.display().to_string())?;
    info!(pairs = pairs.len(), "pairs loaded");
    Ok(pairs)
}

/// Parse pair groups from any buffered reader. Blank lines are skipped.
///
/// # Errors
///
/// Returns [`RetrievalError::Parse`] naming the line of the first
/// non-integer token.
pub fn parse_pairs<R: BufRead>(reader: R, source_name: &str) -> Result<Vec<Pair>> {
    let mut pairs = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.map_err(|err| {
            RetrievalError::parse(source_name, Some(line_no), format!("unreadable line: {err}"))
        })?;
        let ids = parse_group(&line)
            .map_err(|message| RetrievalError::parse(source_name, Some(line_no), message))?;

        if let Some((&anchor, duplicates)) = ids.split_first() {
            pairs.extend(duplicates.iter().map(|&dup| Pair::new(anchor, dup)));
        }
    }
    Ok(pairs)
}

fn parse_group(line: &str) -> std::result::Result<Vec<BugId>, String> {
    line.split_whitespace()
        .map(|token| {
            token
                .parse::<BugId>()
                .map_err(|_| format!("invalid bug id '{token}'"))
        })
        .collect()
}

/// Distinct bug ids across `pairs`, ascending.
#[must_use]
pub fn distinct_bug_ids(pairs: &[Pair]) -> BTreeSet<BugId> {
    pairs
        .iter()
        .flat_map(|pair| [pair.dup_a, pair.dup_b])
        .collect()
}
