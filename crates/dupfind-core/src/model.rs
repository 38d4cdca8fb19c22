//! Bug records, pairs and model inputs.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Primary key of a bug report.
pub type BugId = u64;

/// Fixed-length embedding produced for one bug.
pub type Vector = Vec<f32>;

/// The six categorical attributes that feed the info encoder.
///
/// Declaration order is the concatenation order of the one-hot info vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum CategoricalField {
    Severity,
    Status,
    Component,
    Priority,
    Product,
    Version,
}

impl CategoricalField {
    pub const ALL: [Self; 6] = [
        Self::Severity,
        Self::Status,
        Self::Component,
        Self::Priority,
        Self::Product,
        Self::Version,
    ];

    /// Key used in `info_dict.json` and the raw bug dumps.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::Severity => "bug_severity",
            Self::Status => "bug_status",
            Self::Component => "component",
            Self::Priority => "priority",
            Self::Product => "product",
            Self::Version => "version",
        }
    }

    /// Accepts both the raw key (`bug_severity`) and the short name (`severity`).
    #[must_use]
    pub fn from_key(raw: &str) -> Option<Self> {
        match raw.trim() {
            "bug_severity" | "severity" => Some(Self::Severity),
            "bug_status" | "status" => Some(Self::Status),
            "component" => Some(Self::Component),
            "priority" => Some(Self::Priority),
            "product" => Some(Self::Product),
            "version" => Some(Self::Version),
            _ => None,
        }
    }
}

impl fmt::Display for CategoricalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// One bug report as held by the bug store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BugRecord {
    pub bug_id: BugId,
    #[serde(alias = "bug_severity", deserialize_with = "category_value")]
    pub severity: String,
    #[serde(alias = "bug_status", deserialize_with = "category_value")]
    pub status: String,
    #[serde(deserialize_with = "category_value")]
    pub component: String,
    #[serde(deserialize_with = "category_value")]
    pub priority: String,
    #[serde(deserialize_with = "category_value")]
    pub product: String,
    #[serde(deserialize_with = "category_value")]
    pub version: String,
    /// Title token ids.
    #[serde(default, alias = "title_word")]
    pub title: Vec<u32>,
    /// Description token ids.
    #[serde(default, alias = "description_word")]
    pub description: Vec<u32>,
}

impl BugRecord {
    #[must_use]
    pub fn category(&self, field: CategoricalField) -> &str {
        match field {
            CategoricalField::Severity => &self.severity,
            CategoricalField::Status => &self.status,
            CategoricalField::Component => &self.component,
            CategoricalField::Priority => &self.priority,
            CategoricalField::Product => &self.product,
            CategoricalField::Version => &self.version,
        }
    }
}

// Raw dumps store some categories as numbers (`"version": 3.1`).
fn category_value<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
        Float(f64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(value) => value,
        Raw::Int(value) => value.to_string(),
        Raw::Float(value) => value.to_string(),
    })
}

/// Which side of a pair an embedding belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairSide {
    A,
    B,
}

impl PairSide {
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

/// An (anchor, duplicate) pair from a train or test file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pair {
    pub dup_a: BugId,
    pub dup_b: BugId,
}

impl Pair {
    #[must_use]
    pub const fn new(dup_a: BugId, dup_b: BugId) -> Self {
        Self { dup_a, dup_b }
    }

    #[must_use]
    pub const fn side(self, side: PairSide) -> BugId {
        match side {
            PairSide::A => self.dup_a,
            PairSide::B => self.dup_b,
        }
    }
}

/// Model input for one bug.
#[derive(Debug, Clone, PartialEq)]
pub struct BugFeatures {
    /// Concatenated one-hot encoding of the categorical fields.
    pub info: Vec<f32>,
    /// Title tokens, padded with `0` to a fixed length.
    pub title: Vec<u32>,
    /// Description tokens, padded with `0` to a fixed length.
    pub description: Vec<u32>,
}
