//! One-hot vocabularies for categorical bug fields and model input assembly.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::debug;

use crate::error::{Result, RetrievalError};
use crate::model::{BugFeatures, BugRecord, CategoricalField};

/// Token id used to pad title and description sequences.
pub const PAD_TOKEN: u32 = 0;

/// Value-to-index mapping for one categorical field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldVocabulary {
    indices: BTreeMap<String, usize>,
    width: usize,
}

impl FieldVocabulary {
    /// The one-hot width is one past the largest index, so sparse index
    /// assignments keep their positions.
    #[must_use]
    pub fn new(indices: BTreeMap<String, usize>) -> Self {
        let width = indices.values().max().map_or(0, |max| max + 1);
        Self { indices, width }
    }

    /// Assign indices in iteration order.
    #[must_use]
    pub fn from_values<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let indices = values
            .into_iter()
            .enumerate()
            .map(|(idx, value)| (value.into(), idx))
            .collect();
        Self::new(indices)
    }

    /// Width of the one-hot vector.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    #[must_use]
    pub fn index_of(&self, value: &str) -> Option<usize> {
        self.indices.get(value).copied()
    }

    /// One-hot encoding of `value`. Unknown values encode as all zeros.
    #[must_use]
    pub fn one_hot(&self, value: &str) -> Vec<f32> {
        let mut out = vec![0.0; self.width];
        if let Some(idx) = self.index_of(value) {
            out[idx] = 1.0;
        }
        out
    }

    /// Append the encoding of `value` to `out`; returns `false` if unknown.
    fn extend_one_hot(&self, value: &str, out: &mut Vec<f32>) -> bool {
        let start = out.len();
        out.resize(start + self.width, 0.0);
        match self.index_of(value) {
            Some(idx) => {
                out[start + idx] = 1.0;
                true
            }
            None => false,
        }
    }
}

/// Vocabularies for all six categorical fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryVocabulary {
    fields: BTreeMap<CategoricalField, FieldVocabulary>,
}

impl CategoryVocabulary {
    /// Build from per-field vocabularies. Every field must be present.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Config`] naming the first missing field.
    pub fn new(fields: BTreeMap<CategoricalField, FieldVocabulary>) -> Result<Self> {
        if let Some(missing) = CategoricalField::ALL
            .into_iter()
            .find(|field| !fields.contains_key(field))
        {
            return Err(RetrievalError::Config(format!(
                "category vocabulary is missing field '{missing}'"
            )));
        }
        Ok(Self { fields })
    }

    /// Load `info_dict.json`: `{ "bug_severity": { "major": 0, ... }, ... }`.
    ///
    /// Keys that are not one of the six fields are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Io`] if the file cannot be read, otherwise
    /// as [`Self::from_json_str`].
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|err| RetrievalError::io(path, err))?;
        Self::from_json_str(&content, &path.display().to_string())
    }

    /// # Errors
    ///
    /// Returns [`RetrievalError::Parse`] on invalid JSON and
    /// [`RetrievalError::Config`] if a field is missing.
    pub fn from_json_str(content: &str, source_name: &str) -> Result<Self> {
        let raw: BTreeMap<String, BTreeMap<String, usize>> = serde_json::from_str(content)
            .map_err(|err| {
                RetrievalError::parse(source_name, Some(err.line()), err.to_string())
            })?;

        let fields = raw
            .into_iter()
            .filter_map(|(key, indices)| {
                CategoricalField::from_key(&key).map(|field| (field, FieldVocabulary::new(indices)))
            })
            .collect();
        Self::new(fields)
    }

    #[must_use]
    pub fn field(&self, field: CategoricalField) -> Option<&FieldVocabulary> {
        self.fields.get(&field)
    }

    /// Total width of the concatenated info vector.
    #[must_use]
    pub fn info_width(&self) -> usize {
        self.fields.values().map(FieldVocabulary::width).sum()
    }

    /// Concatenate the one-hot encodings of all six fields in field order.
    ///
    /// Returns the encoding and the number of values that were not in the
    /// vocabulary.
    #[must_use]
    pub fn encode_info(&self, record: &BugRecord) -> (Vec<f32>, usize) {
        let mut info = Vec::with_capacity(self.info_width());
        let mut unknown = 0;
        for (field, vocab) in &self.fields {
            let value = record.category(*field);
            if !vocab.extend_one_hot(value, &mut info) {
                debug!(bug_id = record.bug_id, %field, value, "unknown categorical value");
                unknown += 1;
            }
        }
        (info, unknown)
    }
}

/// Sequence lengths expected by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureShape {
    pub max_title_len: usize,
    pub max_description_len: usize,
}

impl Default for FeatureShape {
    fn default() -> Self {
        Self {
            max_title_len: 100,
            max_description_len: 100,
        }
    }
}

/// Truncate or right-pad `tokens` to exactly `len` entries.
#[must_use]
pub fn pad_sequence(tokens: &[u32], len: usize) -> Vec<u32> {
    let mut out: Vec<u32> = tokens.iter().copied().take(len).collect();
    out.resize(len, PAD_TOKEN);
    out
}

/// Assemble the model input for one bug.
#[must_use]
pub fn build_features(
    record: &BugRecord,
    vocabulary: &CategoryVocabulary,
    shape: FeatureShape,
) -> (BugFeatures, usize) {
    let (info, unknown) = vocabulary.encode_info(record);
    let features = BugFeatures {
        info,
        title: pad_sequence(&record.title, shape.max_title_len),
        description: pad_sequence(&record.description, shape.max_description_len),
    };
    (features, unknown)
}
