use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, RetrievalError};
use crate::vocab::FeatureShape;

/// Per-dataset config file, looked up in the dataset directory.
pub const DATASET_CONFIG_FILENAME: &str = "dupfind.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model identifier; defaults to the dataset name's file stem.
    #[serde(default)]
    pub name: Option<String>,
    /// Directory holding `<name>.safetensors`; defaults to `<base>/models`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Optional SHA-256 pin for the model file.
    #[serde(default)]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_sequence_len")]
    pub max_title_len: usize,
    #[serde(default = "default_sequence_len")]
    pub max_description_len: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_title_len: default_sequence_len(),
            max_description_len: default_sequence_len(),
        }
    }
}

impl InferenceConfig {
    #[must_use]
    pub const fn feature_shape(&self) -> FeatureShape {
        FeatureShape {
            max_title_len: self.max_title_len,
            max_description_len: self.max_description_len,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_leaf_size")]
    pub leaf_size: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            leaf_size: default_leaf_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_recall_at")]
    pub recall_at: Vec<usize>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            recall_at: default_recall_at(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_true")]
    pub write_ranks: bool,
    /// Defaults to `<base>/ranks.jsonl`.
    #[serde(default)]
    pub ranks_path: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            write_ranks: default_true(),
            ranks_path: None,
        }
    }
}

impl RetrievalConfig {
    /// Model identifier for `dataset_name` (`eclipse.csv` → `eclipse`).
    #[must_use]
    pub fn model_name(&self, dataset_name: &str) -> String {
        self.model.name.clone().unwrap_or_else(|| {
            Path::new(dataset_name)
                .file_stem()
                .map_or_else(|| dataset_name.to_string(), |stem| stem.to_string_lossy().into_owned())
        })
    }

    #[must_use]
    pub fn models_dir(&self, base_path: &Path) -> PathBuf {
        self.model
            .dir
            .clone()
            .unwrap_or_else(|| base_path.join("models"))
    }

    #[must_use]
    pub fn ranks_path(&self, base_path: &Path) -> PathBuf {
        self.output
            .ranks_path
            .clone()
            .unwrap_or_else(|| base_path.join("ranks.jsonl"))
    }

    /// # Errors
    ///
    /// Returns [`RetrievalError::Config`] naming the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.inference.batch_size == 0 {
            return Err(RetrievalError::Config(
                "inference.batch_size must be at least 1".into(),
            ));
        }
        if self.index.k == 0 {
            return Err(RetrievalError::Config("index.k must be at least 1".into()));
        }
        if self.index.leaf_size == 0 {
            return Err(RetrievalError::Config(
                "index.leaf_size must be at least 1".into(),
            ));
        }
        if self.evaluation.recall_at.contains(&0) {
            return Err(RetrievalError::Config(
                "evaluation.recall_at entries must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Resolve the effective config for a dataset directory.
///
/// Precedence (highest wins): `<base>/dupfind.toml`, then the user config at
/// `<config_dir>/dupfind/config.toml`, then built-in defaults. Tables merge
/// key by key.
///
/// # Errors
///
/// Returns [`RetrievalError::Io`] if a present file cannot be read and
/// [`RetrievalError::Config`] if a layer is malformed or invalid.
pub fn resolve_config(base_path: &Path) -> Result<RetrievalConfig> {
    let user = dirs::config_dir().map(|dir| dir.join("dupfind/config.toml"));
    resolve_config_from(user.as_deref(), &base_path.join(DATASET_CONFIG_FILENAME))
}

/// [`resolve_config`] with explicit layer paths; `None` skips the user layer.
///
/// # Errors
///
/// Same as [`resolve_config`].
pub fn resolve_config_from(
    user_path: Option<&Path>,
    dataset_path: &Path,
) -> Result<RetrievalConfig> {
    let mut merged = toml::Value::Table(toml::Table::new());
    for path in user_path.into_iter().chain([dataset_path]) {
        if let Some(layer) = read_layer(path)? {
            merge_toml(&mut merged, layer);
        }
    }

    let config: RetrievalConfig = merged
        .try_into()
        .map_err(|err| RetrievalError::Config(format!("invalid configuration: {err}")))?;
    config.validate()?;
    Ok(config)
}

fn read_layer(path: &Path) -> Result<Option<toml::Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).map_err(|err| RetrievalError::io(path, err))?;
    content
        .parse::<toml::Table>()
        .map(|table| Some(toml::Value::Table(table)))
        .map_err(|err| RetrievalError::Config(format!("failed to parse {}: {err}", path.display())))
}

fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_toml(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

const fn default_true() -> bool {
    true
}

const fn default_batch_size() -> usize {
    64
}

const fn default_sequence_len() -> usize {
    100
}

const fn default_k() -> usize {
    20
}

const fn default_leaf_size() -> usize {
    30
}

fn default_recall_at() -> Vec<usize> {
    vec![1, 5, 10, 20]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_use_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = resolve_config_from(None, &dir.path().join(DATASET_CONFIG_FILENAME))
            .expect("resolve should succeed");

        assert_eq!(cfg, RetrievalConfig::default());
        assert_eq!(cfg.index.k, 20);
        assert_eq!(cfg.inference.batch_size, 64);
        assert_eq!(cfg.inference.feature_shape(), FeatureShape::default());
        assert_eq!(cfg.evaluation.recall_at, vec![1, 5, 10, 20]);
        assert!(cfg.output.write_ranks);
    }

    #[test]
    fn dataset_layer_overrides_user_layer_key_by_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let user = dir.path().join("user.toml");
        let dataset = dir.path().join(DATASET_CONFIG_FILENAME);
        std::fs::write(&user, "[index]\nk = 5\nleaf_size = 8\n[model]\nname = \"user-model\"\n")
            .expect("write user");
        std::fs::write(&dataset, "[index]\nk = 10\n").expect("write dataset");

        let cfg = resolve_config_from(Some(&user), &dataset).expect("resolve");
        assert_eq!(cfg.index.k, 10);
        assert_eq!(cfg.index.leaf_size, 8);
        assert_eq!(cfg.model.name.as_deref(), Some("user-model"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dataset = dir.path().join(DATASET_CONFIG_FILENAME);
        std::fs::write(&dataset, "[inference]\nbatch_size = 0\n").expect("write");

        let err = resolve_config_from(None, &dataset).unwrap_err();
        assert!(err.to_string().contains("batch_size"), "got: {err}");
    }

    #[test]
    fn syntax_error_is_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dataset = dir.path().join(DATASET_CONFIG_FILENAME);
        std::fs::write(&dataset, "[index\n").expect("write");

        let err = resolve_config_from(None, &dataset).unwrap_err();
        assert!(matches!(err, RetrievalError::Config(_)));
    }

    #[test]
    fn model_name_defaults_to_dataset_stem() {
        let cfg = RetrievalConfig::default();
        assert_eq!(cfg.model_name("eclipse.csv"), "eclipse");
        assert_eq!(cfg.model_name("netbeans"), "netbeans");

        let named = RetrievalConfig {
            model: ModelConfig {
                name: Some("baseline_1000epoch".into()),
                ..ModelConfig::default()
            },
            ..RetrievalConfig::default()
        };
        assert_eq!(named.model_name("eclipse.csv"), "baseline_1000epoch");
    }

    #[test]
    fn derived_paths_live_under_base() {
        let cfg = RetrievalConfig::default();
        let base = Path::new("/data/eclipse");
        assert_eq!(cfg.models_dir(base), base.join("models"));
        assert_eq!(cfg.ranks_path(base), base.join("ranks.jsonl"));
    }
}
