//! Trained duplicate-detection encoder.
//!
//! A model file is a safetensors archive holding the F32 tensors listed in
//! [`tensor_names`]. The encoder embeds a bug's title and description with one
//! embedding bag each, passes its categorical one-hot vector through a dense
//! ReLU layer, concatenates `[info, title, description]`, projects the result
//! with a linear merge layer and L2-normalizes it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dupfind_core::{BugFeatures, Result, RetrievalError, Vector};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use sha2::{Digest, Sha256};
use tracing::{info, instrument};

use super::layers::{Activation, Dense, EmbeddingBag, l2_normalize};

/// Tensor names inside a model file.
pub mod tensor_names {
    pub const TITLE_EMBEDDINGS: &str = "title_encoder.embeddings";
    pub const DESCRIPTION_EMBEDDINGS: &str = "description_encoder.embeddings";
    pub const INFO_KERNEL: &str = "info_encoder.kernel";
    pub const INFO_BIAS: &str = "info_encoder.bias";
    pub const MERGE_KERNEL: &str = "merge_features.kernel";
    pub const MERGE_BIAS: &str = "merge_features.bias";
}

/// Extension of model files under the models directory.
pub const MODEL_EXTENSION: &str = "safetensors";

/// Maps model inputs to fixed-length vectors.
///
/// Implementations are shared across inference workers.
pub trait EmbeddingModel: Send + Sync {
    /// Length of every vector this model produces.
    fn dimension(&self) -> usize;

    /// Embed a batch, returning one vector per input in input order.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Model`] if an input does not fit the model.
    fn embed_batch(&self, batch: &[BugFeatures]) -> Result<Vec<Vector>>;

    /// # Errors
    ///
    /// As [`Self::embed_batch`].
    fn embed(&self, features: &BugFeatures) -> Result<Vector> {
        self.embed_batch(std::slice::from_ref(features))?
            .pop()
            .ok_or_else(|| RetrievalError::Model("model returned no vector".into()))
    }
}

/// Title, description and info encoders joined by a merge layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedModel {
    title: EmbeddingBag,
    description: EmbeddingBag,
    info: Dense,
    merge: Dense,
}

impl ComposedModel {
    /// # Errors
    ///
    /// Returns [`RetrievalError::Model`] if the merge layer does not accept the
    /// concatenated encoder outputs.
    pub fn new(
        title: EmbeddingBag,
        description: EmbeddingBag,
        info: Dense,
        merge: Dense,
    ) -> Result<Self> {
        let merged_width = info.output_dim() + title.dim() + description.dim();
        if merge.input_dim() != merged_width {
            return Err(RetrievalError::Model(format!(
                "merge layer expects {} inputs but encoders produce {merged_width}",
                merge.input_dim()
            )));
        }
        Ok(Self {
            title,
            description,
            info,
            merge,
        })
    }

    /// Width of the categorical input vector.
    #[must_use]
    pub const fn info_width(&self) -> usize {
        self.info.input_dim()
    }

    /// Decode a model from safetensors bytes.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Model`] if the archive is malformed, a tensor
    /// is missing or not F32, or the shapes do not compose.
    pub fn from_safetensors(bytes: &[u8]) -> Result<Self> {
        let tensors = SafeTensors::deserialize(bytes)
            .map_err(|err| RetrievalError::Model(format!("invalid model file: {err}")))?;

        let title = read_embedding(&tensors, tensor_names::TITLE_EMBEDDINGS)?;
        let description = read_embedding(&tensors, tensor_names::DESCRIPTION_EMBEDDINGS)?;
        let info = read_dense(
            &tensors,
            tensor_names::INFO_KERNEL,
            tensor_names::INFO_BIAS,
            Activation::Relu,
        )?;
        let merge = read_dense(
            &tensors,
            tensor_names::MERGE_KERNEL,
            tensor_names::MERGE_BIAS,
            Activation::Linear,
        )?;
        Self::new(title, description, info, merge)
    }

    /// Encode the model as safetensors bytes readable by [`Self::from_safetensors`].
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Model`] if encoding fails.
    pub fn to_safetensors(&self) -> Result<Vec<u8>> {
        let entries: Vec<(&str, Vec<usize>, Vec<u8>)> = vec![
            (
                tensor_names::TITLE_EMBEDDINGS,
                vec![self.title.vocab_size(), self.title.dim()],
                f32_bytes(self.title.table()),
            ),
            (
                tensor_names::DESCRIPTION_EMBEDDINGS,
                vec![self.description.vocab_size(), self.description.dim()],
                f32_bytes(self.description.table()),
            ),
            (
                tensor_names::INFO_KERNEL,
                vec![self.info.input_dim(), self.info.output_dim()],
                f32_bytes(self.info.weight()),
            ),
            (
                tensor_names::INFO_BIAS,
                vec![self.info.output_dim()],
                f32_bytes(self.info.bias()),
            ),
            (
                tensor_names::MERGE_KERNEL,
                vec![self.merge.input_dim(), self.merge.output_dim()],
                f32_bytes(self.merge.weight()),
            ),
            (
                tensor_names::MERGE_BIAS,
                vec![self.merge.output_dim()],
                f32_bytes(self.merge.bias()),
            ),
        ];

        let mut views = BTreeMap::new();
        for (name, shape, data) in &entries {
            let view = TensorView::new(Dtype::F32, shape.clone(), data)
                .map_err(|err| RetrievalError::Model(format!("tensor {name}: {err}")))?;
            views.insert(*name, view);
        }
        safetensors::serialize(views, &None)
            .map_err(|err| RetrievalError::Model(format!("failed to encode model: {err}")))
    }

    fn embed_one(&self, features: &BugFeatures) -> Result<Vector> {
        let mut merged = self.info.forward(&features.info)?;
        merged.extend(self.title.encode(&features.title));
        merged.extend(self.description.encode(&features.description));

        let mut vector = self.merge.forward(&merged)?;
        l2_normalize(&mut vector);
        Ok(vector)
    }
}

impl EmbeddingModel for ComposedModel {
    fn dimension(&self) -> usize {
        self.merge.output_dim()
    }

    fn embed_batch(&self, batch: &[BugFeatures]) -> Result<Vec<Vector>> {
        batch.iter().map(|features| self.embed_one(features)).collect()
    }
}

/// Path of model `name` inside `models_dir`.
#[must_use]
pub fn model_path(models_dir: &Path, name: &str) -> PathBuf {
    models_dir.join(format!("{name}.{MODEL_EXTENSION}"))
}

/// Load model `name` from `models_dir`, verifying `expected_sha256` when given.
///
/// # Errors
///
/// Returns [`RetrievalError::ModelNotFound`] if the file does not exist,
/// [`RetrievalError::Io`] if it cannot be read and [`RetrievalError::Model`]
/// on a checksum mismatch or undecodable contents.
#[instrument(skip(models_dir, expected_sha256), fields(models_dir = %models_dir.display()))]
pub fn load_model(
    models_dir: &Path,
    name: &str,
    expected_sha256: Option<&str>,
) -> Result<ComposedModel> {
    let path = model_path(models_dir, name);
    if !path.is_file() {
        return Err(RetrievalError::ModelNotFound(path));
    }

    let bytes = std::fs::read(&path).map_err(|err| RetrievalError::io(&path, err))?;
    if let Some(expected) = expected_sha256 {
        let actual = sha256_hex(&bytes);
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            return Err(RetrievalError::Model(format!(
                "checksum mismatch for {}: expected {expected}, found {actual}",
                path.display()
            )));
        }
    }

    let model = ComposedModel::from_safetensors(&bytes)?;
    info!(
        dimension = model.dimension(),
        info_width = model.info_width(),
        "model loaded"
    );
    Ok(model)
}

fn read_f32(tensors: &SafeTensors<'_>, name: &str) -> Result<(Vec<usize>, Vec<f32>)> {
    let view = tensors
        .tensor(name)
        .map_err(|err| RetrievalError::Model(format!("tensor {name}: {err}")))?;
    if view.dtype() != Dtype::F32 {
        return Err(RetrievalError::Model(format!(
            "tensor {name} has dtype {:?}, expected F32",
            view.dtype()
        )));
    }
    let values = view
        .data()
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Ok((view.shape().to_vec(), values))
}

fn read_embedding(tensors: &SafeTensors<'_>, name: &str) -> Result<EmbeddingBag> {
    let (shape, values) = read_f32(tensors, name)?;
    let &[vocab_size, dim] = shape.as_slice() else {
        return Err(RetrievalError::Model(format!(
            "tensor {name} must be 2-D, found shape {shape:?}"
        )));
    };
    EmbeddingBag::new(values, vocab_size, dim)
}

fn read_dense(
    tensors: &SafeTensors<'_>,
    kernel: &str,
    bias: &str,
    activation: Activation,
) -> Result<Dense> {
    let (kernel_shape, weight) = read_f32(tensors, kernel)?;
    let &[input_dim, output_dim] = kernel_shape.as_slice() else {
        return Err(RetrievalError::Model(format!(
            "tensor {kernel} must be 2-D, found shape {kernel_shape:?}"
        )));
    };
    let (_, bias) = read_f32(tensors, bias)?;
    Dense::new(weight, bias, input_dim, output_dim, activation)
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
