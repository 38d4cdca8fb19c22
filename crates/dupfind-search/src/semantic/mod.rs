//! Learned bug embeddings.
//!
//! - [`model`]: the trained encoder and its safetensors loader.
//! - [`layers`]: dense and embedding-bag layers used by the encoder.
//! - [`embed`]: parallel batched inference over train and test pairs.

pub mod embed;
pub mod layers;
pub mod model;

pub use embed::{InferenceEngine, InferenceSettings, TrainVectors, VectorizedTestEntry};
pub use model::{ComposedModel, EmbeddingModel, load_model, model_path};
