#![forbid(unsafe_code)]
//! dupfind-search library.
//!
//! Embedding inference, exact nearest-neighbour indexing, candidate ranking
//! and the end-to-end [`pipeline::run`] driver.
//!
//! # Conventions
//!
//! - **Errors**: Stage code returns [`dupfind_core::Result`]; the pipeline
//!   driver uses `anyhow::Result` with stage context.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod knn;
pub mod pipeline;
pub mod rank;
pub mod semantic;

pub use knn::{BallTree, Neighbor, NeighborResult};
pub use pipeline::{Pipeline, RunInputs, RunOutput, RunReport, run, run_inputs};
pub use rank::{Rank, RankedCandidate, RecallReport, generate_ranks, recall_at_k};
pub use semantic::{
    ComposedModel, EmbeddingModel, InferenceEngine, InferenceSettings, TrainVectors,
    VectorizedTestEntry, load_model,
};
