//! End-to-end retrieval run.
//!
//! Stages run in a fixed order, each taking shared references and returning
//! a fresh value: buckets, pairs, train inference, test inference, index
//! build, neighbour queries, ranking, evaluation and rank output.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dupfind_core::config::{RetrievalConfig, resolve_config};
use dupfind_core::timing::StageTimings;
use dupfind_core::{
    BugStore, Buckets, JsonlBugStore, Pair, build_buckets, load_bucket_table, load_pairs,
};
use serde::Serialize;
use tracing::{info, instrument};

use crate::knn::{BallTree, NeighborResult};
use crate::rank::{
    Rank, RecallReport, distinct_partner_buckets, generate_ranks, recall_at_k,
    self_neighbor_purity, write_ranks,
};
use crate::semantic::{
    EmbeddingModel, InferenceEngine, InferenceSettings, TrainVectors, VectorizedTestEntry,
    load_model,
};

/// The five inputs of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInputs {
    /// Dataset directory holding the bug store, models and config.
    pub base_path: PathBuf,
    /// Dataset name; its file stem names the model unless configured.
    pub dataset_name: String,
    pub bucket_csv_path: PathBuf,
    pub train_pairs_path: PathBuf,
    pub test_pairs_path: PathBuf,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub dataset: String,
    pub model: String,
    pub buckets: usize,
    pub bucketed_bugs: usize,
    pub train_pairs: usize,
    pub test_pairs: usize,
    pub train_vectors: usize,
    pub test_entries: usize,
    pub k: usize,
    pub recall: RecallReport,
    pub partner_buckets: usize,
    pub train_neighbor_purity: Option<f64>,
    pub ranks_path: Option<PathBuf>,
    pub timings: StageTimings,
}

/// Everything a run produced, for callers that want more than the summary.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub report: RunReport,
    pub buckets: Buckets,
    pub train: TrainVectors,
    pub test: Vec<VectorizedTestEntry>,
    pub train_neighbors: Vec<NeighborResult>,
    pub test_neighbors: Vec<NeighborResult>,
    pub ranks: Vec<Rank>,
}

/// Run the full pipeline for one dataset.
///
/// Loads the layered config, the JSONL bug store under `base_path` and the
/// model named after `dataset_name`, then runs every stage.
///
/// # Errors
///
/// Fails on the first stage error; the error context names the stage.
pub fn run(
    base_path: &Path,
    dataset_name: &str,
    bucket_csv_path: &Path,
    train_pairs_path: &Path,
    test_pairs_path: &Path,
) -> Result<RunReport> {
    let inputs = RunInputs {
        base_path: base_path.to_path_buf(),
        dataset_name: dataset_name.to_string(),
        bucket_csv_path: bucket_csv_path.to_path_buf(),
        train_pairs_path: train_pairs_path.to_path_buf(),
        test_pairs_path: test_pairs_path.to_path_buf(),
    };
    let config = resolve_config(base_path).context("failed to resolve configuration")?;
    run_inputs(&inputs, &config).map(|output| output.report)
}

/// [`run`] with an explicit config.
///
/// # Errors
///
/// See [`run`].
#[instrument(skip_all, fields(dataset = %inputs.dataset_name, base = %inputs.base_path.display()))]
pub fn run_inputs(inputs: &RunInputs, config: &RetrievalConfig) -> Result<RunOutput> {
    let mut timings = StageTimings::new();

    let store = timings
        .timed("load-store", || JsonlBugStore::open(&inputs.base_path))
        .context("failed to open bug store")?;

    let model_name = config.model_name(&inputs.dataset_name);
    let models_dir = config.models_dir(&inputs.base_path);
    let model = timings
        .timed("load-model", || {
            load_model(&models_dir, &model_name, config.model.sha256.as_deref())
        })
        .with_context(|| format!("failed to load model '{model_name}'"))?;

    let pipeline = Pipeline {
        config,
        store: &store,
        model: &model,
    };
    pipeline.execute(inputs, timings)
}

/// Stage runner over a loaded store and model.
pub struct Pipeline<'a> {
    pub config: &'a RetrievalConfig,
    pub store: &'a dyn BugStore,
    pub model: &'a dyn EmbeddingModel,
}

impl Pipeline<'_> {
    /// Run every stage after store and model loading.
    ///
    /// # Errors
    ///
    /// Fails on the first stage error; the error context names the stage.
    pub fn execute(&self, inputs: &RunInputs, mut timings: StageTimings) -> Result<RunOutput> {
        let buckets = timings
            .timed("buckets", || {
                load_bucket_table(&inputs.bucket_csv_path).and_then(|rows| build_buckets(&rows))
            })
            .context("stage buckets failed")?;
        info!(
            buckets = buckets.len(),
            bugs = buckets.bug_count(),
            "buckets built"
        );

        let (train_pairs, test_pairs) = timings
            .timed("pairs", || load_pair_files(inputs))
            .context("stage pairs failed")?;

        let engine = InferenceEngine::new(
            self.store,
            self.model,
            InferenceSettings {
                batch_size: self.config.inference.batch_size,
                shape: self.config.inference.feature_shape(),
            },
        );
        let train = timings
            .timed("train-inference", || engine.infer_unique(&train_pairs))
            .context("stage train-inference failed")?;
        let test = timings
            .timed("test-inference", || engine.infer_pairs(&test_pairs))
            .context("stage test-inference failed")?;

        let index = timings
            .timed("index", || {
                BallTree::build(train.vectors.clone(), self.config.index.leaf_size)
            })
            .context("stage index failed")?;

        let k = self.config.index.k;
        let train_neighbors = timings
            .timed("train-query", || index.query_batch(&train.vectors, k))
            .context("stage train-query failed")?;
        let test_queries: Vec<_> = test.iter().map(|entry| entry.vector.clone()).collect();
        let test_neighbors = timings
            .timed("test-query", || index.query_batch(&test_queries, k))
            .context("stage test-query failed")?;

        let ranks = timings
            .timed("ranking", || {
                generate_ranks(&test, &train, &buckets, &test_neighbors)
            })
            .context("stage ranking failed")?;

        let recall = recall_at_k(&ranks, &buckets, &self.config.evaluation.recall_at);
        let purity = self_neighbor_purity(&train, &buckets, &train_neighbors);
        for cutoff in &recall.cutoffs {
            info!(k = cutoff.k, hits = cutoff.hits, recall = cutoff.recall, "recall");
        }

        let ranks_path = if self.config.output.write_ranks {
            let path = self.config.ranks_path(&inputs.base_path);
            timings
                .timed("write-ranks", || write_ranks(&path, &ranks))
                .context("stage write-ranks failed")?;
            Some(path)
        } else {
            None
        };

        let report = RunReport {
            dataset: inputs.dataset_name.clone(),
            model: self.config.model_name(&inputs.dataset_name),
            buckets: buckets.len(),
            bucketed_bugs: buckets.bug_count(),
            train_pairs: train_pairs.len(),
            test_pairs: test_pairs.len(),
            train_vectors: train.len(),
            test_entries: test.len(),
            k,
            partner_buckets: distinct_partner_buckets(&ranks, &buckets),
            recall,
            train_neighbor_purity: purity,
            ranks_path,
            timings,
        };

        Ok(RunOutput {
            report,
            buckets,
            train,
            test,
            train_neighbors,
            test_neighbors,
            ranks,
        })
    }
}

fn load_pair_files(inputs: &RunInputs) -> dupfind_core::Result<(Vec<Pair>, Vec<Pair>)> {
    let train = load_pairs(&inputs.train_pairs_path)?;
    let test = load_pairs(&inputs.test_pairs_path)?;
    Ok((train, test))
}
