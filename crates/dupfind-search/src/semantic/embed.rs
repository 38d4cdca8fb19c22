//! Batched vector inference over train and test pairs.

use dupfind_core::progress::stage_progress;
use dupfind_core::vocab::{FeatureShape, build_features};
use dupfind_core::{
    BugFeatures, BugId, BugStore, Pair, PairSide, Result, RetrievalError, Stage, Vector,
    distinct_bug_ids,
};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::model::EmbeddingModel;

/// Vectors for the distinct bugs of the training pairs.
///
/// `vectors[i]` embeds `bug_ids[i]`; ids are ascending and unique.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainVectors {
    pub bug_ids: Vec<BugId>,
    pub vectors: Vec<Vector>,
}

impl TrainVectors {
    #[must_use]
    pub fn len(&self) -> usize {
        self.bug_ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bug_ids.is_empty()
    }

    /// Bug id stored at index position `index`.
    #[must_use]
    pub fn bug_id_at(&self, index: usize) -> Option<BugId> {
        self.bug_ids.get(index).copied()
    }
}

/// One embedded side of a test pair.
///
/// `bug_id` is the embedded bug (`dup_a` for side A, `dup_b` for side B);
/// the pair itself is carried unchanged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorizedTestEntry {
    pub vector: Vector,
    pub bug_id: BugId,
    pub side: PairSide,
    pub dup_a: BugId,
    pub dup_b: BugId,
}

impl VectorizedTestEntry {
    #[must_use]
    pub const fn pair(&self) -> Pair {
        Pair::new(self.dup_a, self.dup_b)
    }

    /// The other bug of the pair, the one retrieval should find.
    #[must_use]
    pub const fn partner(&self) -> BugId {
        self.pair().side(self.side.other())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferenceSettings {
    pub batch_size: usize,
    pub shape: FeatureShape,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            batch_size: 64,
            shape: FeatureShape::default(),
        }
    }
}

/// Runs the model over bugs fetched from a store.
///
/// Batches are embedded in parallel; output order always follows input order.
pub struct InferenceEngine<'a> {
    store: &'a dyn BugStore,
    model: &'a dyn EmbeddingModel,
    settings: InferenceSettings,
}

impl<'a> InferenceEngine<'a> {
    #[must_use]
    pub fn new(
        store: &'a dyn BugStore,
        model: &'a dyn EmbeddingModel,
        mut settings: InferenceSettings,
    ) -> Self {
        settings.batch_size = settings.batch_size.max(1);
        Self {
            store,
            model,
            settings,
        }
    }

    /// Embed every distinct bug appearing in `pairs`, ascending by id.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::BugNotFound`] if a bug is missing from the
    /// store, or [`RetrievalError::Model`] if the model misbehaves.
    #[instrument(skip_all, fields(pairs = pairs.len()))]
    pub fn infer_unique(&self, pairs: &[Pair]) -> Result<TrainVectors> {
        let bug_ids: Vec<BugId> = distinct_bug_ids(pairs).into_iter().collect();
        let features = self.features_for(&bug_ids, Stage::TrainInference)?;
        let vectors = self.embed_all(&features, "train vectors")?;

        info!(vectors = vectors.len(), "train inference finished");
        Ok(TrainVectors { bug_ids, vectors })
    }

    /// Embed both sides of every pair: side A then side B, in pair order.
    ///
    /// # Errors
    ///
    /// Same as [`Self::infer_unique`].
    #[instrument(skip_all, fields(pairs = pairs.len()))]
    pub fn infer_pairs(&self, pairs: &[Pair]) -> Result<Vec<VectorizedTestEntry>> {
        let sides: Vec<(Pair, PairSide)> = pairs
            .iter()
            .flat_map(|&pair| [(pair, PairSide::A), (pair, PairSide::B)])
            .collect();
        let bug_ids: Vec<BugId> = sides.iter().map(|&(pair, side)| pair.side(side)).collect();

        let features = self.features_for(&bug_ids, Stage::TestInference)?;
        let vectors = self.embed_all(&features, "test vectors")?;

        let entries: Vec<VectorizedTestEntry> = sides
            .into_iter()
            .zip(vectors)
            .map(|((pair, side), vector)| VectorizedTestEntry {
                vector,
                bug_id: pair.side(side),
                side,
                dup_a: pair.dup_a,
                dup_b: pair.dup_b,
            })
            .collect();

        info!(entries = entries.len(), "test inference finished");
        Ok(entries)
    }

    fn features_for(&self, bug_ids: &[BugId], stage: Stage) -> Result<Vec<BugFeatures>> {
        let vocabulary = self.store.vocabulary();
        let mut unknown_total = 0_usize;
        let mut features = Vec::with_capacity(bug_ids.len());

        for &bug_id in bug_ids {
            let record = self.store.get(bug_id, stage)?;
            let (bug_features, unknown) = build_features(record, vocabulary, self.settings.shape);
            unknown_total += unknown;
            features.push(bug_features);
        }

        if unknown_total > 0 {
            warn!(
                stage = %stage,
                unknown = unknown_total,
                "categorical values missing from the vocabulary were encoded as zeros"
            );
        }
        Ok(features)
    }

    fn embed_all(&self, features: &[BugFeatures], label: &str) -> Result<Vec<Vector>> {
        let dimension = self.model.dimension();
        let progress = stage_progress(features.len(), label);

        let batches: Vec<Vec<Vector>> = features
            .par_chunks(self.settings.batch_size)
            .map(|batch| {
                let vectors = self.model.embed_batch(batch)?;
                if vectors.len() != batch.len() {
                    return Err(RetrievalError::Model(format!(
                        "model returned {} vectors for a batch of {}",
                        vectors.len(),
                        batch.len()
                    )));
                }
                if let Some(bad) = vectors.iter().find(|vector| vector.len() != dimension) {
                    return Err(RetrievalError::Model(format!(
                        "model returned a {}-dimensional vector, expected {dimension}",
                        bad.len()
                    )));
                }
                progress.inc(batch.len() as u64);
                Ok(vectors)
            })
            .collect::<Result<_>>()?;

        progress.finish_and_clear();
        Ok(batches.into_iter().flatten().collect())
    }
}
