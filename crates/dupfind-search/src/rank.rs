//! Candidate rankings for test queries and their evaluation.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use dupfind_core::{BugId, Buckets, PairSide, Result, RetrievalError};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::knn::NeighborResult;
use crate::semantic::{TrainVectors, VectorizedTestEntry};

/// A training bug proposed as a duplicate of a query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub bug_id: BugId,
    /// Master of the candidate's bucket; the candidate itself if unbucketed.
    pub master: BugId,
    pub distance: f32,
}

/// Ranked candidates for one side of a test pair, nearest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rank {
    pub query: BugId,
    /// The other bug of the test pair.
    pub partner: BugId,
    pub side: PairSide,
    pub candidates: Vec<RankedCandidate>,
}

impl Rank {
    /// Masters of the first `k` candidates.
    pub fn top_masters(&self, k: usize) -> impl Iterator<Item = BugId> + '_ {
        self.candidates.iter().take(k).map(|candidate| candidate.master)
    }
}

/// Turn per-entry neighbour lists into rankings.
///
/// `neighbors[i]` must be the result for `test[i]`. Neighbour indices refer
/// to positions in `train`. A candidate equal to the query bug is dropped.
///
/// # Errors
///
/// Returns [`RetrievalError::Index`] if the neighbour lists do not line up
/// with the test entries or point outside the training vectors.
#[instrument(skip_all, fields(entries = test.len()))]
pub fn generate_ranks(
    test: &[VectorizedTestEntry],
    train: &TrainVectors,
    buckets: &Buckets,
    neighbors: &[NeighborResult],
) -> Result<Vec<Rank>> {
    if test.len() != neighbors.len() {
        return Err(RetrievalError::Index(format!(
            "{} neighbour lists for {} test entries",
            neighbors.len(),
            test.len()
        )));
    }

    let ranks = test
        .iter()
        .zip(neighbors)
        .map(|(entry, result)| {
            let mut candidates = Vec::with_capacity(result.len());
            for neighbor in result {
                let bug_id = train.bug_id_at(neighbor.index).ok_or_else(|| {
                    RetrievalError::Index(format!(
                        "neighbour index {} outside {} training vectors",
                        neighbor.index,
                        train.len()
                    ))
                })?;
                if bug_id == entry.bug_id {
                    continue;
                }
                candidates.push(RankedCandidate {
                    bug_id,
                    master: buckets.master_or_self(bug_id),
                    distance: neighbor.distance,
                });
            }
            Ok(Rank {
                query: entry.bug_id,
                partner: entry.partner(),
                side: entry.side,
                candidates,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    info!(ranks = ranks.len(), "ranks generated");
    Ok(ranks)
}

/// Recall at one cut-off.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RecallAt {
    pub k: usize,
    pub hits: usize,
    pub recall: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecallReport {
    pub queries: usize,
    pub cutoffs: Vec<RecallAt>,
}

impl RecallReport {
    #[must_use]
    pub fn at(&self, k: usize) -> Option<&RecallAt> {
        self.cutoffs.iter().find(|cutoff| cutoff.k == k)
    }
}

/// Share of ranks whose partner's bucket appears among the first `k`
/// candidates, for each `k` in `ks` (sorted, deduplicated).
#[must_use]
pub fn recall_at_k(ranks: &[Rank], buckets: &Buckets, ks: &[usize]) -> RecallReport {
    let mut ks = ks.to_vec();
    ks.sort_unstable();
    ks.dedup();

    let cutoffs = ks
        .into_iter()
        .map(|k| {
            let hits = ranks
                .iter()
                .filter(|rank| {
                    let target = buckets.master_or_self(rank.partner);
                    rank.top_masters(k).any(|master| master == target)
                })
                .count();
            RecallAt {
                k,
                hits,
                recall: ratio(hits, ranks.len()),
            }
        })
        .collect();

    RecallReport {
        queries: ranks.len(),
        cutoffs,
    }
}

/// Mean fraction of each training point's neighbours, itself excluded,
/// that share its bucket. `None` when no point has another neighbour.
#[must_use]
pub fn self_neighbor_purity(
    train: &TrainVectors,
    buckets: &Buckets,
    neighbors: &[NeighborResult],
) -> Option<f64> {
    let mut total = 0.0_f64;
    let mut scored = 0_usize;

    for (index, result) in neighbors.iter().enumerate() {
        let Some(bug_id) = train.bug_id_at(index) else {
            continue;
        };
        let master = buckets.master_or_self(bug_id);
        let others: Vec<BugId> = result
            .iter()
            .filter(|neighbor| neighbor.index != index)
            .filter_map(|neighbor| train.bug_id_at(neighbor.index))
            .collect();
        if others.is_empty() {
            continue;
        }
        let same = others
            .iter()
            .filter(|&&other| buckets.master_or_self(other) == master)
            .count();
        total += ratio(same, others.len());
        scored += 1;
    }

    (scored > 0).then(|| total / scored as f64)
}

/// Number of distinct buckets the ranks' partners belong to.
#[must_use]
pub fn distinct_partner_buckets(ranks: &[Rank], buckets: &Buckets) -> usize {
    ranks
        .iter()
        .map(|rank| buckets.master_or_self(rank.partner))
        .collect::<HashSet<_>>()
        .len()
}

/// Write `ranks` as JSON Lines, one rank per line.
///
/// # Errors
///
/// Returns [`RetrievalError::Io`] if the file cannot be created or written.
#[instrument(skip(ranks), fields(path = %path.display(), ranks = ranks.len()))]
pub fn write_ranks(path: &Path, ranks: &[Rank]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|err| RetrievalError::io(parent, err))?;
    }
    let file = File::create(path).map_err(|err| RetrievalError::io(path, err))?;
    let mut out = BufWriter::new(file);
    for rank in ranks {
        serde_json::to_writer(&mut out, rank)
            .map_err(|err| RetrievalError::io(path, err.into()))?;
        out.write_all(b"\n")
            .map_err(|err| RetrievalError::io(path, err))?;
    }
    out.flush().map_err(|err| RetrievalError::io(path, err))?;
    info!("ranks written");
    Ok(())
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knn::Neighbor;
    use dupfind_core::{BucketRow, build_buckets};

    fn buckets() -> Buckets {
        // {1, 2, 3} and {20, 21}
        build_buckets(&[
            BucketRow::root(1),
            BucketRow::duplicate(2, 1),
            BucketRow::duplicate(3, 2),
            BucketRow::root(20),
            BucketRow::duplicate(21, 20),
        ])
        .expect("buckets")
    }

    fn train() -> TrainVectors {
        TrainVectors {
            bug_ids: vec![2, 3, 20, 99],
            vectors: vec![vec![0.0]; 4],
        }
    }

    fn entry(bug_id: BugId, side: PairSide, dup_a: BugId, dup_b: BugId) -> VectorizedTestEntry {
        VectorizedTestEntry {
            vector: vec![0.0],
            bug_id,
            side,
            dup_a,
            dup_b,
        }
    }

    fn neighbors(indices: &[usize]) -> NeighborResult {
        indices
            .iter()
            .enumerate()
            .map(|(rank, &index)| Neighbor {
                index,
                distance: rank as f32,
            })
            .collect()
    }

    #[test]
    fn candidates_map_to_bug_ids_and_masters() {
        let test = vec![entry(21, PairSide::A, 21, 1)];
        let ranks = generate_ranks(&test, &train(), &buckets(), &[neighbors(&[2, 0, 3])])
            .expect("ranks");

        assert_eq!(ranks.len(), 1);
        let rank = &ranks[0];
        assert_eq!((rank.query, rank.partner, rank.side), (21, 1, PairSide::A));
        let got: Vec<(BugId, BugId)> = rank
            .candidates
            .iter()
            .map(|candidate| (candidate.bug_id, candidate.master))
            .collect();
        assert_eq!(got, vec![(20, 20), (2, 1), (99, 99)]);
    }

    #[test]
    fn query_bug_is_dropped_from_its_own_candidates() {
        let test = vec![entry(3, PairSide::B, 7, 3)];
        let ranks =
            generate_ranks(&test, &train(), &buckets(), &[neighbors(&[1, 0])]).expect("ranks");
        let ids: Vec<BugId> = ranks[0].candidates.iter().map(|c| c.bug_id).collect();
        assert_eq!(ids, vec![2]);
        assert_eq!(ranks[0].partner, 7);
    }

    #[test]
    fn misaligned_inputs_are_index_errors() {
        let test = vec![entry(3, PairSide::A, 3, 7)];
        assert!(matches!(
            generate_ranks(&test, &train(), &buckets(), &[]),
            Err(RetrievalError::Index(_))
        ));
        assert!(matches!(
            generate_ranks(&test, &train(), &buckets(), &[neighbors(&[40])]),
            Err(RetrievalError::Index(_))
        ));
    }

    #[test]
    fn recall_counts_bucket_hits_within_cutoff() {
        let buckets = buckets();
        let candidate = |bug_id: BugId| RankedCandidate {
            bug_id,
            master: buckets.master_or_self(bug_id),
            distance: 0.0,
        };
        let ranks = vec![
            // partner 1 is in bucket 1; candidate 3 is too, at position 2
            Rank {
                query: 50,
                partner: 1,
                side: PairSide::A,
                candidates: vec![candidate(20), candidate(3)],
            },
            // partner 21 is in bucket 20, found first
            Rank {
                query: 51,
                partner: 21,
                side: PairSide::B,
                candidates: vec![candidate(20)],
            },
            Rank {
                query: 52,
                partner: 77,
                side: PairSide::A,
                candidates: vec![candidate(2)],
            },
        ];

        let report = recall_at_k(&ranks, &buckets, &[5, 1, 1]);
        assert_eq!(report.queries, 3);
        assert_eq!(report.cutoffs.len(), 2);

        let at1 = report.at(1).expect("k=1");
        assert_eq!(at1.hits, 1);
        let at5 = report.at(5).expect("k=5");
        assert_eq!(at5.hits, 2);
        assert!((at5.recall - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(distinct_partner_buckets(&ranks, &buckets), 3);
    }

    #[test]
    fn recall_over_no_ranks_is_zero() {
        let report = recall_at_k(&[], &buckets(), &[1]);
        assert_eq!(report.queries, 0);
        assert!(report.at(1).expect("k=1").recall.abs() < f64::EPSILON);
    }

    #[test]
    fn purity_ignores_the_point_itself() {
        let train = train();
        // 2 -> [self, 3 (same bucket), 20 (other)]; 3 -> [self, 2]; 20 -> [self]
        let results = vec![neighbors(&[0, 1, 2]), neighbors(&[1, 0]), neighbors(&[2])];
        let purity = self_neighbor_purity(&train, &buckets(), &results).expect("scored");
        assert!((purity - 0.75).abs() < 1e-9, "got {purity}");

        assert_eq!(self_neighbor_purity(&train, &buckets(), &[neighbors(&[0])]), None);
    }

    #[test]
    fn ranks_are_written_one_json_object_per_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out/ranks.jsonl");
        let ranks = vec![
            Rank {
                query: 1,
                partner: 2,
                side: PairSide::A,
                candidates: vec![RankedCandidate {
                    bug_id: 3,
                    master: 3,
                    distance: 0.5,
                }],
            },
            Rank {
                query: 2,
                partner: 1,
                side: PairSide::B,
                candidates: Vec::new(),
            },
        ];

        write_ranks(&path, &ranks).expect("write");
        let content = std::fs::read_to_string(&path).expect("read");
        let parsed: Vec<Rank> = content
            .lines()
            .map(|line| serde_json::from_str(line).expect("valid json line"))
            .collect();
        assert_eq!(parsed, ranks);
        assert!(content.lines().next().expect("line").contains("\"side\":\"a\""));
    }
}
