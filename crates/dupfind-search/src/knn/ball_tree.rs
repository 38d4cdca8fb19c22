use std::cmp::Ordering;
use std::collections::BinaryHeap;

use dupfind_core::{Result, RetrievalError, Vector};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, instrument};

/// Default number of points held by one leaf.
pub const DEFAULT_LEAF_SIZE: usize = 30;

/// Relative slack on the pruning bound. A node is skipped only when its
/// lower bound beats the current k-th distance by more than this.
const PRUNE_SLACK: f64 = 1e-9;

/// One retrieved training point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Neighbor {
    /// Position of the point in the training vectors.
    pub index: usize,
    /// Euclidean distance to the query.
    pub distance: f32,
}

/// Neighbours of one query, nearest first.
pub type NeighborResult = Vec<Neighbor>;

#[derive(Debug, Clone)]
struct Node {
    start: usize,
    end: usize,
    centroid: Vec<f32>,
    radius: f64,
    children: Option<(usize, usize)>,
}

/// Exact nearest-neighbour index over a fixed set of vectors.
///
/// Results are ordered by ascending distance; equal distances are ordered by
/// ascending training index, so results do not depend on the tree layout.
#[derive(Debug, Clone)]
pub struct BallTree {
    points: Vec<Vector>,
    dimension: usize,
    order: Vec<usize>,
    nodes: Vec<Node>,
    leaf_size: usize,
}

impl BallTree {
    /// Build over `points`; `leaf_size` is clamped to at least 1.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Index`] if the points have zero dimensions,
    /// disagree on dimension or contain a non-finite value.
    #[instrument(skip(points), fields(points = points.len()))]
    pub fn build(points: Vec<Vector>, leaf_size: usize) -> Result<Self> {
        let dimension = points.first().map_or(0, Vec::len);
        if dimension == 0 && !points.is_empty() {
            return Err(RetrievalError::Index("points have zero dimensions".into()));
        }
        for (index, point) in points.iter().enumerate() {
            if point.len() != dimension {
                return Err(RetrievalError::Index(format!(
                    "point {index} has {} dimensions, expected {dimension}",
                    point.len()
                )));
            }
            if point.iter().any(|value| !value.is_finite()) {
                return Err(RetrievalError::Index(format!(
                    "point {index} contains a non-finite value"
                )));
            }
        }

        let mut tree = Self {
            order: (0..points.len()).collect(),
            points,
            dimension,
            nodes: Vec::new(),
            leaf_size: leaf_size.max(1),
        };
        if !tree.points.is_empty() {
            tree.build_node(0, tree.points.len());
        }
        debug!(nodes = tree.nodes.len(), dimension, "ball tree built");
        Ok(tree)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[must_use]
    pub const fn dimension(&self) -> usize {
        self.dimension
    }

    /// The `min(k, len)` nearest points to `query`, which must have
    /// [`Self::dimension`] components. Use [`Self::try_query`] for unchecked input.
    #[must_use]
    pub fn query(&self, query: &[f32], k: usize) -> NeighborResult {
        debug_assert!(self.is_empty() || query.len() == self.dimension);
        self.search(query, k)
    }

    /// [`Self::query`] with the query validated first.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Index`] if `query` has the wrong dimension
    /// or a non-finite value.
    pub fn try_query(&self, query: &[f32], k: usize) -> Result<NeighborResult> {
        self.check_query(query)?;
        Ok(self.search(query, k))
    }

    /// [`Self::try_query`] for many queries at once, in parallel. Output order
    /// follows `queries`.
    ///
    /// # Errors
    ///
    /// Fails on the first malformed query.
    #[instrument(skip_all, fields(queries = queries.len(), k = k))]
    pub fn query_batch(&self, queries: &[Vector], k: usize) -> Result<Vec<NeighborResult>> {
        for query in queries {
            self.check_query(query)?;
        }
        Ok(queries.par_iter().map(|query| self.search(query, k)).collect())
    }

    fn check_query(&self, query: &[f32]) -> Result<()> {
        if !self.is_empty() && query.len() != self.dimension {
            return Err(RetrievalError::Index(format!(
                "query has {} dimensions, index has {}",
                query.len(),
                self.dimension
            )));
        }
        if query.iter().any(|value| !value.is_finite()) {
            return Err(RetrievalError::Index("query contains a non-finite value".into()));
        }
        Ok(())
    }

    fn build_node(&mut self, start: usize, end: usize) -> usize {
        let (centroid, radius) = self.bounds(start, end);
        let id = self.nodes.len();
        self.nodes.push(Node {
            start,
            end,
            centroid,
            radius,
            children: None,
        });

        if end - start > self.leaf_size {
            let axis = self.widest_axis(start, end);
            let mid = start + (end - start) / 2;
            let points = &self.points;
            self.order[start..end].select_nth_unstable_by(mid - start, |&a, &b| {
                points[a][axis]
                    .total_cmp(&points[b][axis])
                    .then(a.cmp(&b))
            });
            let left = self.build_node(start, mid);
            let right = self.build_node(mid, end);
            self.nodes[id].children = Some((left, right));
        }
        id
    }

    fn bounds(&self, start: usize, end: usize) -> (Vec<f32>, f64) {
        let members = &self.order[start..end];
        let mut sum = vec![0.0_f64; self.dimension];
        for &index in members {
            for (acc, value) in sum.iter_mut().zip(&self.points[index]) {
                *acc += f64::from(*value);
            }
        }
        let count = members.len() as f64;
        #[allow(clippy::cast_possible_truncation)]
        let centroid: Vec<f32> = sum.into_iter().map(|total| (total / count) as f32).collect();

        let radius = members
            .iter()
            .map(|&index| distance(&self.points[index], &centroid))
            .fold(0.0_f64, f64::max);
        (centroid, radius)
    }

    fn widest_axis(&self, start: usize, end: usize) -> usize {
        let members = &self.order[start..end];
        (0..self.dimension)
            .map(|axis| {
                let (lo, hi) = members.iter().fold(
                    (f32::INFINITY, f32::NEG_INFINITY),
                    |(lo, hi), &index| {
                        let value = self.points[index][axis];
                        (lo.min(value), hi.max(value))
                    },
                );
                (axis, hi - lo)
            })
            .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)))
            .map_or(0, |(axis, _)| axis)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn search(&self, query: &[f32], k: usize) -> NeighborResult {
        if k == 0 || self.nodes.is_empty() {
            return Vec::new();
        }
        let mut heap = BinaryHeap::with_capacity(k.min(self.len()) + 1);
        let root_distance = distance(query, &self.nodes[0].centroid);
        self.visit(0, root_distance, query, k, &mut heap);

        heap.into_sorted_vec()
            .into_iter()
            .map(|candidate| Neighbor {
                index: candidate.index,
                distance: candidate.distance as f32,
            })
            .collect()
    }

    fn visit(
        &self,
        node_id: usize,
        centroid_distance: f64,
        query: &[f32],
        k: usize,
        heap: &mut BinaryHeap<Candidate>,
    ) {
        let node = &self.nodes[node_id];
        let lower_bound = (centroid_distance - node.radius).max(0.0);
        if heap.len() == k && heap.peek().is_some_and(|worst| prunes(lower_bound, worst.distance)) {
            return;
        }

        match node.children {
            None => {
                for &index in &self.order[node.start..node.end] {
                    offer(
                        heap,
                        k,
                        Candidate {
                            distance: distance(query, &self.points[index]),
                            index,
                        },
                    );
                }
            }
            Some((left, right)) => {
                let left_distance = distance(query, &self.nodes[left].centroid);
                let right_distance = distance(query, &self.nodes[right].centroid);
                if left_distance <= right_distance {
                    self.visit(left, left_distance, query, k, heap);
                    self.visit(right, right_distance, query, k, heap);
                } else {
                    self.visit(right, right_distance, query, k, heap);
                    self.visit(left, left_distance, query, k, heap);
                }
            }
        }
    }
}

/// Heap entry ordered by (distance, index); the heap top is the worst kept.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    distance: f64,
    index: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.index.cmp(&other.index))
    }
}

fn offer(heap: &mut BinaryHeap<Candidate>, k: usize, candidate: Candidate) {
    if heap.len() < k {
        heap.push(candidate);
    } else if heap.peek().is_some_and(|worst| candidate < *worst) {
        heap.pop();
        heap.push(candidate);
    }
}

fn prunes(lower_bound: f64, worst: f64) -> bool {
    lower_bound - worst > PRUNE_SLACK * (1.0 + worst)
}

/// Euclidean distance, accumulated in `f64`.
#[must_use]
pub fn distance(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = f64::from(*x) - f64::from(*y);
            d * d
        })
        .sum::<f64>()
        .sqrt()
}
