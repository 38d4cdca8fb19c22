//! Exact k-nearest-neighbour search over embedding vectors.

pub mod ball_tree;

pub use ball_tree::{BallTree, DEFAULT_LEAF_SIZE, Neighbor, NeighborResult, distance};

/// Neighbours retrieved per query unless configured otherwise.
pub const DEFAULT_K: usize = 20;
