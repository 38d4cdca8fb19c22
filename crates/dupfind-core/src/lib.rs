#![forbid(unsafe_code)]
//! dupfind-core library.
//!
//! Data model, bug store, bucket builder and pair loader for duplicate bug
//! retrieval.
//!
//! # Conventions
//!
//! - **Errors**: Return [`error::Result`] with a typed [`error::RetrievalError`].
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod bucket;
pub mod config;
pub mod error;
pub mod model;
pub mod pairs;
pub mod progress;
pub mod store;
pub mod timing;
pub mod vocab;

pub use bucket::{BucketRow, Buckets, DuplicateMarker, build_buckets, load_bucket_table};
pub use error::{ErrorCode, Result, RetrievalError, Stage};
pub use model::{BugFeatures, BugId, BugRecord, CategoricalField, Pair, PairSide, Vector};
pub use pairs::{distinct_bug_ids, load_pairs};
pub use store::{BugStore, JsonlBugStore};
