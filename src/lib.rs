//! # LIRE: late-interaction retrieval engine
//!
//! A tenant-isolated, searchable index over documents whose value is a
//! variable-length sequence of fixed-dimensional token embeddings. Queries
//! are short sequences of query-token vectors; relevance is the sum-of-max
//! ("MaxSim") aggregation over per-token inner products.
//!
//! The engine is a blocking library: no async runtime, no background
//! threads beyond rayon's worker pool. Three subsystems carry the work:
//!
//! - **Quantization**: a coarse IVF stage assigns every token vector to
//!   one of `nlist` unit-norm centroids ([`coarse`]), and a residual stage
//!   compresses what remains ([`quantizer`]: verbatim floats, bit-packed
//!   buckets, or a product quantizer).
//! - **Storage**: five logical partitions over one embedded ordered KV
//!   store, keyed by big-endian composite keys so range scans walk one
//!   `(tenant, centroid)` posting list in ascending document order
//!   ([`storage`], [`keys`]). Per-document writes are atomic.
//! - **Retrieval**: centroid pruning, posting-list candidate collection,
//!   then either the two-phase ColBERT-style scorer or the imputation-based
//!   XTR scorer ([`retriever`]).
//!
//! ## Quick start
//!
//! ```no_run
//! use lire::{EmbeddingPassage, Index, IndexConfig, QuantizerKind, SearchOptions};
//!
//! # fn demo() -> Result<(), lire::Error> {
//! let config = IndexConfig::new()
//!     .with_dim(128)
//!     .with_nlist(256)
//!     .with_quantizer_kind(QuantizerKind::Binarizer);
//! let mut index = Index::create("/tmp/my-index", config)?;
//!
//! // `training`: unit-norm token vectors, packed row-major.
//! # let training: Vec<f32> = vec![];
//! index.train(&training, training.len() / 128, 128, None, None)?;
//!
//! # let doc_vectors: Vec<f32> = vec![];
//! index.add(1, &[EmbeddingPassage::new(42, doc_vectors, 32)])?;
//!
//! # let query: Vec<f32> = vec![];
//! let hits = index.search(1, &query, 8, 10, &SearchOptions::default())?;
//! for hit in hits {
//!     println!("{}: {}", hit.doc_id, hit.score);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Errors
//!
//! Every fallible operation returns [`Error`]; there are no panics on bad
//! input. Configuration and state violations fail the call, storage errors
//! propagate, and a missing forward record during retrieval is logged and
//! skipped rather than surfaced.

pub mod coarse;
pub mod config;
pub mod error;
pub mod keys;
pub mod kmeans;
pub mod math;
pub mod quantizer;
pub mod retriever;
pub mod storage;
pub mod version;

mod index;

pub use crate::coarse::CoarseQuantizer;
pub use crate::config::{IndexConfig, QuantizerKind};
pub use crate::error::{Error, Result};
pub use crate::index::{EmbeddingPassage, Index};
pub use crate::quantizer::{Binarizer, ProductQuantizer, ResidualCodec};
pub use crate::retriever::{SearchOptions, SearchResult};
pub use crate::storage::MetadataMap;
pub use crate::version::Version;
