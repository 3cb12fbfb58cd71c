//! Index configuration and its persisted `metadata.json` form.
//!
//! `IndexConfig` carries everything needed to recreate the quantization
//! pipeline: training parameters are frozen at train time and compared
//! verbatim before a merge. Runtime knobs (thread count, RNG seed) are not
//! persisted.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::version::{VERSION_STRING, Version};

/// File name inside the index directory.
pub const METADATA_FILENAME: &str = "metadata.json";

/// Residual quantizer selection. `Xtr` is a product quantizer whose codes
/// are additionally written into the posting lists, enabling the
/// imputation-based retriever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantizerKind {
    None,
    Binarizer,
    Product,
    Xtr,
}

impl QuantizerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QuantizerKind::None => "none",
            QuantizerKind::Binarizer => "binarizer",
            QuantizerKind::Product => "product",
            QuantizerKind::Xtr => "xtr",
        }
    }

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(QuantizerKind::None),
            "binarizer" => Ok(QuantizerKind::Binarizer),
            "product" => Ok(QuantizerKind::Product),
            "xtr" => Ok(QuantizerKind::Xtr),
            other => Err(Error::corrupt(format!("unknown quantizer type {other:?}"))),
        }
    }

    /// Whether posting entries carry per-token residual codes.
    pub fn posting_payloads(self) -> bool {
        matches!(self, QuantizerKind::Xtr)
    }
}

/// Configuration for creating an index.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Embedding dimensionality.
    pub dim: usize,
    /// Number of IVF centroids.
    pub nlist: usize,
    /// Bits per residual dimension (binarizer) or per sub-quantizer code (PQ).
    pub nbits: usize,
    /// Default k-means iterations; `train` may override per call.
    pub niter: usize,
    /// Sub-quantizer count for product quantization.
    pub num_subquantizers: usize,
    /// Residual quantizer variant.
    pub quantizer_kind: QuantizerKind,
    /// Dedicated thread-pool size for parallel regions. `None` uses the
    /// process-wide rayon pool.
    pub threads: Option<usize>,
    /// Seed for k-means initialization; fixed default for reproducibility.
    pub seed: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            dim: 128,
            nlist: 256,
            nbits: 1,
            niter: 10,
            num_subquantizers: 16,
            quantizer_kind: QuantizerKind::Binarizer,
            threads: None,
            seed: 1234,
        }
    }
}

impl IndexConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dim(mut self, dim: usize) -> Self {
        self.dim = dim;
        self
    }

    pub fn with_nlist(mut self, nlist: usize) -> Self {
        self.nlist = nlist;
        self
    }

    pub fn with_nbits(mut self, nbits: usize) -> Self {
        self.nbits = nbits;
        self
    }

    pub fn with_niter(mut self, niter: usize) -> Self {
        self.niter = niter;
        self
    }

    pub fn with_num_subquantizers(mut self, num_subquantizers: usize) -> Self {
        self.num_subquantizers = num_subquantizers;
        self
    }

    pub fn with_quantizer_kind(mut self, kind: QuantizerKind) -> Self {
        self.quantizer_kind = kind;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            return Err(Error::config("dim must be non-zero"));
        }
        if self.nlist == 0 || self.nlist > u32::MAX as usize {
            return Err(Error::config(format!(
                "nlist {} does not fit a 32-bit code",
                self.nlist
            )));
        }
        Ok(())
    }

    /// The fields that must match for two indexes to merge.
    pub(crate) fn training_fingerprint(&self) -> (usize, usize, usize, usize, QuantizerKind) {
        (
            self.dim,
            self.nlist,
            self.nbits,
            self.num_subquantizers,
            self.quantizer_kind,
        )
    }
}

/// The exact shape persisted as `metadata.json`.
#[derive(Debug, Serialize, Deserialize)]
struct Metadata {
    nlist: u64,
    nbits: u64,
    niter: u64,
    dim: u64,
    num_subquantizers: u64,
    quantizer_type: String,
    version: String,
}

/// Write `metadata.json` into the index directory.
pub(crate) fn write_metadata(dir: &Path, config: &IndexConfig) -> Result<()> {
    let metadata = Metadata {
        nlist: config.nlist as u64,
        nbits: config.nbits as u64,
        niter: config.niter as u64,
        dim: config.dim as u64,
        num_subquantizers: config.num_subquantizers as u64,
        quantizer_type: config.quantizer_kind.as_str().to_string(),
        version: VERSION_STRING.to_string(),
    };
    let text = serde_json::to_string_pretty(&metadata)?;
    fs::write(dir.join(METADATA_FILENAME), text)?;
    Ok(())
}

/// Read `metadata.json`, returning the stored configuration and the version
/// of the library that wrote it.
pub(crate) fn read_metadata(dir: &Path) -> Result<(IndexConfig, Version)> {
    let path = dir.join(METADATA_FILENAME);
    let text = fs::read_to_string(&path)
        .map_err(|_| Error::not_found(format!("index metadata at {}", path.display())))?;
    let metadata: Metadata = serde_json::from_str(&text)?;
    let version: Version = metadata.version.parse()?;
    let config = IndexConfig {
        dim: metadata.dim as usize,
        nlist: metadata.nlist as usize,
        nbits: metadata.nbits as usize,
        niter: metadata.niter as usize,
        num_subquantizers: metadata.num_subquantizers as usize,
        quantizer_kind: QuantizerKind::from_str(&metadata.quantizer_type)?,
        ..IndexConfig::default()
    };
    config.validate()?;
    Ok((config, version))
}
