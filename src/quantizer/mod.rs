//! Residual quantization: the fine stage of the two-stage pipeline.
//!
//! The variant is a tagged enum frozen at index creation; there is no
//! trait-object dispatch because all work is bulk. `None` stores float32
//! residuals verbatim, `Binarizer` bit-packs per-dimension bucket indices,
//! `Pq` runs product quantization with ADC scoring at query time.

mod binarizer;
mod pq;

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

pub use binarizer::Binarizer;
pub use pq::{DistanceTables, ProductQuantizer};

use crate::error::{Error, Result};

/// File name inside the index directory.
pub const RESIDUAL_QUANTIZER_FILENAME: &str = "residual_quantizer.bin";

const BLOB_FORMAT: u32 = 1;

/// The fine residual quantizer, selected at index creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResidualCodec {
    /// Store residuals as raw little-endian float32 bytes.
    None { dim: usize },
    Binarizer(Binarizer),
    Pq(ProductQuantizer),
}

impl ResidualCodec {
    /// Bytes per encoded token residual.
    pub fn code_size(&self) -> usize {
        match self {
            ResidualCodec::None { dim } => dim * size_of::<f32>(),
            ResidualCodec::Binarizer(b) => b.code_size(),
            ResidualCodec::Pq(pq) => pq.code_size(),
        }
    }

    pub fn is_trained(&self) -> bool {
        match self {
            ResidualCodec::None { .. } => true,
            ResidualCodec::Binarizer(b) => b.is_trained(),
            ResidualCodec::Pq(pq) => pq.is_trained(),
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            ResidualCodec::None { dim } => *dim,
            ResidualCodec::Binarizer(b) => b.dim(),
            ResidualCodec::Pq(pq) => pq.dim(),
        }
    }

    /// Fit codec parameters on `n` packed residuals. A no-op for `None`.
    pub fn train(&mut self, residuals: &[f32], n: usize, seed: u64) -> Result<()> {
        match self {
            ResidualCodec::None { .. } => Ok(()),
            ResidualCodec::Binarizer(b) => b.train(residuals, n),
            ResidualCodec::Pq(pq) => pq.train(residuals, n, seed),
        }
    }

    /// Encode `n` packed residual vectors into `n * code_size()` bytes.
    pub fn encode(&self, residuals: &[f32], n: usize) -> Result<Vec<u8>> {
        match self {
            ResidualCodec::None { dim } => {
                if residuals.len() != n * dim {
                    return Err(Error::config(format!(
                        "encode: got {} floats for n={n}, dim={dim}",
                        residuals.len()
                    )));
                }
                Ok(bytemuck::cast_slice(residuals).to_vec())
            }
            ResidualCodec::Binarizer(b) => b.encode(residuals, n),
            ResidualCodec::Pq(pq) => pq.encode(residuals, n),
        }
    }

    /// Decode `n * code_size()` bytes back into (approximate) residuals.
    /// The `None` variant decodes bitwise-exactly.
    pub fn decode(&self, codes: &[u8], n: usize) -> Result<Vec<f32>> {
        match self {
            ResidualCodec::None { dim } => {
                if codes.len() != n * dim * size_of::<f32>() {
                    return Err(Error::corrupt(format!(
                        "decode: got {} bytes for n={n}, dim={dim}",
                        codes.len()
                    )));
                }
                Ok(bytemuck::pod_collect_to_vec(codes))
            }
            ResidualCodec::Binarizer(b) => b.decode(codes, n),
            ResidualCodec::Pq(pq) => pq.decode(codes, n),
        }
    }

    /// Persist the codec as a versioned variant-tagged blob. `None` writes
    /// no file: it has no learned state.
    pub fn save(&self, dir: &Path) -> Result<()> {
        if matches!(self, ResidualCodec::None { .. }) {
            return Ok(());
        }
        let blob = QuantizerBlob {
            format: BLOB_FORMAT,
            codec: self.clone(),
        };
        let bytes = bincode::serde::encode_to_vec(&blob, bincode::config::standard())
            .map_err(|e| Error::corrupt(format!("quantizer blob encode failed: {e}")))?;
        let mut out = File::create(dir.join(RESIDUAL_QUANTIZER_FILENAME))?;
        out.write_all(&bytes)?;
        Ok(())
    }

    /// Load a previously saved codec; `expect_none` short-circuits for
    /// indexes created without residual compression.
    pub fn load(dir: &Path, expect_none: Option<usize>) -> Result<Self> {
        if let Some(dim) = expect_none {
            return Ok(ResidualCodec::None { dim });
        }
        let path = dir.join(RESIDUAL_QUANTIZER_FILENAME);
        let mut bytes = Vec::new();
        File::open(&path)
            .map_err(|_| Error::not_found(format!("residual quantizer at {}", path.display())))?
            .read_to_end(&mut bytes)?;
        let (blob, _): (QuantizerBlob, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| Error::corrupt(format!("quantizer blob decode failed: {e}")))?;
        if blob.format != BLOB_FORMAT {
            return Err(Error::corrupt(format!(
                "unsupported quantizer blob format {} in {}",
                blob.format,
                path.display()
            )));
        }
        Ok(blob.codec)
    }
}

#[derive(Serialize, Deserialize)]
struct QuantizerBlob {
    format: u32,
    codec: ResidualCodec,
}
