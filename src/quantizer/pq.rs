//! Product quantizer: `M` independent sub-space codebooks over residuals.
//!
//! Each d-dimensional residual splits into `M` sub-vectors of `dsub = d/M`;
//! every sub-vector encodes as the index of its nearest sub-codebook entry.
//! Query-time scoring is ADC: a per-query-token `(M × ksub)` inner-product
//! table is precomputed once, and a document token's score is the sum of
//! `M` table lookups.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::kmeans::kmeans;
use crate::math::inner_product;

/// Iterations used for each sub-space clustering.
const SUBSPACE_NITER: usize = 25;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductQuantizer {
    dim: usize,
    /// Number of sub-quantizers.
    m: usize,
    nbits: usize,
    dsub: usize,
    ksub: usize,
    /// `m * ksub * dsub` floats: codebook `s` entry `c` starts at
    /// `(s * ksub + c) * dsub`.
    codebooks: Vec<f32>,
    trained: bool,
}

impl ProductQuantizer {
    pub fn new(dim: usize, nbits: usize, num_subquantizers: usize) -> Result<Self> {
        if num_subquantizers == 0 || dim % num_subquantizers != 0 {
            return Err(Error::config(format!(
                "dimension {dim} is not divisible by {num_subquantizers} sub-quantizers"
            )));
        }
        if nbits == 0 || nbits > 8 {
            return Err(Error::config(format!(
                "product quantizer nbits must be in 1..=8, got {nbits}"
            )));
        }
        Ok(ProductQuantizer {
            dim,
            m: num_subquantizers,
            nbits,
            dsub: dim / num_subquantizers,
            ksub: 1 << nbits,
            codebooks: Vec::new(),
            trained: false,
        })
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn num_subquantizers(&self) -> usize {
        self.m
    }

    pub fn ksub(&self) -> usize {
        self.ksub
    }

    /// One byte per sub-quantizer (nbits ≤ 8).
    pub fn code_size(&self) -> usize {
        self.m
    }

    /// Train all `M` sub-space codebooks on `n` packed residuals.
    pub fn train(&mut self, residuals: &[f32], n: usize, seed: u64) -> Result<()> {
        if residuals.len() != n * self.dim {
            return Err(Error::config(format!(
                "pq train: got {} floats for n={n}, dim={}",
                residuals.len(),
                self.dim
            )));
        }
        if n <= self.ksub {
            return Err(Error::config(format!(
                "pq train needs more than ksub={} vectors, got {n}",
                self.ksub
            )));
        }
        debug!(n, m = self.m, ksub = self.ksub, "training product quantizer");

        let mut codebooks = vec![0.0f32; self.m * self.ksub * self.dsub];
        for sub in 0..self.m {
            let mut subvectors = Vec::with_capacity(n * self.dsub);
            for row in residuals.chunks(self.dim) {
                subvectors.extend_from_slice(&row[sub * self.dsub..(sub + 1) * self.dsub]);
            }
            let centroids = kmeans(
                &subvectors,
                n,
                self.dsub,
                self.ksub,
                SUBSPACE_NITER,
                seed.wrapping_add(sub as u64),
                false,
            )?;
            let start = sub * self.ksub * self.dsub;
            codebooks[start..start + centroids.len()].copy_from_slice(&centroids);
        }
        self.codebooks = codebooks;
        self.trained = true;
        Ok(())
    }

    #[inline]
    fn codebook_entry(&self, sub: usize, code: usize) -> &[f32] {
        let start = (sub * self.ksub + code) * self.dsub;
        &self.codebooks[start..start + self.dsub]
    }

    /// Encode `n` packed residuals into `n * code_size()` bytes.
    pub fn encode(&self, residuals: &[f32], n: usize) -> Result<Vec<u8>> {
        self.require_trained()?;
        if residuals.len() != n * self.dim {
            return Err(Error::config(format!(
                "pq encode: got {} floats for n={n}, dim={}",
                residuals.len(),
                self.dim
            )));
        }
        let mut out = vec![0u8; n * self.m];
        out.chunks_mut(self.m)
            .zip(residuals.chunks(self.dim))
            .for_each(|(codes, row)| {
                for sub in 0..self.m {
                    let subvec = &row[sub * self.dsub..(sub + 1) * self.dsub];
                    let mut best = 0usize;
                    let mut best_score = f32::NEG_INFINITY;
                    for c in 0..self.ksub {
                        let score = inner_product(subvec, self.codebook_entry(sub, c));
                        if score > best_score {
                            best_score = score;
                            best = c;
                        }
                    }
                    codes[sub] = best as u8;
                }
            });
        Ok(out)
    }

    /// Decode `n * code_size()` bytes into codebook-entry approximations.
    pub fn decode(&self, codes: &[u8], n: usize) -> Result<Vec<f32>> {
        self.require_trained()?;
        if codes.len() != n * self.m {
            return Err(Error::corrupt(format!(
                "pq decode: got {} bytes for n={n}, code_size={}",
                codes.len(),
                self.m
            )));
        }
        let mut out = vec![0.0f32; n * self.dim];
        for (row_codes, row) in codes.chunks(self.m).zip(out.chunks_mut(self.dim)) {
            for sub in 0..self.m {
                let entry = self.codebook_entry(sub, row_codes[sub] as usize);
                row[sub * self.dsub..(sub + 1) * self.dsub].copy_from_slice(entry);
            }
        }
        Ok(out)
    }

    /// Precompute per-query-token ADC tables for `n` packed query vectors.
    pub fn distance_tables(&self, queries: &[f32], n: usize) -> Result<DistanceTables> {
        self.require_trained()?;
        if queries.len() != n * self.dim {
            return Err(Error::config(format!(
                "pq distance tables: got {} floats for n={n}, dim={}",
                queries.len(),
                self.dim
            )));
        }
        let table_len = self.m * self.ksub;
        let tables: Vec<f32> = queries
            .par_chunks(self.dim)
            .flat_map_iter(|query| {
                let mut table = vec![0.0f32; table_len];
                for sub in 0..self.m {
                    let subquery = &query[sub * self.dsub..(sub + 1) * self.dsub];
                    for c in 0..self.ksub {
                        table[sub * self.ksub + c] =
                            inner_product(subquery, self.codebook_entry(sub, c));
                    }
                }
                table
            })
            .collect();
        Ok(DistanceTables {
            tables,
            m: self.m,
            ksub: self.ksub,
            num_tokens: n,
        })
    }

    fn require_trained(&self) -> Result<()> {
        if self.trained { Ok(()) } else { Err(Error::NotTrained) }
    }
}

/// Precomputed `(M × ksub)` inner-product tables, one per query token.
#[derive(Debug, Clone)]
pub struct DistanceTables {
    tables: Vec<f32>,
    m: usize,
    ksub: usize,
    num_tokens: usize,
}

impl DistanceTables {
    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    /// ADC score of one document-token code against one query token: the
    /// sum of `M` table lookups, equal to the inner product of the query
    /// token with the decoded residual.
    #[inline]
    pub fn score(&self, query_token: usize, code: &[u8]) -> f32 {
        debug_assert!(query_token < self.num_tokens);
        debug_assert_eq!(code.len(), self.m);
        let table = &self.tables[query_token * self.m * self.ksub..];
        let mut acc = 0.0f32;
        for (sub, &c) in code.iter().enumerate() {
            acc += table[sub * self.ksub + c as usize];
        }
        acc
    }
}
