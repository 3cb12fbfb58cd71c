//! Scalar residual quantizer: per-dimension bucket indices packed into bits.
//!
//! Training fits `2^nbits` buckets to the distribution of the mean residual;
//! encoding maps each dimension to a bucket index and bit-packs the indices
//! in big-endian bit order. Decoding never touches the cutoffs: a
//! reverse-bit map plus a per-byte decompression LUT turn every packed byte
//! into `8/nbits` bucket weights with pure table walks.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Bit-packing residual quantizer. 1-bit sign binarization is the common
/// configuration; 2 and 4 bits trade space for fidelity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binarizer {
    dim: usize,
    nbits: usize,
    bucket_cutoffs: Vec<f32>,
    bucket_weights: Vec<f32>,
    avg_residual: f32,
    reverse_bitmap: Vec<u8>,
    decompression_lut: Vec<u8>,
    trained: bool,
}

impl Binarizer {
    pub fn new(nbits: usize, dim: usize) -> Result<Self> {
        if !matches!(nbits, 1 | 2 | 4) {
            return Err(Error::config(format!("binarizer nbits must be 1, 2, or 4, got {nbits}")));
        }
        if dim % 8 != 0 {
            return Err(Error::config(format!("dimension must be a multiple of 8, got {dim}")));
        }
        if dim % (nbits * 8) != 0 {
            return Err(Error::config(format!(
                "dimension must be a multiple of {}, got {dim}",
                nbits * 8
            )));
        }
        Ok(Binarizer {
            dim,
            nbits,
            bucket_cutoffs: Vec::new(),
            bucket_weights: Vec::new(),
            avg_residual: 0.0,
            reverse_bitmap: Vec::new(),
            decompression_lut: Vec::new(),
            trained: false,
        })
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    pub fn nbits(&self) -> usize {
        self.nbits
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn code_size(&self) -> usize {
        self.dim * self.nbits / 8
    }

    pub fn bucket_cutoffs(&self) -> &[f32] {
        &self.bucket_cutoffs
    }

    pub fn bucket_weights(&self) -> &[f32] {
        &self.bucket_weights
    }

    pub fn avg_residual(&self) -> f32 {
        self.avg_residual
    }

    /// Widest gap between adjacent bucket weights; bounds the per-dimension
    /// reconstruction error of any in-range value.
    pub fn max_bucket_width(&self) -> f32 {
        self.bucket_weights
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .fold(0.0, f32::max)
    }

    /// Fit cutoffs and weights from the per-dimension mean of `n` residuals.
    pub fn train(&mut self, residuals: &[f32], n: usize) -> Result<()> {
        if n == 0 || residuals.len() != n * self.dim {
            return Err(Error::config(format!(
                "binarizer train: got {} floats for n={n}, dim={}",
                residuals.len(),
                self.dim
            )));
        }
        debug!(n, dim = self.dim, nbits = self.nbits, "training binarizer");

        let mut mean = vec![0.0f32; self.dim];
        for row in residuals.chunks(self.dim) {
            for (acc, &x) in mean.iter_mut().zip(row) {
                *acc += x;
            }
        }
        for x in mean.iter_mut() {
            *x /= n as f32;
        }

        self.calculate_quantiles(&mean);
        self.reverse_bitmap = self.create_reverse_bitmap();
        self.decompression_lut = self.create_decompression_lut();
        self.trained = true;
        Ok(())
    }

    /// Install externally fitted parameters (shared-codebook builds).
    pub fn set_parameters(
        &mut self,
        weights: Vec<f32>,
        cutoffs: Vec<f32>,
        avg_residual: f32,
    ) -> Result<()> {
        if weights.len() != 1 << self.nbits {
            return Err(Error::config(format!(
                "expected {} bucket weights, got {}",
                1 << self.nbits,
                weights.len()
            )));
        }
        self.bucket_weights = weights;
        self.bucket_cutoffs = cutoffs;
        self.avg_residual = avg_residual;
        self.reverse_bitmap = self.create_reverse_bitmap();
        self.decompression_lut = self.create_decompression_lut();
        self.trained = true;
        Ok(())
    }

    /// Bit-pack `n` residual vectors into `n * code_size()` bytes.
    pub fn encode(&self, residuals: &[f32], n: usize) -> Result<Vec<u8>> {
        self.require_trained()?;
        if residuals.len() != n * self.dim {
            return Err(Error::config(format!(
                "binarizer encode: got {} floats for n={n}, dim={}",
                residuals.len(),
                self.dim
            )));
        }
        let code_size = self.code_size();
        let mut out = vec![0u8; n * code_size];
        for (row, codes) in residuals.chunks(self.dim).zip(out.chunks_mut(code_size)) {
            self.pack_row(row, codes);
        }
        Ok(out)
    }

    /// Decode `n * code_size()` bytes into bucket-weight approximations.
    pub fn decode(&self, codes: &[u8], n: usize) -> Result<Vec<f32>> {
        self.require_trained()?;
        let code_size = self.code_size();
        if codes.len() != n * code_size {
            return Err(Error::corrupt(format!(
                "binarizer decode: got {} bytes for n={n}, code_size={code_size}",
                codes.len()
            )));
        }
        let vals_per_byte = 8 / self.nbits;
        let mut out = vec![0.0f32; n * self.dim];
        for (packed_row, row) in codes.chunks(code_size).zip(out.chunks_mut(self.dim)) {
            for (byte_idx, &packed) in packed_row.iter().enumerate() {
                let reversed = self.reverse_bitmap[packed as usize] as usize;
                for slot in 0..vals_per_byte {
                    let weight_idx = self.decompression_lut[reversed * vals_per_byte + slot];
                    row[byte_idx * vals_per_byte + slot] = self.bucket_weights[weight_idx as usize];
                }
            }
        }
        Ok(out)
    }

    fn calculate_quantiles(&mut self, mean_residual: &[f32]) {
        self.avg_residual =
            mean_residual.iter().map(|x| x.abs()).sum::<f32>() / mean_residual.len() as f32;

        let num_options = 1usize << self.nbits;
        let mut sorted = mean_residual.to_vec();
        sorted.sort_by(f32::total_cmp);
        let quantile = |q: f32| -> f32 {
            let idx = ((q * sorted.len() as f32) as usize).min(sorted.len() - 1);
            sorted[idx]
        };

        self.bucket_cutoffs = (1..num_options)
            .map(|i| quantile(i as f32 / num_options as f32))
            .collect();
        self.bucket_weights = (0..num_options)
            .map(|i| quantile(i as f32 / num_options as f32))
            .collect();
    }

    /// Bucket index of one value: first cutoff above it, else the last bucket.
    #[inline]
    fn bucketize(&self, value: f32) -> u8 {
        for (i, &cutoff) in self.bucket_cutoffs.iter().enumerate() {
            if value < cutoff {
                return i as u8;
            }
        }
        self.bucket_cutoffs.len() as u8
    }

    fn pack_row(&self, row: &[f32], out: &mut [u8]) {
        // Bit stream: bucket bits emitted low-to-high per value, packed
        // big-endian within each byte.
        let mut bit = 0usize;
        for &value in row {
            let bucket = self.bucketize(value);
            for j in 0..self.nbits {
                if (bucket >> j) & 1 == 1 {
                    out[bit / 8] |= 1 << (7 - bit % 8);
                }
                bit += 1;
            }
        }
    }

    /// Per-byte map that undoes the low-to-high bit emission inside each
    /// packed `nbits` group, so decode sees plain bucket indices.
    fn create_reverse_bitmap(&self) -> Vec<u8> {
        let mask = ((1u16 << self.nbits) - 1) as u8;
        let mut out = vec![0u8; 256];
        for (i, slot) in out.iter_mut().enumerate() {
            let mut z: u8 = 0;
            let mut j = 8usize;
            while j > 0 {
                let x = ((i >> (j - self.nbits)) as u8) & mask;
                let mut y: u8 = 0;
                for k in (0..self.nbits).rev() {
                    y += ((x >> (self.nbits - k - 1)) & 1) << k;
                }
                z |= y;
                if j > self.nbits {
                    z <<= self.nbits;
                }
                j -= self.nbits;
            }
            *slot = z;
        }
        out
    }

    /// For every possible reversed byte, the `8/nbits` bucket indices it
    /// contains, flattened row-major.
    fn create_decompression_lut(&self) -> Vec<u8> {
        let vals_per_byte = 8 / self.nbits;
        let num_keys = 1usize << self.nbits;
        let mut out = vec![0u8; 256 * vals_per_byte];
        for row in 0..256 {
            for slot in 0..vals_per_byte {
                let shift = (vals_per_byte - 1 - slot) * self.nbits;
                out[row * vals_per_byte + slot] = ((row >> shift) & (num_keys - 1)) as u8;
            }
        }
        out
    }

    fn require_trained(&self) -> Result<()> {
        if self.trained { Ok(()) } else { Err(Error::NotTrained) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trained(nbits: usize, dim: usize) -> Binarizer {
        let mut b = Binarizer::new(nbits, dim).expect("construct");
        // Residuals spread evenly over [-1, 1] per dimension.
        let n = 64;
        let mut residuals = Vec::with_capacity(n * dim);
        for i in 0..n {
            for j in 0..dim {
                residuals.push(((i * dim + j) % 17) as f32 / 8.5 - 1.0);
            }
        }
        b.train(&residuals, n).expect("train");
        b
    }

    #[test]
    fn constructor_enforces_divisibility() {
        assert!(Binarizer::new(1, 12).is_err());
        assert!(Binarizer::new(2, 8).is_err());
        assert!(Binarizer::new(3, 128).is_err());
        assert!(Binarizer::new(2, 16).is_ok());
    }

    #[test]
    fn code_size_is_packed() {
        assert_eq!(Binarizer::new(1, 128).expect("b").code_size(), 16);
        assert_eq!(Binarizer::new(2, 128).expect("b").code_size(), 32);
        assert_eq!(Binarizer::new(4, 128).expect("b").code_size(), 64);
    }

    #[test]
    fn encode_decode_is_monotone() {
        for nbits in [1, 2, 4] {
            let b = trained(nbits, 32);
            let input: Vec<f32> = (0..32).map(|i| i as f32 / 16.0 - 1.0).collect();
            let codes = b.encode(&input, 1).expect("encode");
            let decoded = b.decode(&codes, 1).expect("decode");
            for pair in input.windows(2).zip(decoded.windows(2)) {
                let ((a, b_in), (x, y)) = ((pair.0[0], pair.0[1]), (pair.1[0], pair.1[1]));
                if a < b_in {
                    assert!(x <= y, "nbits={nbits}: decode not monotone: {x} > {y}");
                }
            }
        }
    }

    #[test]
    fn decode_error_is_bounded_by_bucket_width() {
        let b = trained(2, 16);
        let lo = b.bucket_weights()[0];
        let hi = *b.bucket_weights().last().expect("weights");
        // In-range inputs decode to within one bucket width.
        let input: Vec<f32> = (0..16)
            .map(|i| lo + (hi - lo) * i as f32 / 15.0)
            .collect();
        let codes = b.encode(&input, 1).expect("encode");
        let decoded = b.decode(&codes, 1).expect("decode");
        let bound = b.max_bucket_width();
        for (x, y) in input.iter().zip(&decoded) {
            assert!((x - y).abs() <= bound + 1e-6, "|{x} - {y}| > {bound}");
        }
    }

    #[test]
    fn bucket_assignment_round_trips_exactly_on_weights() {
        // Encoding a vector of bucket weights must decode to itself.
        let b = trained(2, 16);
        let weights = b.bucket_weights().to_vec();
        let input: Vec<f32> = (0..16).map(|i| weights[i % weights.len()]).collect();
        let codes = b.encode(&input, 1).expect("encode");
        let decoded = b.decode(&codes, 1).expect("decode");
        for (x, y) in input.iter().zip(&decoded) {
            // A weight sitting exactly on a cutoff may land one bucket over.
            assert!((x - y).abs() <= b.max_bucket_width() + 1e-6);
        }
    }

    #[test]
    fn set_parameters_validates_weight_count() {
        let mut b = Binarizer::new(2, 16).expect("construct");
        assert!(b.set_parameters(vec![0.0; 3], vec![0.0; 3], 0.1).is_err());
        assert!(b.set_parameters(vec![-0.5, -0.1, 0.1, 0.5], vec![-0.3, 0.0, 0.3], 0.1).is_ok());
        assert!(b.is_trained());
    }

    #[test]
    fn untrained_encode_fails() {
        let b = Binarizer::new(1, 8).expect("construct");
        assert!(matches!(b.encode(&[0.0; 8], 1), Err(Error::NotTrained)));
    }

    #[test]
    fn multi_vector_encode_lays_out_rows() {
        let b = trained(1, 8);
        let row: Vec<f32> = vec![-1.0, -0.5, -0.25, -0.1, 0.1, 0.25, 0.5, 1.0];
        let mut two = row.clone();
        two.extend_from_slice(&row);
        let one_code = b.encode(&row, 1).expect("encode one");
        let two_codes = b.encode(&two, 2).expect("encode two");
        assert_eq!(two_codes.len(), 2 * b.code_size());
        assert_eq!(&two_codes[..b.code_size()], one_code.as_slice());
        assert_eq!(&two_codes[b.code_size()..], one_code.as_slice());
    }
}
