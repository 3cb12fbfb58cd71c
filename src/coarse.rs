//! Coarse IVF quantizer: k-means centroids over unit-norm token vectors.
//!
//! The centroid table is immutable once training finishes; query-time reads
//! borrow it freely across threads. `reset` + `add` replace the table
//! wholesale, which is how parallel index builders share one codebook.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use rayon::prelude::*;
use tracing::debug;

use crate::error::{Error, Result};
use crate::kmeans::kmeans;
use crate::math::{inner_product, matmul_transposed, top_k_desc};
use crate::version::Version;

/// File name inside the index directory.
pub const COARSE_QUANTIZER_FILENAME: &str = "coarse_quantizer.bin";

const MAGIC: &[u8; 4] = b"LIRE";
const FORMAT: u32 = 2;

/// IVF centroid table with assignment, residual, and top-k search support.
#[derive(Debug, Clone)]
pub struct CoarseQuantizer {
    dim: usize,
    centroids: Vec<f32>,
    trained: bool,
}

impl CoarseQuantizer {
    /// An untrained quantizer for `dim`-dimensional vectors.
    pub fn new(dim: usize) -> Self {
        CoarseQuantizer {
            dim,
            centroids: Vec::new(),
            trained: false,
        }
    }

    /// A trained quantizer wrapping an existing centroid table.
    pub fn with_centroids(dim: usize, centroids: Vec<f32>) -> Result<Self> {
        if dim == 0 || centroids.is_empty() || centroids.len() % dim != 0 {
            return Err(Error::config(format!(
                "centroid table length {} is not a multiple of dim {dim}",
                centroids.len()
            )));
        }
        Ok(CoarseQuantizer {
            dim,
            centroids,
            trained: true,
        })
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn num_centroids(&self) -> usize {
        self.centroids.len() / self.dim
    }

    pub fn centroids(&self) -> &[f32] {
        &self.centroids
    }

    /// Cluster `n` vectors into `nlist` centroids. Centroids are
    /// renormalized to unit length, preserving the inner-product ≈ L2
    /// equivalence for unit-norm inputs.
    pub fn train(&mut self, data: &[f32], n: usize, nlist: usize, niter: usize, seed: u64) -> Result<()> {
        if self.trained {
            return Err(Error::AlreadyTrained);
        }
        if nlist == 0 || nlist > u32::MAX as usize {
            return Err(Error::config(format!("nlist {nlist} does not fit a 32-bit code")));
        }
        self.centroids = kmeans(data, n, self.dim, nlist, niter, seed, true)?;
        self.trained = true;
        debug!(nlist, dim = self.dim, "coarse quantizer trained");
        Ok(())
    }

    /// Nearest centroid (by inner product) for each of `n` packed vectors.
    pub fn assign(&self, data: &[f32], n: usize) -> Result<Vec<u32>> {
        self.require_trained()?;
        if data.len() != n * self.dim {
            return Err(Error::config(format!(
                "assign: data length {} does not match n*dim = {}",
                data.len(),
                n * self.dim
            )));
        }
        Ok(data
            .par_chunks(self.dim)
            .map(|vec| {
                let mut best = 0u32;
                let mut best_score = f32::NEG_INFINITY;
                for (idx, centroid) in self.centroids.chunks(self.dim).enumerate() {
                    let score = inner_product(vec, centroid);
                    if score > best_score {
                        best_score = score;
                        best = idx as u32;
                    }
                }
                best
            })
            .collect())
    }

    /// `out = vec − centroids[centroid]`, elementwise. No renormalization.
    pub fn residual(&self, vec: &[f32], centroid: u32, out: &mut [f32]) -> Result<()> {
        self.require_trained()?;
        let table = self.reconstruct(centroid)?;
        for ((o, &v), &c) in out.iter_mut().zip(vec).zip(table) {
            *o = v - c;
        }
        Ok(())
    }

    /// The centroid vector for `centroid`.
    pub fn reconstruct(&self, centroid: u32) -> Result<&[f32]> {
        self.require_trained()?;
        let idx = centroid as usize;
        if idx >= self.num_centroids() {
            return Err(Error::corrupt(format!(
                "centroid {centroid} out of range (nlist = {})",
                self.num_centroids()
            )));
        }
        Ok(&self.centroids[idx * self.dim..(idx + 1) * self.dim])
    }

    /// Full `(n × nlist)` inner-product score matrix for `n` query vectors.
    pub fn score_matrix(&self, queries: &[f32], n: usize) -> Result<Vec<f32>> {
        self.require_trained()?;
        if queries.len() != n * self.dim {
            return Err(Error::config(format!(
                "search: query length {} does not match n*dim = {}",
                queries.len(),
                n * self.dim
            )));
        }
        Ok(matmul_transposed(
            queries,
            &self.centroids,
            n,
            self.num_centroids(),
            self.dim,
        ))
    }

    /// Top `k_top` centroids per query vector: one dense matmul followed by
    /// a per-row partial top-k, parallel over rows. Returns `(indices,
    /// scores)`, each `n × k_top` row-major.
    pub fn search(&self, queries: &[f32], n: usize, k_top: usize) -> Result<(Vec<u32>, Vec<f32>)> {
        let matrix = self.score_matrix(queries, n)?;
        let nlist = self.num_centroids();
        let k_top = k_top.min(nlist);

        let rows: Vec<Vec<(u32, f32)>> = matrix
            .par_chunks(nlist)
            .map(|row| top_k_desc(row, k_top))
            .collect();

        let mut indices = Vec::with_capacity(n * k_top);
        let mut scores = Vec::with_capacity(n * k_top);
        for row in rows {
            for (idx, score) in row {
                indices.push(idx);
                scores.push(score);
            }
        }
        Ok((indices, scores))
    }

    /// Drop the centroid table. Follow with [`CoarseQuantizer::add`] to
    /// install a shared codebook.
    pub fn reset(&mut self) {
        self.centroids.clear();
        self.trained = false;
    }

    /// Append `n` centroid rows; marks the quantizer trained.
    pub fn add(&mut self, data: &[f32], n: usize) -> Result<()> {
        if data.len() != n * self.dim {
            return Err(Error::config(format!(
                "add: data length {} does not match n*dim = {}",
                data.len(),
                n * self.dim
            )));
        }
        if self.centroids.len() / self.dim + n > u32::MAX as usize {
            return Err(Error::config("centroid table exceeds 32-bit code range"));
        }
        self.centroids.extend_from_slice(data);
        self.trained = true;
        Ok(())
    }

    /// Write the current (format 2) layout: magic, format tag, then
    /// `d:u64, nlist:u64, is_trained:u8, centroids`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(dir.join(COARSE_QUANTIZER_FILENAME))?);
        out.write_all(MAGIC)?;
        out.write_all(&FORMAT.to_le_bytes())?;
        self.write_body(&mut out)?;
        out.flush()?;
        Ok(())
    }

    /// Load, picking the parser from the index version recorded in
    /// `metadata.json`: pre-0.5.0 indexes wrote the headerless format 1.
    pub fn load(dir: &Path, index_version: Version) -> Result<Self> {
        let path = dir.join(COARSE_QUANTIZER_FILENAME);
        let mut input = BufReader::new(File::open(&path).map_err(|_| {
            Error::not_found(format!("coarse quantizer at {}", path.display()))
        })?);

        if index_version.legacy_coarse_format() {
            return Self::read_body(&mut input);
        }

        let mut magic = [0u8; 4];
        input.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::corrupt(format!(
                "bad magic in {}: expected {MAGIC:?}, got {magic:?}",
                path.display()
            )));
        }
        let mut format = [0u8; 4];
        input.read_exact(&mut format)?;
        let format = u32::from_le_bytes(format);
        if format != FORMAT {
            return Err(Error::corrupt(format!(
                "unsupported coarse quantizer format {format} in {}",
                path.display()
            )));
        }
        Self::read_body(&mut input)
    }

    fn write_body(&self, out: &mut impl Write) -> Result<()> {
        out.write_all(&(self.dim as u64).to_le_bytes())?;
        out.write_all(&(self.num_centroids() as u64).to_le_bytes())?;
        out.write_all(&[u8::from(self.trained)])?;
        out.write_all(bytemuck::cast_slice(&self.centroids))?;
        Ok(())
    }

    fn read_body(input: &mut impl Read) -> Result<Self> {
        let mut u64_buf = [0u8; 8];
        input.read_exact(&mut u64_buf)?;
        let dim = u64::from_le_bytes(u64_buf) as usize;
        input.read_exact(&mut u64_buf)?;
        let nlist = u64::from_le_bytes(u64_buf) as usize;
        let mut flag = [0u8; 1];
        input.read_exact(&mut flag)?;
        let trained = flag[0] != 0;

        let mut bytes = vec![0u8; nlist * dim * size_of::<f32>()];
        input.read_exact(&mut bytes)?;
        let centroids: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes);

        if dim == 0 || (trained && nlist == 0) {
            return Err(Error::corrupt("coarse quantizer header is inconsistent"));
        }
        Ok(CoarseQuantizer {
            dim,
            centroids,
            trained,
        })
    }

    fn require_trained(&self) -> Result<()> {
        if self.trained { Ok(()) } else { Err(Error::NotTrained) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::normalize_rows;
    use tempfile::TempDir;

    fn trained_quantizer() -> CoarseQuantizer {
        // Axis-aligned centroids in 4d.
        let centroids = vec![
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, //
        ];
        CoarseQuantizer::with_centroids(4, centroids).expect("trained")
    }

    #[test]
    fn untrained_operations_fail() {
        let q = CoarseQuantizer::new(4);
        assert!(matches!(q.assign(&[0.0; 4], 1), Err(Error::NotTrained)));
        assert!(matches!(q.score_matrix(&[0.0; 4], 1), Err(Error::NotTrained)));
    }

    #[test]
    fn assign_picks_nearest_axis() {
        let q = trained_quantizer();
        let data = vec![
            0.9, 0.1, 0.0, 0.0, //
            0.0, 0.1, 0.9, 0.0, //
        ];
        assert_eq!(q.assign(&data, 2).expect("assign"), vec![0, 2]);
    }

    #[test]
    fn residual_is_elementwise_difference() {
        let q = trained_quantizer();
        let vec = [0.9, 0.1, 0.0, 0.0];
        let mut out = [0.0f32; 4];
        q.residual(&vec, 0, &mut out).expect("residual");
        let expected = [0.9f32 - 1.0, 0.1, 0.0, 0.0];
        for (a, b) in out.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn search_returns_descending_scores() {
        let q = trained_quantizer();
        let query = [0.6, 0.8, 0.0, 0.0];
        let (indices, scores) = q.search(&query, 1, 2).expect("search");
        assert_eq!(indices, vec![1, 0]);
        assert!(scores[0] >= scores[1]);
    }

    #[test]
    fn train_then_assign_round_trips_cluster_members() {
        let mut data: Vec<f32> = Vec::new();
        for i in 0..32 {
            if i < 16 {
                data.extend_from_slice(&[1.0, 0.02 * (i % 4) as f32, 0.0, 0.0]);
            } else {
                data.extend_from_slice(&[0.0, 0.0, 1.0, 0.02 * (i % 4) as f32]);
            }
        }
        normalize_rows(&mut data, 4);
        let mut q = CoarseQuantizer::new(4);
        q.train(&data, 32, 2, 8, 99).expect("train");
        let codes = q.assign(&data, 32).expect("assign");
        assert_eq!(codes[0..16].iter().collect::<std::collections::HashSet<_>>().len(), 1);
        assert_eq!(codes[16..32].iter().collect::<std::collections::HashSet<_>>().len(), 1);
        assert_ne!(codes[0], codes[16]);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let q = trained_quantizer();
        q.save(dir.path()).expect("save");
        let loaded = CoarseQuantizer::load(dir.path(), Version::current()).expect("load");
        assert_eq!(loaded.dim(), q.dim());
        assert_eq!(loaded.num_centroids(), q.num_centroids());
        assert_eq!(loaded.centroids(), q.centroids());
        assert!(loaded.is_trained());
    }

    #[test]
    fn legacy_format_loads_without_header() {
        let dir = TempDir::new().expect("tempdir");
        let q = trained_quantizer();
        // Write a format-1 file by hand: body only, no magic.
        let path = dir.path().join(COARSE_QUANTIZER_FILENAME);
        let mut out = std::fs::File::create(&path).expect("create");
        q.write_body(&mut out).expect("body");

        let loaded = CoarseQuantizer::load(dir.path(), Version::new(0, 4, 1)).expect("load legacy");
        assert_eq!(loaded.centroids(), q.centroids());

        // The same bytes must be rejected under a current-version index.
        assert!(CoarseQuantizer::load(dir.path(), Version::current()).is_err());
    }

    #[test]
    fn reset_and_add_install_shared_codebook() {
        let mut q = trained_quantizer();
        q.reset();
        assert!(!q.is_trained());
        q.add(&[0.0, 0.0, 0.0, 1.0], 1).expect("add");
        assert!(q.is_trained());
        assert_eq!(q.num_centroids(), 1);
        assert_eq!(q.reconstruct(0).expect("reconstruct"), &[0.0, 0.0, 0.0, 1.0]);
    }
}
