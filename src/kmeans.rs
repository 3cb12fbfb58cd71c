//! Lloyd k-means with inner-product assignment.
//!
//! Used by both the coarse quantizer (one clustering over full vectors) and
//! the product quantizer (one clustering per sub-space). Inputs are expected
//! to be unit-norm for the coarse case, where maximizing inner product is
//! equivalent to minimizing L2; residual sub-spaces are clustered on raw
//! inner product.
//!
//! Initialization samples distinct rows with a caller-supplied seed so a
//! given training set always produces the same codebook.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rayon::prelude::*;
use tracing::debug;

use crate::error::{Error, Result};
use crate::math::{inner_product, normalize};

/// Cluster `n` packed `dim`-length rows of `data` into `k` centroids over
/// `niter` iterations. When `renormalize` is set, centroids are rescaled to
/// unit length after every update (the coarse-quantizer invariant).
pub fn kmeans(
    data: &[f32],
    n: usize,
    dim: usize,
    k: usize,
    niter: usize,
    seed: u64,
    renormalize: bool,
) -> Result<Vec<f32>> {
    if n <= k {
        return Err(Error::config(format!(
            "k-means needs more points than clusters: n={n}, k={k}"
        )));
    }
    if data.len() != n * dim {
        return Err(Error::config(format!(
            "k-means data length {} does not match n*dim = {}",
            data.len(),
            n * dim
        )));
    }
    debug!(n, dim, k, niter, "clustering");

    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = vec![0.0f32; k * dim];
    for (slot, row) in sample(&mut rng, n, k).into_iter().enumerate() {
        centroids[slot * dim..(slot + 1) * dim].copy_from_slice(&data[row * dim..(row + 1) * dim]);
    }
    if renormalize {
        for c in centroids.chunks_mut(dim) {
            normalize(c);
        }
    }

    let mut assignments = vec![0u32; n];
    for iter in 0..niter {
        // Assignment step, parallel over points.
        assignments
            .par_iter_mut()
            .zip(data.par_chunks(dim))
            .for_each(|(slot, point)| {
                *slot = nearest_centroid(point, &centroids, dim);
            });

        // Update step: per-thread partial sums merged serially.
        let (mut sums, counts) = data
            .par_chunks(dim)
            .zip(assignments.par_iter())
            .fold(
                || (vec![0.0f32; k * dim], vec![0usize; k]),
                |(mut sums, mut counts), (point, &cluster)| {
                    let c = cluster as usize;
                    for (acc, &x) in sums[c * dim..(c + 1) * dim].iter_mut().zip(point) {
                        *acc += x;
                    }
                    counts[c] += 1;
                    (sums, counts)
                },
            )
            .reduce(
                || (vec![0.0f32; k * dim], vec![0usize; k]),
                |(mut sums_a, mut counts_a), (sums_b, counts_b)| {
                    for (a, b) in sums_a.iter_mut().zip(&sums_b) {
                        *a += b;
                    }
                    for (a, b) in counts_a.iter_mut().zip(&counts_b) {
                        *a += b;
                    }
                    (sums_a, counts_a)
                },
            );

        let mut reseeded = 0usize;
        for c in 0..k {
            if counts[c] == 0 {
                // Empty cluster: reseed from a random input row.
                let row = sample(&mut rng, n, 1).index(0);
                sums[c * dim..(c + 1) * dim].copy_from_slice(&data[row * dim..(row + 1) * dim]);
                reseeded += 1;
            } else {
                let inv = 1.0 / counts[c] as f32;
                for x in sums[c * dim..(c + 1) * dim].iter_mut() {
                    *x *= inv;
                }
            }
        }
        centroids = sums;
        if renormalize {
            for c in centroids.chunks_mut(dim) {
                normalize(c);
            }
        }
        debug!(iter, reseeded, "k-means iteration");
    }

    Ok(centroids)
}

#[inline]
fn nearest_centroid(point: &[f32], centroids: &[f32], dim: usize) -> u32 {
    let mut best = 0u32;
    let mut best_score = f32::NEG_INFINITY;
    for (idx, centroid) in centroids.chunks(dim).enumerate() {
        let score = inner_product(point, centroid);
        if score > best_score {
            best_score = score;
            best = idx as u32;
        }
    }
    best
}
