//! Dense kernels shared by training, encoding, and retrieval.
//!
//! The interface is deliberately row-major-only: `matmul_transposed` takes
//! two row-major matrices and scores every row of `a` against every row of
//! `b`, which is the one shape the engine ever needs (queries × centroids,
//! queries × decoded document tokens).

use rayon::prelude::*;

/// Unrolled inner product of two equal-length slices.
#[inline]
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut acc = 0.0f32;
    let mut i = 0;
    while i + 4 <= a.len() {
        acc += a[i] * b[i];
        acc += a[i + 1] * b[i + 1];
        acc += a[i + 2] * b[i + 2];
        acc += a[i + 3] * b[i + 3];
        i += 4;
    }
    while i < a.len() {
        acc += a[i] * b[i];
        i += 1;
    }
    acc
}

/// L2-normalize one vector in place. Zero vectors are left untouched.
pub fn normalize(v: &mut [f32]) {
    let norm = inner_product(v, v).sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// L2-normalize `n` packed `dim`-length rows in place.
pub fn normalize_rows(data: &mut [f32], dim: usize) {
    debug_assert_eq!(data.len() % dim.max(1), 0);
    for row in data.chunks_mut(dim) {
        normalize(row);
    }
}

/// `out[i * n + j] = ⟨a_i, b_j⟩` for row-major `a` (`m × dim`) and `b`
/// (`n × dim`). Parallel over rows of `a`.
pub fn matmul_transposed(a: &[f32], b: &[f32], m: usize, n: usize, dim: usize) -> Vec<f32> {
    debug_assert_eq!(a.len(), m * dim);
    debug_assert_eq!(b.len(), n * dim);
    let mut out = vec![0.0f32; m * n];
    out.par_chunks_mut(n)
        .zip(a.par_chunks(dim))
        .for_each(|(out_row, a_row)| {
            for (j, b_row) in b.chunks(dim).enumerate() {
                out_row[j] = inner_product(a_row, b_row);
            }
        });
    out
}

/// Indices and values of the `k` largest entries of `scores`, descending,
/// ties broken by ascending index.
pub fn top_k_desc(scores: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut pairs: Vec<(u32, f32)> = scores
        .iter()
        .enumerate()
        .map(|(i, &s)| (i as u32, s))
        .collect();
    let k = k.min(pairs.len());
    if k == 0 {
        return Vec::new();
    }
    pairs.select_nth_unstable_by(k - 1, |a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    pairs.truncate(k);
    pairs.sort_unstable_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inner_product_matches_naive() {
        let a: Vec<f32> = (0..37).map(|i| i as f32 * 0.5).collect();
        let b: Vec<f32> = (0..37).map(|i| (i as f32 - 18.0) * 0.25).collect();
        let naive: f32 = a.iter().zip(&b).map(|(x, y)| x * y).sum();
        assert!((inner_product(&a, &b) - naive).abs() < 1e-4);
    }

    #[test]
    fn normalize_produces_unit_norm() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((inner_product(&v, &v) - 1.0).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn matmul_scores_every_pair() {
        // a: 2 rows, b: 3 rows, dim 2.
        let a = [1.0, 0.0, 0.0, 1.0];
        let b = [1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let out = matmul_transposed(&a, &b, 2, 3, 2);
        assert_eq!(out, vec![1.0, 0.0, 1.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn top_k_breaks_ties_by_index() {
        let scores = [0.5, 0.9, 0.5, 0.9];
        let top = top_k_desc(&scores, 3);
        assert_eq!(top.len(), 3);
        assert_eq!((top[0].0, top[1].0, top[2].0), (1, 3, 0));
    }

    #[test]
    fn top_k_clamps_to_len() {
        let top = top_k_desc(&[1.0, 2.0], 10);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].0, 1);
    }
}
