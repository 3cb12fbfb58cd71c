//! Retrieval pipeline shared by the Plaid and XTR strategies.
//!
//! Both start the same way: score every query token against every centroid
//! with one dense matmul, prune to a probe set, and walk the probed posting
//! lists. They diverge in how candidate documents are scored: Plaid runs a
//! code-level approximation followed by an exact decoded-residual re-rank,
//! XTR scores posting payloads directly and imputes what it never saw.

mod plaid;
mod xtr;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use tracing::info;

pub(crate) use plaid::retrieve_plaid;
pub(crate) use xtr::retrieve_xtr;

use crate::coarse::CoarseQuantizer;
use crate::error::Result;
use crate::math::top_k_desc;
use crate::storage::{MetadataMap, Storage};

/// Knobs trading recall for latency at each retrieval stage.
///
/// Searching more lists: raise `k_top_centroids` and `n_probe`, lower
/// `centroid_score_threshold`. Cutting latency: the opposite.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Posting lists visited after pruning.
    pub n_probe: usize,
    /// Centroids considered per query token before collapsing.
    pub k_top_centroids: usize,
    /// Centroids scoring below this are never probed.
    pub centroid_score_threshold: f32,
    /// Phase-one survivors handed to the re-rank stage (Plaid).
    pub num_second_pass: usize,
    /// Hard cap on candidates kept after the phase-one sort; 0 = no cap.
    pub num_docs_to_score: usize,
    /// Posting hits kept per query token before imputation (XTR).
    pub nearest_tokens_to_fetch: usize,
    /// Debugging aid: log this document's rank and score after each phase.
    pub expected_id: Option<i64>,
    /// Cooperative cancellation, checked between documents during long
    /// scans. A cancelled search returns empty without error; timeouts are
    /// the host's job.
    pub cancel_flag: Option<Arc<AtomicBool>>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            n_probe: 32,
            k_top_centroids: 2,
            centroid_score_threshold: 0.45,
            num_second_pass: 1024,
            num_docs_to_score: 0,
            nearest_tokens_to_fetch: 100,
            expected_id: None,
            cancel_flag: None,
        }
    }
}

impl SearchOptions {
    pub(crate) fn cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

/// One ranked hit.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub doc_id: i64,
    pub score: f32,
    /// Metadata stored with the document, when any.
    pub metadata: Option<MetadataMap>,
    /// Per-query-token sub-scores backing `score`.
    pub token_scores: Option<Vec<f32>>,
}

/// The `(num_tokens × nlist)` query-to-centroid score matrix.
pub(crate) struct CentroidScores {
    matrix: Vec<f32>,
    pub num_tokens: usize,
    pub nlist: usize,
}

impl CentroidScores {
    pub(crate) fn compute(
        coarse: &CoarseQuantizer,
        query: &[f32],
        num_tokens: usize,
    ) -> Result<Self> {
        let matrix = coarse.score_matrix(query, num_tokens)?;
        Ok(CentroidScores {
            matrix,
            num_tokens,
            nlist: coarse.num_centroids(),
        })
    }

    #[inline]
    pub(crate) fn score(&self, query_token: usize, centroid: u32) -> f32 {
        self.matrix[query_token * self.nlist + centroid as usize]
    }

    pub(crate) fn row(&self, query_token: usize) -> &[f32] {
        &self.matrix[query_token * self.nlist..(query_token + 1) * self.nlist]
    }
}

/// Step 1: collapse per-token top centroids into a probe set capped at
/// `n_probe`, ranked by the best score any query token gave the centroid.
pub(crate) fn prune_centroids(scores: &CentroidScores, opts: &SearchOptions) -> Vec<u32> {
    let mut best_per_centroid: Vec<f32> = vec![f32::NEG_INFINITY; scores.nlist];
    for token in 0..scores.num_tokens {
        for (centroid, score) in top_k_desc(scores.row(token), opts.k_top_centroids) {
            if score > opts.centroid_score_threshold
                && score > best_per_centroid[centroid as usize]
            {
                best_per_centroid[centroid as usize] = score;
            }
        }
    }

    let mut ranked: Vec<(u32, f32)> = best_per_centroid
        .iter()
        .enumerate()
        .filter(|&(_, &s)| s.is_finite())
        .map(|(c, &s)| (c as u32, s))
        .collect();
    ranked.sort_unstable_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.truncate(opts.n_probe);
    ranked.into_iter().map(|(c, _)| c).collect()
}

/// Step 2: union the probed posting lists into one candidate set,
/// ascending. Parallel across centroids; per-thread partial sets merge
/// at the reduce.
pub(crate) fn collect_candidates(
    storage: &Storage,
    tenant: u64,
    probe_set: &[u32],
) -> Result<Vec<i64>> {
    let sets: Vec<Vec<i64>> = probe_set
        .par_iter()
        .map(|&centroid| storage.posting_docs(tenant, centroid))
        .collect::<Result<_>>()?;

    let mut unique: HashSet<i64> = HashSet::new();
    for set in sets {
        unique.extend(set);
    }
    let mut candidates: Vec<i64> = unique.into_iter().collect();
    candidates.sort_unstable();
    Ok(candidates)
}

/// Descending score, ties broken by ascending doc id.
pub(crate) fn sort_ranked(ranked: &mut [(f32, i64)]) {
    ranked.sort_unstable_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
}

/// `expected_id` debugging: report where the document landed in a ranked
/// phase output.
pub(crate) fn log_expected_position(phase: &str, expected: Option<i64>, ranked: &[(f32, i64)]) {
    let Some(expected) = expected else {
        return;
    };
    match ranked.iter().position(|&(_, id)| id == expected) {
        Some(pos) => {
            info!(phase, expected, pos, score = ranked[pos].0, "expected document ranked")
        }
        None => info!(phase, expected, "expected document absent"),
    }
}
