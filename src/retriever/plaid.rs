//! ColBERT-style two-phase retrieval.
//!
//! Phase one approximates MaxSim from centroid information alone: for each
//! query token, the best score among the centroids a document's tokens
//! actually touch. Phase two re-ranks the survivors exactly, decoding their
//! residuals back into token embeddings and running the full `Q · Dᵀ`
//! sum-of-max.

use std::collections::{HashMap, HashSet};

use rayon::prelude::*;
use tracing::warn;

use super::{
    CentroidScores, SearchOptions, SearchResult, collect_candidates, log_expected_position,
    prune_centroids, sort_ranked,
};
use crate::coarse::CoarseQuantizer;
use crate::error::{Error, Result};
use crate::math::{matmul_transposed, normalize_rows};
use crate::quantizer::ResidualCodec;
use crate::storage::Storage;

pub(crate) fn retrieve_plaid(
    coarse: &CoarseQuantizer,
    codec: &ResidualCodec,
    storage: &Storage,
    tenant: u64,
    query: &[f32],
    num_query_tokens: usize,
    k: usize,
    opts: &SearchOptions,
) -> Result<Vec<SearchResult>> {
    let scores = CentroidScores::compute(coarse, query, num_query_tokens)?;
    let probe_set = prune_centroids(&scores, opts);
    if probe_set.is_empty() || opts.cancelled() {
        return Ok(Vec::new());
    }
    let candidates = collect_candidates(storage, tenant, &probe_set)?;
    if candidates.is_empty() || opts.cancelled() {
        return Ok(Vec::new());
    }

    // Bulk-load forward codes; candidates without a forward record are
    // skipped, not fatal.
    let loaded = storage.codes_many(tenant, &candidates)?;
    let mut doc_codes: Vec<(i64, Vec<u32>)> = Vec::with_capacity(candidates.len());
    for (doc_id, codes) in candidates.into_iter().zip(loaded) {
        match codes {
            Some(codes) => doc_codes.push((doc_id, codes)),
            None => warn!(tenant, doc_id, "candidate has no forward codes, skipping"),
        }
    }

    // Phase one, parallel across documents.
    let mut ranked: Vec<(f32, i64)> = doc_codes
        .par_iter()
        .map(|(doc_id, codes)| (centroid_score(codes, &scores), *doc_id))
        .collect();
    sort_ranked(&mut ranked);
    if opts.num_docs_to_score != 0 {
        ranked.truncate(opts.num_docs_to_score);
    }
    log_expected_position("phase-one", opts.expected_id, &ranked);

    // The re-rank takes a quarter of the second-pass budget, never fewer
    // than one document.
    let cutoff = if opts.num_second_pass != 0 {
        opts.num_second_pass
    } else {
        ranked.len()
    };
    let num_rerank = (cutoff / 4).max(1).min(ranked.len());
    let rerank_ids: Vec<i64> = ranked[..num_rerank].iter().map(|&(_, id)| id).collect();

    if opts.cancelled() {
        return Ok(Vec::new());
    }
    let codes_by_id: HashMap<i64, &Vec<u32>> =
        doc_codes.iter().map(|(id, codes)| (*id, codes)).collect();
    let residuals = storage.residuals_many(tenant, &rerank_ids)?;

    // Phase two, parallel across documents, bailing between documents once
    // the host cancels.
    let mut rescored: Vec<(f32, i64, Vec<f32>)> = rerank_ids
        .par_iter()
        .zip(residuals.into_par_iter())
        .filter_map(|(&doc_id, blob)| {
            if opts.cancelled() {
                return None;
            }
            let Some((num_tokens, bytes)) = blob else {
                warn!(tenant, doc_id, "survivor has no residual record, skipping");
                return None;
            };
            let Some(codes) = codes_by_id.get(&doc_id) else {
                return None;
            };
            Some(
                score_by_residuals(
                    coarse,
                    codec,
                    query,
                    num_query_tokens,
                    doc_id,
                    codes.as_slice(),
                    num_tokens,
                    &bytes,
                )
                .map(|(score, token_scores)| (score, doc_id, token_scores)),
            )
        })
        .collect::<Result<_>>()?;

    rescored.sort_unstable_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
    log_expected_position(
        "phase-two",
        opts.expected_id,
        &rescored.iter().map(|&(s, id, _)| (s, id)).collect::<Vec<_>>(),
    );
    rescored.truncate(k);

    Ok(rescored
        .into_iter()
        .map(|(score, doc_id, token_scores)| SearchResult {
            doc_id,
            score,
            metadata: None,
            token_scores: Some(token_scores),
        })
        .collect())
}

/// Phase-one approximation: `Σ_j max_{c ∈ distinct codes} S[j, c]`.
fn centroid_score(codes: &[u32], scores: &CentroidScores) -> f32 {
    if codes.is_empty() {
        return 0.0;
    }
    let mut per_token = vec![f32::NEG_INFINITY; scores.num_tokens];
    let mut seen: HashSet<u32> = HashSet::with_capacity(codes.len());
    for &code in codes {
        if seen.insert(code) {
            for (token, best) in per_token.iter_mut().enumerate() {
                let s = scores.score(token, code);
                if s > *best {
                    *best = s;
                }
            }
        }
    }
    per_token.iter().sum()
}

/// Phase-two exact score: decode residuals, add centroids back,
/// renormalize, and run the dense MaxSim.
#[allow(clippy::too_many_arguments)]
fn score_by_residuals(
    coarse: &CoarseQuantizer,
    codec: &ResidualCodec,
    query: &[f32],
    num_query_tokens: usize,
    doc_id: i64,
    codes: &[u32],
    num_tokens: usize,
    residual_bytes: &[u8],
) -> Result<(f32, Vec<f32>)> {
    if num_tokens != codes.len() {
        return Err(Error::corrupt(format!(
            "document {doc_id}: residual record claims {num_tokens} tokens, codes have {}",
            codes.len()
        )));
    }
    let dim = coarse.dim();
    let mut decoded = codec.decode(residual_bytes, num_tokens)?;
    for (token, row) in decoded.chunks_mut(dim).enumerate() {
        let centroid = coarse.reconstruct(codes[token])?;
        for (x, &c) in row.iter_mut().zip(centroid) {
            *x += c;
        }
    }
    normalize_rows(&mut decoded, dim);

    let qd = matmul_transposed(query, &decoded, num_query_tokens, num_tokens, dim);
    let mut token_scores = vec![0.0f32; num_query_tokens];
    for (j, row) in qd.chunks(num_tokens).enumerate() {
        token_scores[j] = row.iter().copied().fold(0.0f32, f32::max);
    }
    let score = token_scores.iter().sum();
    Ok((score, token_scores))
}
