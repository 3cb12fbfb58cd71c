//! Imputation-based retrieval.
//!
//! Instead of decoding full documents, this strategy scores the per-token
//! residual codes stored directly in the posting lists (ADC against
//! precomputed tables). A document therefore gets at most one observed
//! score per query token; every unobserved `(doc, token)` pair is imputed
//! with the worst score that token observed anywhere, and the final score
//! is the mean across query tokens.

use std::collections::HashMap;

use rayon::prelude::*;
use tracing::warn;

use super::{CentroidScores, SearchOptions, SearchResult, log_expected_position};
use crate::coarse::CoarseQuantizer;
use crate::error::Result;
use crate::math::top_k_desc;
use crate::quantizer::ProductQuantizer;
use crate::storage::Storage;

/// One scored posting hit: `(doc, query token) → ADC score`.
#[derive(Debug, Clone, Copy)]
struct TokenHit {
    doc_id: i64,
    query_token: usize,
    score: f32,
}

pub(crate) fn retrieve_xtr(
    coarse: &CoarseQuantizer,
    pq: &ProductQuantizer,
    storage: &Storage,
    tenant: u64,
    query: &[f32],
    num_query_tokens: usize,
    k: usize,
    opts: &SearchOptions,
) -> Result<Vec<SearchResult>> {
    let scores = CentroidScores::compute(coarse, query, num_query_tokens)?;

    // Per-token pruning: unlike Plaid, each query token keeps its own
    // centroid fan-out. Group by centroid so each posting list is scanned
    // once.
    let mut tokens_per_centroid: HashMap<u32, Vec<usize>> = HashMap::new();
    for token in 0..num_query_tokens {
        for (centroid, score) in top_k_desc(scores.row(token), opts.k_top_centroids) {
            if score > opts.centroid_score_threshold {
                tokens_per_centroid.entry(centroid).or_default().push(token);
            }
        }
    }
    if tokens_per_centroid.is_empty() || opts.cancelled() {
        return Ok(Vec::new());
    }

    let tables = pq.distance_tables(query, num_query_tokens)?;
    let code_size = pq.code_size();

    // Scan probed lists in parallel, scoring each stored token code against
    // every query token interested in that centroid.
    let mut grouped: Vec<(u32, Vec<usize>)> = tokens_per_centroid.into_iter().collect();
    grouped.sort_unstable_by_key(|&(centroid, _)| centroid);
    let hits: Vec<Vec<TokenHit>> = grouped
        .par_iter()
        .map(|(centroid, query_tokens)| {
            if opts.cancelled() {
                return Ok(Vec::new());
            }
            let entries = storage.posting_entries(tenant, *centroid)?;
            let mut out = Vec::with_capacity(entries.len() * query_tokens.len());
            for entry in entries {
                if entry.payload.len() != code_size {
                    warn!(
                        tenant,
                        doc_id = entry.doc_id,
                        got = entry.payload.len(),
                        expected = code_size,
                        "posting payload has the wrong code size, skipping"
                    );
                    continue;
                }
                for &query_token in query_tokens {
                    out.push(TokenHit {
                        doc_id: entry.doc_id,
                        query_token,
                        score: tables.score(query_token, &entry.payload),
                    });
                }
            }
            Ok(out)
        })
        .collect::<Result<_>>()?;

    // Per query token, keep only the strongest hits before aggregating.
    let mut per_token: Vec<Vec<TokenHit>> = vec![Vec::new(); num_query_tokens];
    for hit in hits.into_iter().flatten() {
        per_token[hit.query_token].push(hit);
    }
    for hits in per_token.iter_mut() {
        hits.sort_unstable_by(|a, b| b.score.total_cmp(&a.score).then(a.doc_id.cmp(&b.doc_id)));
        hits.truncate(opts.nearest_tokens_to_fetch);
    }

    // Max observed score per (doc, token); min observed score per token.
    let mut document_scores: HashMap<i64, Vec<f32>> = HashMap::new();
    let mut lowest_per_token = vec![f32::MAX; num_query_tokens];
    for hit in per_token.iter().flatten() {
        let slot = &mut document_scores
            .entry(hit.doc_id)
            .or_insert_with(|| vec![f32::NEG_INFINITY; num_query_tokens])[hit.query_token];
        if hit.score > *slot {
            *slot = hit.score;
        }
        if hit.score < lowest_per_token[hit.query_token] {
            lowest_per_token[hit.query_token] = hit.score;
        }
    }

    impute_missing_scores(&mut document_scores, &lowest_per_token);

    let mut ranked: Vec<(f32, i64, Vec<f32>)> = document_scores
        .into_iter()
        .map(|(doc_id, token_scores)| {
            let score = token_scores.iter().sum::<f32>() / num_query_tokens as f32;
            (score, doc_id, token_scores)
        })
        .collect();
    ranked.sort_unstable_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
    let flat: Vec<(f32, i64)> = ranked.iter().map(|&(s, id, _)| (s, id)).collect();
    log_expected_position("xtr", opts.expected_id, &flat);
    ranked.truncate(k);

    Ok(ranked
        .into_iter()
        .map(|(score, doc_id, token_scores)| SearchResult {
            doc_id,
            score,
            metadata: None,
            token_scores: Some(token_scores),
        })
        .collect())
}

/// Fill every unobserved `(doc, token)` slot with the worst score that
/// query token observed; tokens that matched nothing anywhere impute zero.
fn impute_missing_scores(document_scores: &mut HashMap<i64, Vec<f32>>, lowest: &[f32]) {
    for token_scores in document_scores.values_mut() {
        for (slot, &low) in token_scores.iter_mut().zip(lowest) {
            if *slot == f32::NEG_INFINITY {
                *slot = if low == f32::MAX { 0.0 } else { low };
            }
        }
    }
}
