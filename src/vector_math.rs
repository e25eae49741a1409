use std::cmp::Ordering;

use crate::rag::types::SearchResult;

/// A candidate position paired with its relevance to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredIndex {
    pub index: usize,
    pub score: f32,
}

/// An item entering recency blending.
#[derive(Debug, Clone, PartialEq)]
pub struct RecencyCandidate<T> {
    pub item: T,
    pub score: f32,
    /// Seconds since the Unix epoch.
    pub created_at: i64,
}

/// Cosine similarity with f64 accumulation.
///
/// Returns 0 for length mismatch, empty vectors or a zero-norm operand.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}

fn by_score_desc(a: f32, b: f32) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

/// Ranks `embeddings` against `query` and returns at most `k` positions.
///
/// Candidates below `threshold` are dropped. With `lambda >= 1` the result is
/// a stable relevance sort; otherwise candidates are picked greedily by
/// Maximal Marginal Relevance and returned in selection order. The score of
/// every returned entry is its query similarity, not its MMR value.
pub fn select_top_k<E: AsRef<[f32]>>(
    query: &[f32],
    embeddings: &[E],
    k: usize,
    threshold: f32,
    lambda: f32,
) -> Vec<ScoredIndex> {
    let candidates: Vec<ScoredIndex> = embeddings
        .iter()
        .enumerate()
        .map(|(index, emb)| ScoredIndex {
            index,
            score: cosine_similarity(query, emb.as_ref()),
        })
        .filter(|c| c.score >= threshold)
        .collect();

    if candidates.is_empty() || k == 0 {
        return Vec::new();
    }

    if lambda >= 1.0 {
        let mut ranked = candidates;
        ranked.sort_by(|a, b| by_score_desc(a.score, b.score));
        ranked.truncate(k);
        return ranked;
    }

    mmr_select(embeddings, &candidates, k, lambda)
}

fn mmr_select<E: AsRef<[f32]>>(
    embeddings: &[E],
    candidates: &[ScoredIndex],
    k: usize,
    lambda: f32,
) -> Vec<ScoredIndex> {
    let picks = k.min(candidates.len());
    let mut selected: Vec<ScoredIndex> = Vec::with_capacity(picks);
    let mut taken = vec![false; candidates.len()];
    // Highest similarity of each candidate to anything already selected.
    // Stays 0 while nothing is selected.
    let mut redundancy = vec![0.0f32; candidates.len()];

    while selected.len() < picks {
        let mut best: Option<(usize, f32)> = None;
        for (pos, cand) in candidates.iter().enumerate() {
            if taken[pos] {
                continue;
            }
            let mmr = lambda * cand.score - (1.0 - lambda) * redundancy[pos];
            match best {
                Some((_, best_mmr)) if mmr <= best_mmr => {}
                _ => best = Some((pos, mmr)),
            }
        }

        let Some((pos, _)) = best else {
            break;
        };
        taken[pos] = true;
        let chosen = candidates[pos];
        selected.push(chosen);

        let chosen_emb = embeddings[chosen.index].as_ref();
        for (other, cand) in candidates.iter().enumerate() {
            if taken[other] {
                continue;
            }
            let sim = cosine_similarity(embeddings[cand.index].as_ref(), chosen_emb);
            if selected.len() == 1 || sim > redundancy[other] {
                redundancy[other] = sim;
            }
        }
    }

    selected
}

/// Top-K retrieval over parallel `chunks` and `embeddings` slices.
pub fn search_top_k<E: AsRef<[f32]>>(
    query: &[f32],
    chunks: &[String],
    embeddings: &[E],
    k: usize,
    threshold: f32,
    lambda: f32,
) -> Vec<SearchResult> {
    select_top_k(query, embeddings, k, threshold, lambda)
        .into_iter()
        .filter_map(|hit| {
            chunks.get(hit.index).map(|text| SearchResult {
                text: text.clone(),
                score: hit.score,
            })
        })
        .collect()
}

/// Blends relevance with freshness normalized inside the candidate pool.
///
/// `time_score` is `(t - t_min) / (t_max - t_min)`, or 0 when every
/// candidate shares one timestamp. The blended score
/// `(1 - weight) * score + weight * time_score` replaces `score`; the pool is
/// sorted by it (stable, descending) and cut to `top_k`.
pub fn blend_recency<T>(
    mut candidates: Vec<RecencyCandidate<T>>,
    weight: f32,
    top_k: usize,
) -> Vec<RecencyCandidate<T>> {
    let Some(t_min) = candidates.iter().map(|c| c.created_at).min() else {
        return candidates;
    };
    let t_max = candidates
        .iter()
        .map(|c| c.created_at)
        .max()
        .unwrap_or(t_min);
    let span = (t_max - t_min) as f64;

    for cand in candidates.iter_mut() {
        let time_score = if t_max != t_min {
            ((cand.created_at - t_min) as f64 / span) as f32
        } else {
            0.0
        };
        cand.score = (1.0 - weight) * cand.score + weight * time_score;
    }

    candidates.sort_by(|a, b| by_score_desc(a.score, b.score));
    candidates.truncate(top_k);
    candidates
}
