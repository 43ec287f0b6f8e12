//! Per-request vector index with maximal-marginal-relevance retrieval.
//!
//! The index is built from embedded chunks, queried once, and dropped with
//! the request. Retrieval ranks every chunk by cosine similarity to the query,
//! keeps the top `fetch_k` candidates, then greedily picks `k` of them by
//!
//! ```text
//! mmr(c) = λ · sim(q, c) − (1 − λ) · max_{s ∈ selected} sim(c, s)
//! ```
//!
//! so near-duplicate rows do not crowd out the rest of the evidence. Ties are
//! broken by document order. Results come back in selection order.

use tracing::debug;

use crate::embedding::cosine_similarity;
use crate::error::{PipelineError, Result};
use crate::models::Chunk;

/// A searchable set of embedded chunks.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    chunks: Vec<Chunk>,
    dims: usize,
}

impl VectorIndex {
    /// Build an index from chunks carrying embeddings.
    ///
    /// Chunks without an embedding are skipped. Fails with
    /// [`PipelineError::EmptyIndex`] when nothing is left, and with
    /// [`PipelineError::Embedding`] when vector sizes disagree.
    pub fn build(chunks: Vec<Chunk>) -> Result<Self> {
        let total = chunks.len();
        let chunks: Vec<Chunk> = chunks
            .into_iter()
            .filter(|c| c.embedding.as_ref().is_some_and(|e| !e.is_empty()))
            .collect();

        let dims = match chunks.first().and_then(|c| c.embedding.as_ref()) {
            Some(e) => e.len(),
            None => return Err(PipelineError::EmptyIndex),
        };

        if let Some(bad) = chunks
            .iter()
            .filter_map(|c| c.embedding.as_ref())
            .find(|e| e.len() != dims)
        {
            return Err(PipelineError::Embedding(format!(
                "vector size mismatch in index: got {}, want {}",
                bad.len(),
                dims
            )));
        }

        if chunks.len() < total {
            debug!(skipped = total - chunks.len(), "chunks without embeddings left out of index");
        }

        Ok(Self { chunks, dims })
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Return up to `k` chunks for `query`, re-ranked with MMR.
    ///
    /// `fetch_k` bounds the candidate pool (raised to `k` when smaller);
    /// `lambda` is clamped to `[0, 1]`. Returns at most `min(k, len)` chunks.
    pub fn query(&self, query: &[f32], k: usize, fetch_k: usize, lambda: f32) -> Result<Vec<Chunk>> {
        if query.len() != self.dims {
            return Err(PipelineError::Embedding(format!(
                "query vector size {} does not match index size {}",
                query.len(),
                self.dims
            )));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let lambda = lambda.clamp(0.0, 1.0);
        let pool = fetch_k.max(k).min(self.chunks.len());

        // (document position, relevance), most relevant first, document order on ties.
        let mut ranked: Vec<(usize, f32)> = self
            .chunks
            .iter()
            .enumerate()
            .map(|(i, c)| (i, cosine_similarity(query, self.vector(c))))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(pool);

        let picked = mmr_select(&ranked, k, lambda, |a, b| {
            cosine_similarity(self.vector(&self.chunks[a]), self.vector(&self.chunks[b]))
        });

        debug!(candidates = pool, selected = picked.len(), "mmr retrieval");
        Ok(picked.into_iter().map(|i| self.chunks[i].clone()).collect())
    }

    fn vector<'a>(&self, chunk: &'a Chunk) -> &'a [f32] {
        chunk.embedding.as_deref().unwrap_or(&[])
    }
}

/// Greedy MMR over `candidates` (document position, relevance).
///
/// Returns document positions in selection order.
fn mmr_select(
    candidates: &[(usize, f32)],
    k: usize,
    lambda: f32,
    similarity: impl Fn(usize, usize) -> f32,
) -> Vec<usize> {
    let mut selected: Vec<usize> = Vec::with_capacity(k.min(candidates.len()));
    let mut remaining: Vec<(usize, f32)> = candidates.to_vec();

    while selected.len() < k && !remaining.is_empty() {
        let mut best: Option<(usize, usize, f32)> = None; // (slot, doc position, score)

        for (slot, &(doc, relevance)) in remaining.iter().enumerate() {
            let redundancy = selected
                .iter()
                .map(|&s| similarity(doc, s))
                .fold(f32::NEG_INFINITY, f32::max);
            let redundancy = if selected.is_empty() { 0.0 } else { redundancy };
            let score = lambda * relevance - (1.0 - lambda) * redundancy;

            let better = match best {
                None => true,
                Some((_, best_doc, best_score)) => {
                    score > best_score || (score == best_score && doc < best_doc)
                }
            };
            if better {
                best = Some((slot, doc, score));
            }
        }

        match best {
            Some((slot, doc, _)) => {
                selected.push(doc);
                remaining.swap_remove(slot);
            }
            None => break,
        }
    }

    selected
}
