use crate::fusion::reciprocal_rank_fusion;
use alayasiki_core::metrics::MetricsCollector;
use alayasiki_core::model::Chunk;
use async_trait::async_trait;
use std::sync::Arc;
use storage::repo::Repository;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("sparse search failed: {0}")]
    Sparse(String),
    #[error("rerank failed: {0}")]
    Rerank(String),
}

/// Tunables for candidate widening and MMR pooling (spec.md §4.3 step 1,
/// defaults from `RetrievalConfig`).
#[derive(Debug, Clone)]
pub struct RetrievalTuning {
    pub candidate_multiplier: usize,
    pub max_candidates: usize,
    pub mmr_fetch_multiplier: usize,
    pub mmr_lambda: f32,
}

impl Default for RetrievalTuning {
    fn default() -> Self {
        Self {
            candidate_multiplier: 5,
            max_candidates: 200,
            mmr_fetch_multiplier: 4,
            mmr_lambda: 0.5,
        }
    }
}

/// `top_k` widened to pull in enough candidates for a later rerank pass
/// (spec.md §4.3 step 1): `min(max(top_k, top_k * multiplier), max_candidates)`
/// when rerank is requested, else `top_k` unchanged.
pub fn candidate_top_k(top_k: usize, rerank_requested: bool, tuning: &RetrievalTuning) -> usize {
    if !rerank_requested {
        return top_k;
    }
    top_k
        .max(top_k.saturating_mul(tuning.candidate_multiplier))
        .min(tuning.max_candidates)
}

/// Sparse (full-text) search, split out as a trait so the "sparse search
/// fails" branch of spec.md §4.3 step 3 is exercisable in tests — the
/// concrete full-text scan in `storage::repo::Repository` has no failure
/// mode of its own.
#[async_trait]
pub trait SparseSearcher: Send + Sync {
    async fn search(
        &self,
        workspace_id: &str,
        query_text: &str,
        top_k: usize,
    ) -> Result<Vec<Chunk>, RetrievalError>;
}

pub struct RepositorySparseSearcher {
    repo: Arc<Repository>,
}

impl RepositorySparseSearcher {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl SparseSearcher for RepositorySparseSearcher {
    async fn search(
        &self,
        workspace_id: &str,
        query_text: &str,
        top_k: usize,
    ) -> Result<Vec<Chunk>, RetrievalError> {
        Ok(self
            .repo
            .find_chunks_full_text(workspace_id, query_text, top_k)
            .await
            .into_iter()
            .map(|(chunk, _score)| chunk)
            .collect())
    }
}

/// Post-retrieval reranker (spec.md §4.3 step 4). `top_k` is the already
/// clamped `top_k' = min(|candidates|, max_candidates)` the caller computed.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(
        &self,
        query_text: &str,
        candidates: Vec<Chunk>,
        top_k: usize,
    ) -> Result<Vec<Chunk>, RetrievalError>;
}

/// Dense + optional sparse/hybrid retrieval and fusion (spec.md §4.3 steps
/// 1-3). Returns candidates in final ranked order, not yet reranked or
/// truncated to the caller's `top_k`.
#[allow(clippy::too_many_arguments)]
pub async fn retrieve_candidates(
    repo: &Repository,
    sparse: Option<&dyn SparseSearcher>,
    metrics: Option<&MetricsCollector>,
    workspace_id: &str,
    query_text: &str,
    query_embedding: &[f32],
    top_k: usize,
    use_mmr: bool,
    hybrid_enabled: bool,
    rerank_requested: bool,
    tuning: &RetrievalTuning,
) -> Vec<Chunk> {
    let widened_top_k = candidate_top_k(top_k, rerank_requested, tuning);

    let dense: Vec<Chunk> = if use_mmr {
        repo.find_similar_chunks_mmr(
            workspace_id,
            query_embedding,
            widened_top_k,
            tuning.mmr_fetch_multiplier,
            tuning.mmr_lambda,
        )
        .await
        .into_iter()
        .map(|(chunk, _score)| chunk)
        .collect()
    } else {
        repo.find_similar_chunks(workspace_id, query_embedding, widened_top_k)
            .await
            .into_iter()
            .map(|(chunk, _score)| chunk)
            .collect()
    };

    if !hybrid_enabled {
        return dense;
    }

    let Some(sparse) = sparse else {
        return dense;
    };

    match sparse.search(workspace_id, query_text, widened_top_k).await {
        Ok(sparse_results) => reciprocal_rank_fusion(&[dense, sparse_results]),
        Err(_) => {
            if let Some(metrics) = metrics {
                metrics.record_retrieval_fallback("sparse");
            }
            dense
        }
    }
}

/// Optional rerank pass (spec.md §4.3 step 4). On error, keeps the
/// pre-rerank order and records `retrieval_fallback{kind=rerank}`.
pub async fn rerank_candidates(
    reranker: &dyn Reranker,
    metrics: Option<&MetricsCollector>,
    query_text: &str,
    candidates: Vec<Chunk>,
    max_candidates: usize,
) -> Vec<Chunk> {
    let top_k_prime = candidates.len().min(max_candidates);
    match reranker.rerank(query_text, candidates.clone(), top_k_prime).await {
        Ok(reranked) => reranked,
        Err(_) => {
            if let Some(metrics) = metrics {
                metrics.record_retrieval_fallback("rerank");
            }
            candidates
        }
    }
}

/// Stub reranker used in scenario S4: reverses candidate order, then
/// truncates to `top_k`. Exists for tests that need a deterministic,
/// visibly-different-from-input rerank outcome.
pub struct ReverseStubReranker;

#[async_trait]
impl Reranker for ReverseStubReranker {
    async fn rerank(
        &self,
        _query_text: &str,
        mut candidates: Vec<Chunk>,
        top_k: usize,
    ) -> Result<Vec<Chunk>, RetrievalError> {
        candidates.reverse();
        candidates.truncate(top_k);
        Ok(candidates)
    }
}

pub struct FailingReranker;

#[async_trait]
impl Reranker for FailingReranker {
    async fn rerank(
        &self,
        _query_text: &str,
        _candidates: Vec<Chunk>,
        _top_k: usize,
    ) -> Result<Vec<Chunk>, RetrievalError> {
        Err(RetrievalError::Rerank("reranker unavailable".to_string()))
    }
}

pub struct FailingSparseSearcher;

#[async_trait]
impl SparseSearcher for FailingSparseSearcher {
    async fn search(
        &self,
        _workspace_id: &str,
        _query_text: &str,
        _top_k: usize,
    ) -> Result<Vec<Chunk>, RetrievalError> {
        Err(RetrievalError::Sparse("sparse index unavailable".to_string()))
    }
}
