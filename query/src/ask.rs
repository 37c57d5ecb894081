use crate::context::build_context;
use crate::dsl::{sanitize_top_k, AskInput};
use crate::retrieval::{rerank_candidates, retrieve_candidates, Reranker, RetrievalTuning, SparseSearcher};
use crate::semantic_cache::{SemanticCache, SemanticCacheConfig, SemanticCacheKey};
use alayasiki_core::error::{AlayasikiError, ErrorCode};
use alayasiki_core::metrics::MetricsCollector;
use alayasiki_core::model::Chunk;
use alayasiki_core::policy::{resolve_access, AccessDecision, AccessMode, PolicyError};
use async_trait::async_trait;
use ingestion::injection::InjectionFilter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use storage::repo::Repository;
use thiserror::Error;
use tokio::sync::Mutex;

/// Returned whenever no grounded evidence could be produced (spec.md §4.8
/// step 9/10) — this is a 200 OK answer, never an error.
pub const NO_EVIDENCE_FALLBACK: &str =
    "No hay evidencia suficiente en las fuentes. ¿Podés precisar más (keywords/fecha/documento)?";

#[derive(Debug, Error)]
pub enum AskError {
    #[error("workspace_id must not be empty")]
    MissingWorkspaceId,
    #[error("query must not be blank")]
    BlankQuery,
    #[error("workspace not found")]
    NotFound,
    #[error("access to this workspace is forbidden")]
    Forbidden,
    #[error("embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),
    #[error("chunk store unavailable: {0}")]
    ChunkStoreUnavailable(String),
    #[error("llm service unavailable: {0}")]
    LlmUnavailable(String),
}

impl From<PolicyError> for AskError {
    fn from(_: PolicyError) -> Self {
        AskError::MissingWorkspaceId
    }
}

impl AlayasikiError for AskError {
    fn error_code(&self) -> ErrorCode {
        match self {
            AskError::MissingWorkspaceId | AskError::BlankQuery => ErrorCode::ValidationError,
            AskError::NotFound => ErrorCode::NotFound,
            AskError::Forbidden => ErrorCode::Forbidden,
            AskError::EmbeddingUnavailable(_) => ErrorCode::ServiceUnavailable("EmbeddingService".to_string()),
            AskError::ChunkStoreUnavailable(_) => ErrorCode::ServiceUnavailable("ChunkStore".to_string()),
            AskError::LlmUnavailable(_) => ErrorCode::ServiceUnavailable("LLMService".to_string()),
        }
    }
}

/// Query-time embedding port (spec.md §4.8 step 4). Distinct from
/// `ingestion::embedding::Embedder` because this one is fallible — a real
/// implementation is a network call that can time out or 5xx.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String>;
}

/// Query-time LLM port (spec.md §4.8 step 11).
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, query: &str, context: &str) -> Result<String, String>;
}

/// Deterministic stand-in activated by `FAKE_EMBEDDINGS=1` (SPEC_FULL.md §D).
pub struct DeterministicEmbeddingClient {
    model_id: String,
    dims: usize,
}

impl DeterministicEmbeddingClient {
    pub fn new(model_id: impl Into<String>, dims: usize) -> Self {
        Self { model_id: model_id.into(), dims: dims.max(1) }
    }
}

#[async_trait]
impl EmbeddingClient for DeterministicEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        Ok(alayasiki_core::embedding::deterministic_embedding(text, &self.model_id, self.dims))
    }
}

/// Deterministic stand-in activated by `FAKE_LLM=1` (SPEC_FULL.md §D).
/// Always grounds its answer in the supplied context so the
/// `answer_without_sources_total` counter only fires for genuinely
/// ungrounded real-LLM output, never for the fake.
pub struct DeterministicLlmClient;

#[async_trait]
impl LlmClient for DeterministicLlmClient {
    async fn complete(&self, query: &str, context: &str) -> Result<String, String> {
        Ok(format!("Respondiendo a \"{query}\" según las fuentes:\n{context}"))
    }
}

/// Builds `AskResult`s from retrieved, filtered, and grounded evidence
/// (spec.md §4.8, the C8 ask orchestrator).
pub struct AskOrchestrator {
    repo: Arc<Repository>,
    embedding_client: Arc<dyn EmbeddingClient>,
    llm_client: Arc<dyn LlmClient>,
    sparse_searcher: Option<Arc<dyn SparseSearcher>>,
    reranker: Option<Arc<dyn Reranker>>,
    injection_filter: InjectionFilter,
    metrics: Arc<MetricsCollector>,
    tuning: RetrievalTuning,
    context_budget_chars: usize,
    prompt_version: String,
    cache: Mutex<SemanticCache<AskResult>>,
}

#[derive(Debug, Clone)]
pub struct AskMetadata {
    pub top_k: usize,
    pub chunks_found: usize,
    pub chunks_used: usize,
    pub context_chars: usize,
    pub prompt_version: String,
    pub use_mmr: bool,
    pub rerank_applied: bool,
    pub candidates_count: usize,
    pub reranked_count: usize,
    pub selected_top_k: usize,
    pub hybrid_used: bool,
    pub embed_ms: u64,
    pub retrieve_ms: u64,
    pub llm_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone)]
pub struct AskResult {
    pub answer: String,
    pub chunks: Vec<Chunk>,
    pub metadata: AskMetadata,
}

fn fallback_result(top_k: usize, prompt_version: &str, timings: (u64, u64, u64, u64)) -> AskResult {
    let (embed_ms, retrieve_ms, llm_ms, total_ms) = timings;
    AskResult {
        answer: NO_EVIDENCE_FALLBACK.to_string(),
        chunks: Vec::new(),
        metadata: AskMetadata {
            top_k,
            chunks_found: 0,
            chunks_used: 0,
            context_chars: 0,
            prompt_version: prompt_version.to_string(),
            use_mmr: false,
            rerank_applied: false,
            candidates_count: 0,
            reranked_count: 0,
            selected_top_k: 0,
            hybrid_used: false,
            embed_ms,
            retrieve_ms,
            llm_ms,
            total_ms,
        },
    }
}

impl AskOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<Repository>,
        embedding_client: Arc<dyn EmbeddingClient>,
        llm_client: Arc<dyn LlmClient>,
        sparse_searcher: Option<Arc<dyn SparseSearcher>>,
        reranker: Option<Arc<dyn Reranker>>,
        injection_filter: InjectionFilter,
        metrics: Arc<MetricsCollector>,
        tuning: RetrievalTuning,
        context_budget_chars: usize,
        prompt_version: impl Into<String>,
        cache_config: SemanticCacheConfig,
    ) -> Self {
        Self {
            repo,
            embedding_client,
            llm_client,
            sparse_searcher,
            reranker,
            injection_filter,
            metrics,
            tuning,
            context_budget_chars,
            prompt_version: prompt_version.into(),
            cache: Mutex::new(SemanticCache::with_config(cache_config)),
        }
    }

    pub async fn ask(&self, input: AskInput) -> Result<AskResult, AskError> {
        let run_started = Instant::now();

        if input.workspace_id.trim().is_empty() {
            return Err(AskError::MissingWorkspaceId);
        }
        if input.query.trim().is_empty() {
            return Err(AskError::BlankQuery);
        }

        let workspace = self.repo.get_workspace(&input.workspace_id).await;
        let acl = self.repo.acl_for_workspace(&input.workspace_id).await;
        let decision = resolve_access(
            &input.workspace_id,
            workspace.as_ref(),
            &acl,
            input.actor.as_ref(),
            AccessMode::Read,
        )?;
        match decision {
            AccessDecision::Allow => {}
            AccessDecision::NotFound => return Err(AskError::NotFound),
            AccessDecision::Forbidden => return Err(AskError::Forbidden),
        }

        let Some(top_k) = sanitize_top_k(input.top_k) else {
            let total_ms = run_started.elapsed().as_millis() as u64;
            self.metrics.record_policy_refusal("insufficient_evidence");
            return Ok(fallback_result(0, &self.prompt_version, (0, 0, 0, total_ms)));
        };

        let cache_key = SemanticCacheKey::from_ask_input(&input, top_k, &self.prompt_version);
        if let Some(cached) = self.cache.lock().await.lookup(&cache_key, &input.query) {
            let latency_us = run_started.elapsed().as_micros() as u64;
            self.metrics.record_query(latency_us, true);
            return Ok(cached);
        }

        let embed_started = Instant::now();
        let query_embedding = self
            .embedding_client
            .embed(&input.query)
            .await
            .map_err(AskError::EmbeddingUnavailable)?;
        let embed_ms = embed_started.elapsed().as_millis() as u64;

        let retrieve_started = Instant::now();
        let mut candidates = retrieve_candidates(
            &self.repo,
            self.sparse_searcher.as_deref(),
            Some(&self.metrics),
            &input.workspace_id,
            &input.query,
            &query_embedding,
            top_k,
            input.use_mmr,
            input.hybrid_enabled,
            input.rerank_enabled,
            &self.tuning,
        )
        .await;
        let candidates_count = candidates.len();

        let mut reranked_count = 0;
        let mut rerank_applied = false;
        if input.rerank_enabled {
            if let Some(reranker) = &self.reranker {
                candidates = rerank_candidates(
                    reranker.as_ref(),
                    Some(&self.metrics),
                    &input.query,
                    candidates,
                    self.tuning.max_candidates,
                )
                .await;
                reranked_count = candidates.len();
                rerank_applied = true;
            }
        }
        let retrieve_ms = retrieve_started.elapsed().as_millis() as u64;

        let filtered = self.injection_filter.apply(candidates);
        for slug in &filtered.detected_pattern_slugs {
            self.metrics.record_prompt_injection_detected(slug);
        }
        let chunks_found = filtered.chunks.len();

        let selected: Vec<Chunk> = filtered.chunks.into_iter().take(top_k).collect();
        let selected_top_k = selected.len();

        if selected.is_empty() {
            self.metrics.record_policy_refusal("insufficient_evidence");
            let total_ms = run_started.elapsed().as_millis() as u64;
            self.metrics
                .record_ask_stages(embed_ms, retrieve_ms, 0, 0, 0, 0, 0, total_ms);
            return Ok(fallback_result(top_k, &self.prompt_version, (embed_ms, retrieve_ms, 0, total_ms)));
        }

        let documents_by_id = self.documents_for(&selected).await;
        let (context, chunks_used) = build_context(&selected, &documents_by_id, self.context_budget_chars);

        if chunks_used == 0 || context.is_empty() {
            self.metrics.record_policy_refusal("insufficient_evidence");
            let total_ms = run_started.elapsed().as_millis() as u64;
            return Ok(fallback_result(top_k, &self.prompt_version, (embed_ms, retrieve_ms, 0, total_ms)));
        }

        let llm_query = input.llm_query.as_deref().unwrap_or(&input.query);
        let llm_started = Instant::now();
        let answer = self
            .llm_client
            .complete(llm_query, &context)
            .await
            .map_err(AskError::LlmUnavailable)?;
        let llm_ms = llm_started.elapsed().as_millis() as u64;

        let lowered = answer.to_lowercase();
        if chunks_used > 0 && !lowered.contains("fuentes") && !answer.contains("[S") {
            self.metrics.record_answer_without_sources();
        }

        let total_ms = run_started.elapsed().as_millis() as u64;
        self.metrics
            .record_ask_stages(embed_ms, retrieve_ms, 0, 0, 0, 0, llm_ms, total_ms);

        let chunks: Vec<Chunk> = selected.into_iter().take(chunks_used).collect();

        let result = AskResult {
            answer,
            chunks,
            metadata: AskMetadata {
                top_k,
                chunks_found,
                chunks_used,
                context_chars: context.len(),
                prompt_version: self.prompt_version.clone(),
                use_mmr: input.use_mmr,
                rerank_applied,
                candidates_count,
                reranked_count,
                selected_top_k,
                hybrid_used: input.hybrid_enabled,
                embed_ms,
                retrieve_ms,
                llm_ms,
                total_ms,
            },
        };

        self.cache
            .lock()
            .await
            .insert(cache_key, &input.query, result.clone());
        let latency_us = run_started.elapsed().as_micros() as u64;
        self.metrics.record_query(latency_us, false);

        Ok(result)
    }

    async fn documents_for(&self, chunks: &[Chunk]) -> HashMap<String, alayasiki_core::model::Document> {
        let mut documents = HashMap::new();
        for chunk in chunks {
            if documents.contains_key(&chunk.document_id) {
                continue;
            }
            if let Some(document) = self.repo.get_document(&chunk.document_id).await {
                documents.insert(chunk.document_id.clone(), document);
            }
        }
        documents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alayasiki_core::config::InjectionFilterMode;
    use alayasiki_core::model::{AclRole, Actor, ActorRole, Document, Visibility, Workspace, WorkspaceAclEntry};
    use tempfile::tempdir;

    struct FailingEmbeddingClient;

    #[async_trait]
    impl EmbeddingClient for FailingEmbeddingClient {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, String> {
            Err("embedding backend down".to_string())
        }
    }

    struct CountingEmbeddingClient {
        calls: std::sync::atomic::AtomicUsize,
        inner: DeterministicEmbeddingClient,
    }

    #[async_trait]
    impl EmbeddingClient for CountingEmbeddingClient {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.embed(text).await
        }
    }

    struct FailingLlmClient;

    #[async_trait]
    impl LlmClient for FailingLlmClient {
        async fn complete(&self, _query: &str, _context: &str) -> Result<String, String> {
            Err("llm backend down".to_string())
        }
    }

    async fn seeded_repo_with_workspace(owner: &str) -> Arc<Repository> {
        let dir = tempdir().unwrap();
        let repo = Arc::new(Repository::open(dir.path().join("wal.log")).await.unwrap());
        repo.put_workspace(Workspace {
            id: "ws-1".into(),
            name: "Workspace".into(),
            owner_user_id: Some(owner.to_string()),
            visibility: Visibility::Private,
            archived_at: None,
            created_at: 0,
            updated_at: 0,
        })
        .await
        .unwrap();
        let document = Document::new("doc-1", "ws-1", "Refund Policy");
        repo.save_document(document.clone()).await.unwrap();
        let chunks = vec![Chunk::new(
            "c1",
            "doc-1",
            "ws-1",
            0,
            "Refunds are processed within thirty days of purchase.",
            vec![1.0, 0.0],
        )];
        repo.save_document_with_chunks(document, chunks).await.unwrap();
        repo
    }

    fn orchestrator(repo: Arc<Repository>) -> AskOrchestrator {
        AskOrchestrator::new(
            repo,
            Arc::new(DeterministicEmbeddingClient::new("embedding-default-v1", 2)),
            Arc::new(DeterministicLlmClient),
            None,
            None,
            InjectionFilter::new(InjectionFilterMode::Downrank, 0.6),
            Arc::new(MetricsCollector::new(100)),
            RetrievalTuning::default(),
            12_000,
            "v1",
            SemanticCacheConfig::default(),
        )
    }

    #[tokio::test]
    async fn returns_not_found_for_missing_workspace() {
        let dir = tempdir().unwrap();
        let repo = Arc::new(Repository::open(dir.path().join("wal.log")).await.unwrap());
        let orchestrator = orchestrator(repo);
        let input = AskInput::new("refund policy", "ws-missing")
            .with_actor(Actor { user_id: "u1".into(), role: ActorRole::Employee });
        let err = orchestrator.ask(input).await.unwrap_err();
        assert!(matches!(err, AskError::NotFound));
    }

    #[tokio::test]
    async fn returns_forbidden_for_non_owner_on_private_workspace() {
        let repo = seeded_repo_with_workspace("owner").await;
        let orchestrator = orchestrator(repo);
        let input = AskInput::new("refund policy", "ws-1")
            .with_actor(Actor { user_id: "stranger".into(), role: ActorRole::Employee });
        let err = orchestrator.ask(input).await.unwrap_err();
        assert!(matches!(err, AskError::Forbidden));
    }

    #[tokio::test]
    async fn non_positive_top_k_returns_zero_evidence_fallback() {
        let repo = seeded_repo_with_workspace("owner").await;
        let orchestrator = orchestrator(repo);
        let input = AskInput::new("refund policy", "ws-1")
            .with_actor(Actor { user_id: "owner".into(), role: ActorRole::Employee })
            .with_top_k(0);
        let result = orchestrator.ask(input).await.unwrap();
        assert_eq!(result.answer, NO_EVIDENCE_FALLBACK);
        assert_eq!(result.metadata.chunks_used, 0);
    }

    #[tokio::test]
    async fn grounded_answer_includes_chunks_and_context() {
        let repo = seeded_repo_with_workspace("owner").await;
        let orchestrator = orchestrator(repo);
        let input = AskInput::new("refund policy", "ws-1")
            .with_actor(Actor { user_id: "owner".into(), role: ActorRole::Employee });
        let result = orchestrator.ask(input).await.unwrap();
        assert!(!result.chunks.is_empty());
        assert!(result.metadata.context_chars > 0);
        assert!(result.answer.to_lowercase().contains("fuentes"));
    }

    #[tokio::test]
    async fn repeated_identical_query_hits_semantic_cache() {
        let repo = seeded_repo_with_workspace("owner").await;
        let metrics = Arc::new(MetricsCollector::new(100));
        let embedding_client = Arc::new(CountingEmbeddingClient {
            calls: std::sync::atomic::AtomicUsize::new(0),
            inner: DeterministicEmbeddingClient::new("embedding-default-v1", 2),
        });
        let orchestrator = AskOrchestrator::new(
            repo,
            embedding_client.clone(),
            Arc::new(DeterministicLlmClient),
            None,
            None,
            InjectionFilter::new(InjectionFilterMode::Downrank, 0.6),
            metrics.clone(),
            RetrievalTuning::default(),
            12_000,
            "v1",
            SemanticCacheConfig::default(),
        );
        let make_input = || {
            AskInput::new("refund policy", "ws-1")
                .with_actor(Actor { user_id: "owner".into(), role: ActorRole::Employee })
        };

        let first = orchestrator.ask(make_input()).await.unwrap();
        let second = orchestrator.ask(make_input()).await.unwrap();

        assert_eq!(first.answer, second.answer);
        assert_eq!(
            embedding_client.calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        let snapshot = metrics.query_snapshot();
        assert_eq!(snapshot.total_queries, 2);
        assert_eq!(snapshot.cache_hits, 1);
    }

    #[tokio::test]
    async fn embedding_failure_maps_to_service_unavailable() {
        let repo = seeded_repo_with_workspace("owner").await;
        let orchestrator = AskOrchestrator::new(
            repo,
            Arc::new(FailingEmbeddingClient),
            Arc::new(DeterministicLlmClient),
            None,
            None,
            InjectionFilter::new(InjectionFilterMode::Downrank, 0.6),
            Arc::new(MetricsCollector::new(100)),
            RetrievalTuning::default(),
            12_000,
            "v1",
            SemanticCacheConfig::default(),
        );
        let input = AskInput::new("refund policy", "ws-1")
            .with_actor(Actor { user_id: "owner".into(), role: ActorRole::Employee });
        let err = orchestrator.ask(input).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ServiceUnavailable("EmbeddingService".to_string()));
    }

    #[tokio::test]
    async fn llm_failure_maps_to_service_unavailable() {
        let repo = seeded_repo_with_workspace("owner").await;
        let orchestrator = AskOrchestrator::new(
            repo,
            Arc::new(DeterministicEmbeddingClient::new("embedding-default-v1", 2)),
            Arc::new(FailingLlmClient),
            None,
            None,
            InjectionFilter::new(InjectionFilterMode::Downrank, 0.6),
            Arc::new(MetricsCollector::new(100)),
            RetrievalTuning::default(),
            12_000,
            "v1",
            SemanticCacheConfig::default(),
        );
        let input = AskInput::new("refund policy", "ws-1")
            .with_actor(Actor { user_id: "owner".into(), role: ActorRole::Employee });
        let err = orchestrator.ask(input).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ServiceUnavailable("LLMService".to_string()));
    }

    #[tokio::test]
    async fn shared_workspace_acl_member_can_ask() {
        let dir = tempdir().unwrap();
        let repo = Arc::new(Repository::open(dir.path().join("wal.log")).await.unwrap());
        repo.put_workspace(Workspace {
            id: "ws-1".into(),
            name: "Workspace".into(),
            owner_user_id: Some("owner".into()),
            visibility: Visibility::Shared,
            archived_at: None,
            created_at: 0,
            updated_at: 0,
        })
        .await
        .unwrap();
        repo.put_acl_entry(WorkspaceAclEntry {
            workspace_id: "ws-1".into(),
            user_id: "member".into(),
            role: AclRole::Viewer,
        })
        .await
        .unwrap();
        let document = Document::new("doc-1", "ws-1", "Doc");
        repo.save_document(document.clone()).await.unwrap();
        repo.save_document_with_chunks(
            document,
            vec![Chunk::new("c1", "doc-1", "ws-1", 0, "some grounded content here", vec![1.0])],
        )
        .await
        .unwrap();

        let orchestrator = orchestrator(repo);
        let input = AskInput::new("grounded content", "ws-1")
            .with_actor(Actor { user_id: "member".into(), role: ActorRole::Employee });
        let result = orchestrator.ask(input).await.unwrap();
        assert!(!result.chunks.is_empty());
    }
}
