use crate::chunker::{Chunker, ChunkingConfig, SemanticChunker};
use crate::embedding::{DeterministicEmbedder, Embedder};
use crate::extract::{detect_content_kind, ContentKind, ExtractError, ParserRegistry};
use crate::injection::InjectionFilter;
use alayasiki_core::model::{truncate_error_message, Chunk, Document, DocumentStatus};
use async_trait::async_trait;
use std::sync::Arc;
use storage::repo::{RepoError, Repository};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlobStoreError {
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("blob download failed: {0}")]
    Failed(String),
}

/// File-storage port a document's `storage_key` is resolved against
/// (spec.md §4.6 step 4b). Kept separate from `Repository` because the
/// blob store is typically an object store (S3/GCS), not the WAL-backed
/// metadata store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn download(&self, storage_key: &str) -> Result<Vec<u8>, BlobStoreError>;
}

/// In-memory blob store for tests and for local/dev `fake_llm` runs.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: dashmap::DashMap<String, Vec<u8>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, storage_key: impl Into<String>, bytes: Vec<u8>) {
        self.blobs.insert(storage_key.into(), bytes);
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn download(&self, storage_key: &str) -> Result<Vec<u8>, BlobStoreError> {
        self.blobs
            .get(storage_key)
            .map(|entry| entry.clone())
            .ok_or_else(|| BlobStoreError::NotFound(storage_key.to_string()))
    }
}

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("storage error: {0}")]
    Storage(#[from] RepoError),
    #[error("blob store error: {0}")]
    BlobStore(#[from] BlobStoreError),
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractError),
    #[error("missing file metadata")]
    MissingFileMetadata,
    #[error("embedding count {actual} does not match chunk count {expected}")]
    EmbeddingCountMismatch { expected: usize, actual: usize },
}

/// Outcome of `process` (spec.md §4.6 entry point). `Missing`/`AlreadyReady`/
/// `AlreadyProcessing` are all non-error short-circuits; only a failure
/// under the lock maps to `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Missing,
    AlreadyReady,
    AlreadyProcessing,
    LockNotAcquired(DocumentStatus),
    Processed,
}

pub struct IngestionPipeline {
    repo: Arc<Repository>,
    blob_store: Arc<dyn BlobStore>,
    chunker: Box<dyn Chunker>,
    chunking_config: ChunkingConfig,
    embedder: Box<dyn Embedder>,
    injection_filter: InjectionFilter,
    default_model_id: String,
    parser_registry: ParserRegistry,
}

impl IngestionPipeline {
    pub fn new(repo: Arc<Repository>, blob_store: Arc<dyn BlobStore>) -> Self {
        Self {
            repo,
            blob_store,
            chunker: Box::new(SemanticChunker::default()),
            chunking_config: ChunkingConfig::default(),
            embedder: Box::new(DeterministicEmbedder::default()),
            injection_filter: InjectionFilter::default(),
            default_model_id: "embedding-default-v1".to_string(),
            parser_registry: ParserRegistry,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_components(
        repo: Arc<Repository>,
        blob_store: Arc<dyn BlobStore>,
        chunker: Box<dyn Chunker>,
        chunking_config: ChunkingConfig,
        embedder: Box<dyn Embedder>,
        injection_filter: InjectionFilter,
        default_model_id: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            blob_store,
            chunker,
            chunking_config,
            embedder,
            injection_filter,
            default_model_id: default_model_id.into(),
            parser_registry: ParserRegistry,
        }
    }

    /// Entry point for the async document worker (spec.md §4.6). Idempotent:
    /// safe to re-enqueue for the same `document_id` any number of times.
    pub async fn process(
        &self,
        document_id: &str,
        workspace_id: &str,
    ) -> Result<ProcessOutcome, IngestionError> {
        let document = match self.repo.get_document(document_id).await {
            Some(document) if document.workspace_id == workspace_id => document,
            _ => return Ok(ProcessOutcome::Missing),
        };

        match document.status {
            DocumentStatus::Ready => return Ok(ProcessOutcome::AlreadyReady),
            DocumentStatus::Processing => return Ok(ProcessOutcome::AlreadyProcessing),
            DocumentStatus::Pending | DocumentStatus::Failed => {}
        }

        let acquired = self
            .repo
            .transition_document_status(
                document_id,
                &[DocumentStatus::Pending, DocumentStatus::Failed],
                DocumentStatus::Processing,
                None,
            )
            .await?;
        if !acquired {
            let current = self
                .repo
                .get_document(document_id)
                .await
                .map(|d| d.status)
                .unwrap_or(DocumentStatus::Pending);
            return Ok(ProcessOutcome::LockNotAcquired(current));
        }

        match self.run_under_lock(&document).await {
            Ok(()) => {
                self.repo
                    .transition_document_status(
                        document_id,
                        &[DocumentStatus::Processing],
                        DocumentStatus::Ready,
                        None,
                    )
                    .await?;
                Ok(ProcessOutcome::Processed)
            }
            Err(err) => {
                let message = truncate_error_message(&err.to_string());
                self.repo
                    .transition_document_status(
                        document_id,
                        &[DocumentStatus::Processing],
                        DocumentStatus::Failed,
                        Some(message),
                    )
                    .await?;
                Err(err)
            }
        }
    }

    async fn run_under_lock(&self, document: &Document) -> Result<(), IngestionError> {
        let storage_key = document
            .storage_key
            .as_deref()
            .ok_or(IngestionError::MissingFileMetadata)?;
        let mime_type = document
            .mime_type
            .as_deref()
            .ok_or(IngestionError::MissingFileMetadata)?;

        let bytes = self.blob_store.download(storage_key).await?;

        let kind = detect_content_kind(mime_type, document.source.as_deref());
        if kind == ContentKind::Unsupported {
            return Err(IngestionError::Extraction(ExtractError::Unsupported(
                mime_type.to_string(),
            )));
        }
        let extracted = self.parser_registry.extract(kind, &bytes, false)?;

        let pieces = self.chunker.chunk(&extracted.text, &self.chunking_config).await;

        self.repo.delete_chunks_for_document(&document.id).await?;

        if pieces.is_empty() {
            return Ok(());
        }

        let embeddings = self.embedder.embed_batch(&pieces, &self.default_model_id).await;
        if embeddings.len() != pieces.len() {
            return Err(IngestionError::EmbeddingCountMismatch {
                expected: pieces.len(),
                actual: embeddings.len(),
            });
        }

        let raw_chunks: Vec<Chunk> = pieces
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(index, (content, embedding))| {
                Chunk::new(
                    alayasiki_core::model::new_id(),
                    &document.id,
                    &document.workspace_id,
                    index as u32,
                    content,
                    embedding,
                )
            })
            .collect();

        let outcome = self.injection_filter.apply(raw_chunks);

        self.repo
            .save_chunks(&document.id, outcome.chunks, &document.workspace_id)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn pipeline_with_document(
        content: &str,
        mime_type: &str,
    ) -> (IngestionPipeline, Arc<Repository>, String, String) {
        let dir = tempdir().unwrap();
        let repo = Arc::new(
            Repository::open(dir.path().join("wal.log")).await.unwrap(),
        );
        let blob_store = Arc::new(InMemoryBlobStore::new());
        blob_store.put("blob-1", content.as_bytes().to_vec());

        let workspace_id = "ws-1".to_string();
        let document_id = "doc-1".to_string();
        let mut document = Document::new(&document_id, &workspace_id, "report.txt");
        document.storage_key = Some("blob-1".to_string());
        document.mime_type = Some(mime_type.to_string());
        repo.save_document(document).await.unwrap();

        let pipeline = IngestionPipeline::new(repo.clone(), blob_store);
        (pipeline, repo, document_id, workspace_id)
    }

    #[tokio::test]
    async fn processes_pending_document_to_ready_with_chunks() {
        let (pipeline, repo, document_id, workspace_id) =
            pipeline_with_document("hello world, this is a test document.", "text/plain").await;

        let outcome = pipeline.process(&document_id, &workspace_id).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Processed);

        let document = repo.get_document(&document_id).await.unwrap();
        assert_eq!(document.status, DocumentStatus::Ready);
        let chunks = repo.chunks_for_document(&document_id).await;
        assert!(!chunks.is_empty());
    }

    #[tokio::test]
    async fn returns_missing_for_unknown_document() {
        let dir = tempdir().unwrap();
        let repo = Arc::new(Repository::open(dir.path().join("wal.log")).await.unwrap());
        let pipeline = IngestionPipeline::new(repo, Arc::new(InMemoryBlobStore::new()));
        let outcome = pipeline.process("missing-doc", "ws-1").await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Missing);
    }

    #[tokio::test]
    async fn already_ready_document_short_circuits() {
        let (pipeline, repo, document_id, workspace_id) =
            pipeline_with_document("some content here", "text/plain").await;
        pipeline.process(&document_id, &workspace_id).await.unwrap();

        let outcome = pipeline.process(&document_id, &workspace_id).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::AlreadyReady);
        assert_eq!(repo.get_document(&document_id).await.unwrap().status, DocumentStatus::Ready);
    }

    #[tokio::test]
    async fn missing_storage_key_fails_and_transitions_to_failed() {
        let dir = tempdir().unwrap();
        let repo = Arc::new(Repository::open(dir.path().join("wal.log")).await.unwrap());
        let document_id = "doc-2".to_string();
        let mut document = Document::new(&document_id, "ws-1", "no-key.txt");
        document.mime_type = Some("text/plain".to_string());
        repo.save_document(document).await.unwrap();

        let pipeline = IngestionPipeline::new(repo.clone(), Arc::new(InMemoryBlobStore::new()));
        let result = pipeline.process(&document_id, "ws-1").await;
        assert!(matches!(result, Err(IngestionError::MissingFileMetadata)));

        let document = repo.get_document(&document_id).await.unwrap();
        assert_eq!(document.status, DocumentStatus::Failed);
        assert!(document.error_message.is_some());
    }
}
