use alayasiki_core::audit::{AuditEvent, AuditOperation, AuditOutcome, AuditSink};
use alayasiki_core::ingest::{ContentHash, UploadRequest};
use alayasiki_core::model::{Document, DocumentStatus};
use alayasiki_core::resilience::{resolve_request_id, TokenBucketLimiter};
use ingestion::processor::{IngestionError, IngestionPipeline, ProcessOutcome};
use query::ask::{AskError, AskOrchestrator, AskResult};
use query::dsl::AskInput;
use std::sync::Arc;
use storage::repo::{RepoError, Repository};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("rate limited, retry after {retry_after_seconds:.3}s")]
    RateLimited { retry_after_seconds: f64 },
    #[error("storage error: {0}")]
    Storage(#[from] RepoError),
    #[error("ingestion error: {0}")]
    Ingestion(#[from] IngestionError),
    #[error("ask error: {0}")]
    Ask(#[from] AskError),
}

/// Single entry point bundling upload, processing, and ask (spec.md §6):
/// everything a caller needs to go from raw bytes to a grounded answer
/// without reaching into the individual crates directly. Every request
/// passes through the rate limiter before doing any work, and every Ask
/// is recorded to the audit sink regardless of outcome.
pub struct AlayasikiClient {
    repo: Arc<Repository>,
    pipeline: Arc<IngestionPipeline>,
    orchestrator: Arc<AskOrchestrator>,
    rate_limiter: Arc<TokenBucketLimiter>,
    audit_sink: Arc<dyn AuditSink>,
}

impl AlayasikiClient {
    pub fn new(
        repo: Arc<Repository>,
        pipeline: Arc<IngestionPipeline>,
        orchestrator: Arc<AskOrchestrator>,
        rate_limiter: Arc<TokenBucketLimiter>,
        audit_sink: Arc<dyn AuditSink>,
    ) -> Self {
        Self { repo, pipeline, orchestrator, rate_limiter, audit_sink }
    }

    /// Creates the `PENDING` document row for an upload (spec.md §4.6 steps
    /// 1-2). The caller is responsible for writing `request.content` to
    /// whichever blob store backs `document.storage_key` before
    /// `process_document` runs. Processing itself is driven separately, by
    /// `process_document` or a queued worker job, so callers can return to
    /// an HTTP client immediately after upload.
    pub async fn upload(
        &self,
        workspace_id: &str,
        request: UploadRequest,
    ) -> Result<Document, ClientError> {
        let rate_key = format!("upload:{workspace_id}");
        self.check_rate_limit(&rate_key)?;

        let storage_key = format!("upload-{}", request.content_hash());
        let mut document = Document::new(alayasiki_core::model::new_id(), workspace_id, &request.filename);
        document.mime_type = Some(request.mime_type.clone());
        document.storage_key = Some(storage_key);
        document.content_hash = Some(request.content_hash());
        self.repo.save_document(document.clone()).await?;
        Ok(document)
    }

    /// Runs the ingestion pipeline for a previously-uploaded document
    /// (spec.md §4.6). Idempotent — safe to call more than once for the
    /// same `document_id`.
    pub async fn process_document(
        &self,
        document_id: &str,
        workspace_id: &str,
    ) -> Result<ProcessOutcome, ClientError> {
        Ok(self.pipeline.process(document_id, workspace_id).await?)
    }

    /// Runs the full ask orchestrator (spec.md §4.8), rate-limited per
    /// workspace and unconditionally audited.
    pub async fn ask(&self, input: AskInput, request_id: Option<&str>) -> Result<AskResult, ClientError> {
        let request_id = resolve_request_id(request_id);
        let rate_key = format!("ask:{}", input.workspace_id);
        self.check_rate_limit(&rate_key)?;

        let workspace_id = input.workspace_id.clone();
        let actor = input.actor.as_ref().map(|actor| actor.user_id.clone());

        let outcome = self.orchestrator.ask(input).await;

        let audit_outcome = match &outcome {
            Ok(_) => AuditOutcome::Succeeded,
            Err(AskError::Forbidden) => AuditOutcome::Denied,
            Err(_) => AuditOutcome::Failed,
        };
        let mut event = AuditEvent::new(AuditOperation::Ask, audit_outcome);
        event.actor = actor;
        event.workspace_id = Some(workspace_id);
        event.request_id = Some(request_id);
        let _ = self.audit_sink.record(event);

        Ok(outcome?)
    }

    fn check_rate_limit(&self, key: &str) -> Result<(), ClientError> {
        let (allowed, retry_after_seconds) = self.rate_limiter.consume(key);
        if allowed {
            Ok(())
        } else {
            Err(ClientError::RateLimited { retry_after_seconds })
        }
    }
}

/// Returns `true` once a just-uploaded document has left the
/// `PENDING`/`PROCESSING` transient states, for callers polling after
/// `upload` + `process_document`.
pub fn is_terminal_status(status: DocumentStatus) -> bool {
    matches!(status, DocumentStatus::Ready | DocumentStatus::Failed)
}
