use crate::extract::{detect_content_kind, ContentKind, ParserRegistry};
use alayasiki_core::model::{
    new_id, Chunk, ConnectorProvider, ConnectorSource, ConnectorSourceStatus, Document,
    DocumentStatus, ExternalSourceInfo,
};
use alayasiki_core::resilience::{retry_with_backoff, RetryError, RetryPolicy};
use async_trait::async_trait;
use storage::crypto::AtRestCipher;
use storage::repo::{RepoError, Repository};
use thiserror::Error;

use crate::chunker::{Chunker, ChunkingConfig};
use crate::embedding::Embedder;
use crate::injection::InjectionFilter;

/// Caps how many files a single `sync` invocation will process (spec.md
/// §4.7 step 5).
pub const MAX_FILES_PER_SYNC: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorFile {
    pub file_id: String,
    pub name: String,
    pub mime_type: String,
    pub modified_time: Option<i64>,
    pub etag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorDelta {
    pub files: Vec<ConnectorFile>,
    pub new_cursor: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectorClientError {
    #[error("permanent error {status}: {message}")]
    Permanent { status: u16, message: String },
    #[error("transient error {status}: {message}")]
    Transient {
        status: u16,
        retry_after: Option<f64>,
        message: String,
    },
    #[error("file too large: exceeded {max_bytes} bytes")]
    FileTooLarge { max_bytes: u64 },
}

impl ConnectorClientError {
    fn status(&self) -> u16 {
        match self {
            ConnectorClientError::Permanent { status, .. } => *status,
            ConnectorClientError::Transient { status, .. } => *status,
            ConnectorClientError::FileTooLarge { .. } => 0,
        }
    }

    fn retry_after(&self) -> Option<f64> {
        match self {
            ConnectorClientError::Transient { retry_after, .. } => *retry_after,
            ConnectorClientError::Permanent { .. } | ConnectorClientError::FileTooLarge { .. } => None,
        }
    }
}

#[async_trait]
pub trait ConnectorClient: Send + Sync {
    async fn get_delta(
        &self,
        folder_id: &str,
        cursor: Option<&str>,
    ) -> Result<ConnectorDelta, ConnectorClientError>;

    async fn fetch_file_content(
        &self,
        file_id: &str,
        mime_type: &str,
        max_bytes: u64,
    ) -> Result<Vec<u8>, ConnectorClientError>;

    fn is_supported_mime(&self, mime_type: &str) -> bool {
        detect_content_kind(mime_type, None) != ContentKind::Unsupported
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OAuthError {
    #[error("oauth refresh failed: {0}")]
    RefreshFailed(String),
}

#[async_trait]
pub trait OAuthPort: Send + Sync {
    async fn refresh_access_token(&self, refresh_token: &str) -> Result<String, OAuthError>;
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] RepoError),
    #[error("source not found")]
    SourceNotFound,
    #[error("connector account not found")]
    AccountNotFound,
    #[error("token decryption failed")]
    TokenDecryptFailed,
    #[error("oauth error: {0}")]
    OAuth(#[from] OAuthError),
}

/// Observable outcome of a single `sync` invocation (spec.md §4.7's
/// "Observable outcome" paragraph).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub found: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errored: usize,
}

fn provider_slug(provider: ConnectorProvider) -> &'static str {
    match provider {
        ConnectorProvider::GoogleDrive => "google_drive",
    }
}

/// Three-tier change detection matching the original's
/// `_file_has_changed`: compare `etag` if both sides have it, else
/// `modified_time` truncated to whole seconds, else assume changed.
fn file_has_changed(existing: &Document, file: &ConnectorFile) -> bool {
    if let (Some(existing_etag), Some(file_etag)) = (&existing.external.etag, &file.etag) {
        return existing_etag != file_etag;
    }
    if let (Some(existing_modified), Some(file_modified)) =
        (existing.external.modified_time, file.modified_time)
    {
        return existing_modified / 1000 != file_modified / 1000;
    }
    true
}

#[allow(clippy::too_many_arguments)]
pub struct SyncContext<'a> {
    pub repo: &'a Repository,
    pub oauth: &'a dyn OAuthPort,
    pub client: &'a dyn ConnectorClient,
    pub cipher: &'a dyn AtRestCipher,
    pub chunker: &'a dyn Chunker,
    pub chunking_config: ChunkingConfig,
    pub embedder: &'a dyn Embedder,
    pub injection_filter: &'a InjectionFilter,
    pub default_model_id: &'a str,
    pub max_file_bytes: u64,
    pub retry_policy: RetryPolicy,
}

/// Entry point for the external-source sync worker (spec.md §4.7).
pub async fn sync_connector_source(
    workspace_id: &str,
    source_id: &str,
    ctx: &SyncContext<'_>,
) -> Result<SyncStats, SyncError> {
    let source = ctx
        .repo
        .get_connector_source(source_id)
        .await
        .filter(|source| source.workspace_id == workspace_id)
        .ok_or(SyncError::SourceNotFound)?;

    let account = ctx
        .repo
        .get_connector_account_by_workspace_provider(&source.workspace_id, source.provider)
        .await
        .ok_or(SyncError::AccountNotFound)?;

    let refresh_token = ctx
        .cipher
        .decrypt(&account.encrypted_refresh_token)
        .map_err(|_| SyncError::TokenDecryptFailed)?;
    let refresh_token = String::from_utf8(refresh_token).map_err(|_| SyncError::TokenDecryptFailed)?;
    let _access_token = ctx.oauth.refresh_access_token(&refresh_token).await?;

    let acquired = ctx.repo.try_set_syncing(&source.id).await?;
    if !acquired {
        return Ok(SyncStats::default());
    }

    let cursor = source.cursor_json.clone();
    let delta_result = retry_with_backoff(
        ctx.retry_policy,
        |_attempt| async {
            ctx.client
                .get_delta(&source.folder_id, cursor.as_deref())
                .await
                .map_err(|err| (err.status(), err.retry_after(), err))
        },
        |delay| async move { tokio::time::sleep(delay).await },
    )
    .await;

    let delta = match delta_result {
        Ok(delta) => delta,
        Err(RetryError::Exhausted { .. }) => {
            mark_source_error(ctx.repo, &source).await?;
            return Ok(SyncStats::default());
        }
    };

    let mut stats = SyncStats::default();
    for file in delta.files.into_iter().take(MAX_FILES_PER_SYNC) {
        stats.found += 1;

        if !ctx.client.is_supported_mime(&file.mime_type) {
            stats.skipped += 1;
            continue;
        }

        let external_id = format!("{}:{}", provider_slug(source.provider), file.file_id);
        let existing = ctx
            .repo
            .get_by_external_source_id(&source.workspace_id, provider_slug(source.provider), &file.file_id)
            .await;

        match existing {
            None => {
                match ingest_file(ctx, &source, &file, &external_id, None).await {
                    Ok(true) => stats.created += 1,
                    Ok(false) => stats.skipped += 1,
                    Err(_) => stats.errored += 1,
                }
            }
            Some(document) if file_has_changed(&document, &file) => {
                match ingest_file(ctx, &source, &file, &external_id, Some(document)).await {
                    Ok(true) => stats.updated += 1,
                    Ok(false) => stats.skipped += 1,
                    Err(_) => stats.errored += 1,
                }
            }
            Some(_) => stats.skipped += 1,
        }
    }

    let mut updated_source = source.clone();
    updated_source.cursor_json = delta.new_cursor;
    updated_source.status = if stats.found > 0 && stats.errored == stats.found {
        ConnectorSourceStatus::Error
    } else {
        ConnectorSourceStatus::Active
    };
    ctx.repo.put_connector_source(updated_source).await?;

    Ok(stats)
}

async fn mark_source_error(repo: &Repository, source: &ConnectorSource) -> Result<(), RepoError> {
    let mut updated = source.clone();
    updated.status = ConnectorSourceStatus::Error;
    repo.put_connector_source(updated).await
}

/// Downloads, extracts, chunks, embeds, and persists one file as either a
/// freshly-created document (`existing = None`) or an in-place update
/// (`existing = Some(document)`, same `document_id`). Returns `Ok(false)`
/// for `SKIP_EMPTY`.
async fn ingest_file(
    ctx: &SyncContext<'_>,
    source: &ConnectorSource,
    file: &ConnectorFile,
    external_id: &str,
    existing: Option<Document>,
) -> Result<bool, ConnectorClientError> {
    let bytes = ctx
        .client
        .fetch_file_content(&file.file_id, &file.mime_type, ctx.max_file_bytes)
        .await?;
    let (content_hash, _len) = alayasiki_core::resilience::hash_stream_with_cap(
        std::iter::once(bytes.clone()),
        ctx.max_file_bytes,
    )
    .map_err(|_| ConnectorClientError::FileTooLarge { max_bytes: ctx.max_file_bytes })?;

    let kind = detect_content_kind(&file.mime_type, Some(&file.name));
    let registry = ParserRegistry;
    let extracted = match registry.extract(kind, &bytes, true) {
        Ok(extracted) if !extracted.text.trim().is_empty() => extracted,
        _ => return Ok(false),
    };

    let document_id = existing
        .as_ref()
        .map(|d| d.id.clone())
        .unwrap_or_else(new_id);
    let mut document = existing.unwrap_or_else(|| Document::new(&document_id, &source.workspace_id, &file.name));
    document.title = file.name.clone();
    document.mime_type = Some(file.mime_type.clone());
    document.content_hash = Some(content_hash);
    document.external = ExternalSourceInfo {
        provider: Some(provider_slug(source.provider).to_string()),
        external_id: Some(file.file_id.clone()),
        modified_time: file.modified_time,
        etag: file.etag.clone(),
    };
    let _ = external_id;

    let pieces = ctx.chunker.chunk(&extracted.text, &ctx.chunking_config).await;
    ctx.repo
        .delete_chunks_for_document(&document.id)
        .await
        .map_err(|_| ConnectorClientError::Permanent {
            status: 500,
            message: "failed to clear previous chunks".to_string(),
        })?;

    let chunks: Vec<Chunk> = if pieces.is_empty() {
        Vec::new()
    } else {
        let embeddings = ctx.embedder.embed_batch(&pieces, ctx.default_model_id).await;
        pieces
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(index, (content, embedding))| {
                Chunk::new(new_id(), &document.id, &document.workspace_id, index as u32, content, embedding)
            })
            .collect()
    };
    let outcome = ctx.injection_filter.apply(chunks);

    document.status = DocumentStatus::Ready;
    ctx.repo
        .save_document_with_chunks(document, outcome.chunks)
        .await
        .map_err(|_| ConnectorClientError::Permanent {
            status: 500,
            message: "failed to persist document".to_string(),
        })?;

    Ok(true)
}
