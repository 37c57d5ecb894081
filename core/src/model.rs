use chrono::{DateTime, Utc};
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::HashMap;

/// Workspace visibility level, consulted by `crate::policy::resolve_access`.
#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Eq, Clone, Copy)]
#[archive(check_bytes)]
pub enum Visibility {
    Private,
    OrgRead,
    Shared,
}

#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Eq, Clone, Copy)]
#[archive(check_bytes)]
pub enum AclRole {
    Viewer,
    Editor,
}

#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Eq, Clone, Copy)]
#[archive(check_bytes)]
pub enum ActorRole {
    Admin,
    Employee,
}

/// Non-persistent, derived from the authenticated principal on every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub role: ActorRole,
}

#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Eq, Clone, Copy)]
#[archive(check_bytes)]
pub enum DocumentStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Eq, Clone, Copy)]
#[archive(check_bytes)]
pub enum ConnectorSourceStatus {
    Pending,
    Active,
    Syncing,
    Error,
    Disabled,
}

#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone)]
#[archive(check_bytes)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub owner_user_id: Option<String>,
    pub visibility: Visibility,
    /// `Some(_)` means archived; archived workspaces are non-existent for
    /// every read/write except admin archive inspection.
    pub archived_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Workspace {
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}

#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
#[archive(check_bytes)]
pub struct WorkspaceAclEntry {
    pub workspace_id: String,
    pub user_id: String,
    pub role: AclRole,
}

/// External-source provenance carried on a `Document`.
#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone, Default)]
#[archive(check_bytes)]
pub struct ExternalSourceInfo {
    pub provider: Option<String>,
    pub external_id: Option<String>,
    /// Unix millis; compared truncated to whole seconds per sync change
    /// detection (spec.md §4.7).
    pub modified_time: Option<i64>,
    pub etag: Option<String>,
}

pub const ERROR_MESSAGE_MAX_CHARS: usize = 500;

/// Truncates an error message to [`ERROR_MESSAGE_MAX_CHARS`] with an
/// ellipsis, per spec.md §4.6 step 5.
pub fn truncate_error_message(message: &str) -> String {
    if message.chars().count() <= ERROR_MESSAGE_MAX_CHARS {
        return message.to_string();
    }
    let mut truncated: String = message.chars().take(ERROR_MESSAGE_MAX_CHARS - 1).collect();
    truncated.push('\u{2026}');
    truncated
}

#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone)]
#[archive(check_bytes)]
pub struct Document {
    pub id: String,
    pub workspace_id: String,
    pub title: String,
    pub source: Option<String>,
    pub mime_type: Option<String>,
    pub storage_key: Option<String>,
    pub status: DocumentStatus,
    pub error_message: Option<String>,
    pub content_hash: Option<String>,
    pub external: ExternalSourceInfo,
    pub uploaded_by_user_id: Option<String>,
    pub allowed_roles: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Document {
    pub fn new(id: impl Into<String>, workspace_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: id.into(),
            workspace_id: workspace_id.into(),
            title: title.into(),
            source: None,
            mime_type: None,
            storage_key: None,
            status: DocumentStatus::Pending,
            error_message: None,
            content_hash: None,
            external: ExternalSourceInfo::default(),
            uploaded_by_user_id: None,
            allowed_roles: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn external_source_id(&self) -> Option<String> {
        let provider = self.external.provider.as_ref()?;
        let external_id = self.external.external_id.as_ref()?;
        Some(format!("{provider}:{external_id}"))
    }
}

#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone, Default)]
#[archive(check_bytes)]
pub struct ChunkSecurityMetadata {
    pub security_flags: Vec<String>,
    pub risk_score: f32,
    pub detected_patterns: Vec<String>,
}

#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone)]
#[archive(check_bytes)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub workspace_id: String,
    pub chunk_index: u32,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: HashMap<String, String>,
    pub security: ChunkSecurityMetadata,
}

impl Chunk {
    pub fn new(
        id: impl Into<String>,
        document_id: impl Into<String>,
        workspace_id: impl Into<String>,
        chunk_index: u32,
        content: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        Self {
            id: id.into(),
            document_id: document_id.into(),
            workspace_id: workspace_id.into(),
            chunk_index,
            content: content.into(),
            embedding,
            metadata: HashMap::new(),
            security: ChunkSecurityMetadata::default(),
        }
    }
}

#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Eq, Clone, Copy)]
#[archive(check_bytes)]
pub enum ConnectorProvider {
    GoogleDrive,
}

#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone)]
#[archive(check_bytes)]
pub struct ConnectorSource {
    pub id: String,
    pub workspace_id: String,
    pub provider: ConnectorProvider,
    pub folder_id: String,
    pub status: ConnectorSourceStatus,
    pub cursor_json: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone)]
#[archive(check_bytes)]
pub struct ConnectorAccount {
    pub id: String,
    pub workspace_id: String,
    pub provider: ConnectorProvider,
    pub account_email: String,
    /// Ciphertext produced by `storage::crypto::AtRestCipher`.
    pub encrypted_refresh_token: Vec<u8>,
}

/// Not persisted via the WAL; audit events are append-only and flow through
/// `crate::audit::AuditSink` (spec.md: audit persistence mechanics are an
/// out-of-scope external collaborator).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub actor: Option<String>,
    pub action: String,
    pub target_id: Option<String>,
    pub metadata_json: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
