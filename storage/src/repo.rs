use crate::crypto::{AtRestCipher, NoOpCipher};
use crate::index::ann::{cosine_similarity, LinearAnnIndex};
use crate::snapshot::{SnapshotError, SnapshotManager};
use crate::wal::{Wal, WalError};
use alayasiki_core::model::{
    Chunk, ConnectorAccount, ConnectorSource, ConnectorSourceStatus, Document, DocumentStatus,
    ExternalSourceInfo, Workspace, WorkspaceAclEntry,
};
use rkyv::ser::{serializers::AllocSerializer, Serializer};
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("Serialization error")]
    Serialization,
    #[error("Deserialization error")]
    Deserialization,
    #[error("Not found")]
    NotFound,
    #[error("Invalid snapshot id: {0}")]
    InvalidSnapshotId(String),
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),
    #[error("Snapshot manager is not configured")]
    SnapshotNotConfigured,
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    EmbeddingDimensionMismatch { expected: usize, actual: usize },
}

/// WAL entry types for durability. Each high-level repository operation maps
/// to exactly one entry, so "N mutations committed atomically" (Testable
/// Property 3, the chunk-set replace) falls out of "one fsync'd record" with
/// no separate transaction-batching machinery needed.
#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
pub enum WalEntry {
    PutWorkspace(Workspace),
    PutAclEntry(WorkspaceAclEntry),
    RemoveAclEntry {
        workspace_id: String,
        user_id: String,
    },
    PutDocument(Document),
    DeleteDocument(String),
    SaveDocumentWithChunks {
        document: Document,
        chunks: Vec<Chunk>,
    },
    SaveChunks {
        document_id: String,
        chunks: Vec<Chunk>,
    },
    DeleteChunksForDocument(String),
    TransitionDocumentStatus {
        document_id: String,
        status: DocumentStatus,
        error_message: Option<String>,
    },
    UpdateExternalSourceMetadata {
        document_id: String,
        external: ExternalSourceInfo,
    },
    PutConnectorSource(ConnectorSource),
    PutConnectorAccount(ConnectorAccount),
}

#[derive(Default)]
struct MaterializedState {
    workspaces: HashMap<String, Workspace>,
    acl: Vec<WorkspaceAclEntry>,
    documents: HashMap<String, Document>,
    chunks: HashMap<String, Chunk>,
    chunk_ids_by_document: HashMap<String, Vec<String>>,
    ann_index: LinearAnnIndex,
    connector_sources: HashMap<String, ConnectorSource>,
    connector_accounts: HashMap<String, ConnectorAccount>,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, Default)]
#[archive(check_bytes)]
struct RepositoryBackupSnapshot {
    lsn: u64,
    workspaces: Vec<Workspace>,
    acl: Vec<WorkspaceAclEntry>,
    documents: Vec<Document>,
    chunks: Vec<Chunk>,
    connector_sources: Vec<ConnectorSource>,
    connector_accounts: Vec<ConnectorAccount>,
}

/// Immutable read view materialized at a specific WAL LSN (supplemented
/// feature: point-in-time reads).
pub struct SnapshotView {
    snapshot_id: String,
    documents: HashMap<String, Document>,
    chunk_ids_by_document: HashMap<String, Vec<String>>,
    chunks: HashMap<String, Chunk>,
}

impl SnapshotView {
    pub fn snapshot_id(&self) -> &str {
        &self.snapshot_id
    }

    pub fn get_document(&self, document_id: &str) -> Option<&Document> {
        self.documents.get(document_id)
    }

    pub fn chunks_for_document(&self, document_id: &str) -> Vec<&Chunk> {
        self.chunk_ids_by_document
            .get(document_id)
            .map(|ids| ids.iter().filter_map(|id| self.chunks.get(id)).collect())
            .unwrap_or_default()
    }
}

pub struct Repository {
    wal: Arc<Mutex<Wal>>,
    tx_lock: Arc<Mutex<()>>,
    workspaces: Arc<RwLock<HashMap<String, Workspace>>>,
    acl: Arc<RwLock<Vec<WorkspaceAclEntry>>>,
    documents: Arc<RwLock<HashMap<String, Document>>>,
    chunks: Arc<RwLock<HashMap<String, Chunk>>>,
    chunk_ids_by_document: Arc<RwLock<HashMap<String, Vec<String>>>>,
    pub ann_index: Arc<RwLock<LinearAnnIndex>>,
    connector_sources: Arc<RwLock<HashMap<String, ConnectorSource>>>,
    connector_accounts: Arc<RwLock<HashMap<String, ConnectorAccount>>>,
    snapshot_manager: Option<SnapshotManager>,
}

impl Repository {
    pub async fn open(wal_path: impl AsRef<Path>) -> Result<Self, RepoError> {
        Self::open_with_cipher(wal_path, Arc::new(NoOpCipher)).await
    }

    pub async fn open_with_cipher(
        wal_path: impl AsRef<Path>,
        cipher: Arc<dyn AtRestCipher>,
    ) -> Result<Self, RepoError> {
        Self::open_internal(wal_path.as_ref().to_path_buf(), cipher, None).await
    }

    pub async fn open_with_snapshots(
        wal_path: impl AsRef<Path>,
        snapshot_dir: impl AsRef<Path>,
    ) -> Result<Self, RepoError> {
        Self::open_with_cipher_and_snapshots(wal_path, Arc::new(NoOpCipher), snapshot_dir).await
    }

    pub async fn open_with_cipher_and_snapshots(
        wal_path: impl AsRef<Path>,
        cipher: Arc<dyn AtRestCipher>,
        snapshot_dir: impl AsRef<Path>,
    ) -> Result<Self, RepoError> {
        let snapshot_manager = SnapshotManager::new(snapshot_dir.as_ref());
        Self::open_internal(
            wal_path.as_ref().to_path_buf(),
            cipher,
            Some(snapshot_manager),
        )
        .await
    }

    async fn open_internal(
        wal_path: PathBuf,
        cipher: Arc<dyn AtRestCipher>,
        snapshot_manager: Option<SnapshotManager>,
    ) -> Result<Self, RepoError> {
        let wal_instance = Wal::open_with_cipher(&wal_path, cipher).await?;
        let wal = Arc::new(Mutex::new(wal_instance));
        let tx_lock = Arc::new(Mutex::new(()));
        let (mut materialized, base_lsn) =
            load_materialized_state_from_backup(snapshot_manager.as_ref(), None).await?;

        {
            let mut wal_lock = wal.lock().await;
            let last_replayed_lsn = wal_lock
                .replay(|lsn, data| {
                    if lsn <= base_lsn {
                        return Ok(());
                    }
                    let entry = decode_wal_entry(&data)?;
                    apply_entry(&entry, &mut materialized);
                    Ok(())
                })
                .await?;

            if base_lsn > last_replayed_lsn {
                return Err(RepoError::SnapshotNotFound(format!("wal-lsn-{base_lsn}")));
            }
        }

        Ok(Self {
            wal,
            tx_lock,
            workspaces: Arc::new(RwLock::new(materialized.workspaces)),
            acl: Arc::new(RwLock::new(materialized.acl)),
            documents: Arc::new(RwLock::new(materialized.documents)),
            chunks: Arc::new(RwLock::new(materialized.chunks)),
            chunk_ids_by_document: Arc::new(RwLock::new(materialized.chunk_ids_by_document)),
            ann_index: Arc::new(RwLock::new(materialized.ann_index)),
            connector_sources: Arc::new(RwLock::new(materialized.connector_sources)),
            connector_accounts: Arc::new(RwLock::new(materialized.connector_accounts)),
            snapshot_manager,
        })
    }

    async fn commit(&self, entry: WalEntry) -> Result<(), RepoError> {
        let _tx_guard = self.tx_lock.lock().await;
        let bytes = serialize_wal_entry(&entry)?;
        {
            let mut wal = self.wal.lock().await;
            wal.append(&bytes).await?;
            wal.flush().await?;
        }
        self.apply_locked(&entry).await;
        Ok(())
    }

    async fn apply_locked(&self, entry: &WalEntry) {
        match entry {
            WalEntry::PutWorkspace(workspace) => {
                self.workspaces
                    .write()
                    .await
                    .insert(workspace.id.clone(), workspace.clone());
            }
            WalEntry::PutAclEntry(acl_entry) => {
                let mut acl = self.acl.write().await;
                acl.retain(|e| {
                    !(e.workspace_id == acl_entry.workspace_id && e.user_id == acl_entry.user_id)
                });
                acl.push(acl_entry.clone());
            }
            WalEntry::RemoveAclEntry { workspace_id, user_id } => {
                self.acl
                    .write()
                    .await
                    .retain(|e| !(&e.workspace_id == workspace_id && &e.user_id == user_id));
            }
            WalEntry::PutDocument(document) => {
                self.documents
                    .write()
                    .await
                    .insert(document.id.clone(), document.clone());
            }
            WalEntry::DeleteDocument(document_id) => {
                self.documents.write().await.remove(document_id);
                self.remove_chunks_for_document(document_id).await;
            }
            WalEntry::SaveDocumentWithChunks { document, chunks } => {
                self.documents
                    .write()
                    .await
                    .insert(document.id.clone(), document.clone());
                self.replace_chunks_locked(&document.id, chunks.clone()).await;
            }
            WalEntry::SaveChunks { document_id, chunks } => {
                self.replace_chunks_locked(document_id, chunks.clone()).await;
            }
            WalEntry::DeleteChunksForDocument(document_id) => {
                self.remove_chunks_for_document(document_id).await;
            }
            WalEntry::TransitionDocumentStatus {
                document_id,
                status,
                error_message,
            } => {
                if let Some(document) = self.documents.write().await.get_mut(document_id) {
                    document.status = *status;
                    document.error_message = error_message.clone();
                }
            }
            WalEntry::UpdateExternalSourceMetadata {
                document_id,
                external,
            } => {
                if let Some(document) = self.documents.write().await.get_mut(document_id) {
                    document.external = external.clone();
                }
            }
            WalEntry::PutConnectorSource(source) => {
                self.connector_sources
                    .write()
                    .await
                    .insert(source.id.clone(), source.clone());
            }
            WalEntry::PutConnectorAccount(account) => {
                self.connector_accounts
                    .write()
                    .await
                    .insert(account.id.clone(), account.clone());
            }
        }
    }

    async fn remove_chunks_for_document(&self, document_id: &str) {
        let mut chunk_ids_by_document = self.chunk_ids_by_document.write().await;
        let mut chunks = self.chunks.write().await;
        let mut ann_index = self.ann_index.write().await;
        if let Some(ids) = chunk_ids_by_document.remove(document_id) {
            for id in ids {
                chunks.remove(&id);
                ann_index.delete(&id);
            }
        }
    }

    async fn replace_chunks_locked(&self, document_id: &str, new_chunks: Vec<Chunk>) {
        let mut chunk_ids_by_document = self.chunk_ids_by_document.write().await;
        let mut chunks = self.chunks.write().await;
        let mut ann_index = self.ann_index.write().await;

        if let Some(old_ids) = chunk_ids_by_document.remove(document_id) {
            for id in old_ids {
                chunks.remove(&id);
                ann_index.delete(&id);
            }
        }

        let mut new_ids = Vec::with_capacity(new_chunks.len());
        for chunk in new_chunks {
            new_ids.push(chunk.id.clone());
            ann_index.insert(chunk.id.clone(), chunk.embedding.clone());
            chunks.insert(chunk.id.clone(), chunk);
        }
        chunk_ids_by_document.insert(document_id.to_string(), new_ids);
    }

    // ---- Workspace & ACL (C1 collaborators) ----

    pub async fn put_workspace(&self, workspace: Workspace) -> Result<(), RepoError> {
        self.commit(WalEntry::PutWorkspace(workspace)).await
    }

    pub async fn get_workspace(&self, workspace_id: &str) -> Option<Workspace> {
        self.workspaces.read().await.get(workspace_id).cloned()
    }

    pub async fn put_acl_entry(&self, entry: WorkspaceAclEntry) -> Result<(), RepoError> {
        self.commit(WalEntry::PutAclEntry(entry)).await
    }

    pub async fn remove_acl_entry(
        &self,
        workspace_id: &str,
        user_id: &str,
    ) -> Result<(), RepoError> {
        self.commit(WalEntry::RemoveAclEntry {
            workspace_id: workspace_id.to_string(),
            user_id: user_id.to_string(),
        })
        .await
    }

    pub async fn acl_for_workspace(&self, workspace_id: &str) -> Vec<WorkspaceAclEntry> {
        self.acl
            .read()
            .await
            .iter()
            .filter(|e| e.workspace_id == workspace_id)
            .cloned()
            .collect()
    }

    // ---- Documents & chunks (C2) ----

    pub async fn save_document(&self, document: Document) -> Result<(), RepoError> {
        self.commit(WalEntry::PutDocument(document)).await
    }

    pub async fn get_document(&self, document_id: &str) -> Option<Document> {
        self.documents.read().await.get(document_id).cloned()
    }

    pub async fn delete_document(&self, document_id: &str) -> Result<(), RepoError> {
        self.commit(WalEntry::DeleteDocument(document_id.to_string()))
            .await
    }

    pub async fn delete_chunks_for_document(&self, document_id: &str) -> Result<(), RepoError> {
        self.commit(WalEntry::DeleteChunksForDocument(document_id.to_string()))
            .await
    }

    /// Atomically replaces the document row and its entire chunk set
    /// (spec.md §4.6 step 4f; Testable Property 3). Validates every chunk's
    /// embedding has the same, uniform dimension before committing anything.
    pub async fn save_document_with_chunks(
        &self,
        document: Document,
        chunks: Vec<Chunk>,
    ) -> Result<(), RepoError> {
        if let Some(expected) = chunks.first().map(|c| c.embedding.len()) {
            for chunk in &chunks {
                if chunk.embedding.len() != expected {
                    return Err(RepoError::EmbeddingDimensionMismatch {
                        expected,
                        actual: chunk.embedding.len(),
                    });
                }
            }
        }
        self.commit(WalEntry::SaveDocumentWithChunks { document, chunks })
            .await
    }

    /// Replaces a document's chunk set without touching the document row
    /// itself (spec.md §4.2's standalone `save_chunks`). Requires the
    /// document to already exist in `workspace_id` and that prior chunks
    /// were already cleared in the same unit of work (or never existed);
    /// callers that also need to update document fields atomically with
    /// the chunk swap should use `save_document_with_chunks` instead.
    pub async fn save_chunks(
        &self,
        document_id: &str,
        chunks: Vec<Chunk>,
        workspace_id: &str,
    ) -> Result<(), RepoError> {
        if let Some(expected) = chunks.first().map(|c| c.embedding.len()) {
            for chunk in &chunks {
                if chunk.embedding.len() != expected {
                    return Err(RepoError::EmbeddingDimensionMismatch {
                        expected,
                        actual: chunk.embedding.len(),
                    });
                }
            }
        }
        match self.documents.read().await.get(document_id) {
            Some(document) if document.workspace_id == workspace_id => {}
            _ => return Err(RepoError::NotFound),
        }
        self.commit(WalEntry::SaveChunks {
            document_id: document_id.to_string(),
            chunks,
        })
        .await
    }

    pub async fn chunks_for_document(&self, document_id: &str) -> Vec<Chunk> {
        let chunk_ids_by_document = self.chunk_ids_by_document.read().await;
        let chunks = self.chunks.read().await;
        chunk_ids_by_document
            .get(document_id)
            .map(|ids| ids.iter().filter_map(|id| chunks.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// CAS lock on `document.status` (Testable Property 11): only mutates
    /// and only writes a WAL record when the current status is one of
    /// `from_states`. Returns `false` (no-op) otherwise.
    pub async fn transition_document_status(
        &self,
        document_id: &str,
        from_states: &[DocumentStatus],
        to: DocumentStatus,
        error_message: Option<String>,
    ) -> Result<bool, RepoError> {
        let _tx_guard = self.tx_lock.lock().await;

        let current_status = {
            let documents = self.documents.read().await;
            match documents.get(document_id) {
                Some(document) => document.status,
                None => return Err(RepoError::NotFound),
            }
        };

        if !from_states.contains(&current_status) {
            return Ok(false);
        }

        let entry = WalEntry::TransitionDocumentStatus {
            document_id: document_id.to_string(),
            status: to,
            error_message: error_message.map(|m| alayasiki_core::model::truncate_error_message(&m)),
        };
        let bytes = serialize_wal_entry(&entry)?;
        {
            let mut wal = self.wal.lock().await;
            wal.append(&bytes).await?;
            wal.flush().await?;
        }
        self.apply_locked(&entry).await;
        Ok(true)
    }

    pub async fn update_external_source_metadata(
        &self,
        document_id: &str,
        external: ExternalSourceInfo,
    ) -> Result<(), RepoError> {
        self.commit(WalEntry::UpdateExternalSourceMetadata {
            document_id: document_id.to_string(),
            external,
        })
        .await
    }

    pub async fn get_by_external_source_id(
        &self,
        workspace_id: &str,
        provider: &str,
        external_id: &str,
    ) -> Option<Document> {
        let documents = self.documents.read().await;
        documents
            .values()
            .find(|document| {
                document.workspace_id == workspace_id
                    && document.external.provider.as_deref() == Some(provider)
                    && document.external.external_id.as_deref() == Some(external_id)
            })
            .cloned()
    }

    /// Dense cosine-similarity retrieval, workspace-scoped (Testable
    /// Property 1: results never cross workspace boundaries).
    pub async fn find_similar_chunks(
        &self,
        workspace_id: &str,
        query_embedding: &[f32],
        top_k: usize,
    ) -> Vec<(Chunk, f32)> {
        let candidates = {
            let chunks = self.chunks.read().await;
            let index = self.ann_index.read().await;
            index.search_filtered(query_embedding, top_k, |id| {
                chunks
                    .get(id)
                    .is_some_and(|chunk| chunk.workspace_id == workspace_id)
            })
        };
        let chunks = self.chunks.read().await;
        candidates
            .into_iter()
            .filter_map(|(id, score)| chunks.get(&id).cloned().map(|chunk| (chunk, score)))
            .collect()
    }

    /// Maximal Marginal Relevance re-selection over a wider dense candidate
    /// pool (glossary: MMR). `lambda` balances query relevance against
    /// diversity from already-selected chunks.
    pub async fn find_similar_chunks_mmr(
        &self,
        workspace_id: &str,
        query_embedding: &[f32],
        top_k: usize,
        candidate_multiplier: usize,
        lambda: f32,
    ) -> Vec<(Chunk, f32)> {
        let pool_size = top_k.saturating_mul(candidate_multiplier.max(1));
        let candidates = self
            .find_similar_chunks(workspace_id, query_embedding, pool_size)
            .await;

        let mut pool = candidates;
        let mut selected: Vec<(Chunk, f32)> = Vec::with_capacity(top_k);

        while selected.len() < top_k && !pool.is_empty() {
            let (best_index, best_score) = pool
                .iter()
                .enumerate()
                .map(|(i, (chunk, relevance))| {
                    let max_sim_to_selected = selected
                        .iter()
                        .filter_map(|(s, _)| cosine_similarity(&chunk.embedding, &s.embedding))
                        .fold(0.0_f32, f32::max);
                    let mmr_score = lambda * relevance - (1.0 - lambda) * max_sim_to_selected;
                    (i, mmr_score)
                })
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                .expect("pool is non-empty");

            let (chunk, original_score) = pool.remove(best_index);
            let _ = best_score;
            selected.push((chunk, original_score));
        }

        selected
    }

    /// Naive term-overlap lexical scoring (no full-text-index crate in the
    /// dependency stack; hand-rolled the way `LinearAnnIndex` stands in for
    /// a real ANN library). Workspace-scoped like dense retrieval.
    pub async fn find_chunks_full_text(
        &self,
        workspace_id: &str,
        query: &str,
        top_k: usize,
    ) -> Vec<(Chunk, f32)> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() {
            return Vec::new();
        }

        let chunks = self.chunks.read().await;
        let mut scored: Vec<(Chunk, f32)> = chunks
            .values()
            .filter(|chunk| chunk.workspace_id == workspace_id)
            .filter_map(|chunk| {
                let score = term_overlap_score(&query_terms, &chunk.content);
                (score > 0.0).then(|| (chunk.clone(), score))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        scored.truncate(top_k);
        scored
    }

    // ---- Connectors (C7 collaborators) ----

    pub async fn put_connector_source(&self, source: ConnectorSource) -> Result<(), RepoError> {
        self.commit(WalEntry::PutConnectorSource(source)).await
    }

    pub async fn get_connector_source(&self, source_id: &str) -> Option<ConnectorSource> {
        self.connector_sources.read().await.get(source_id).cloned()
    }

    pub async fn put_connector_account(&self, account: ConnectorAccount) -> Result<(), RepoError> {
        self.commit(WalEntry::PutConnectorAccount(account)).await
    }

    pub async fn get_connector_account(&self, account_id: &str) -> Option<ConnectorAccount> {
        self.connector_accounts
            .read()
            .await
            .get(account_id)
            .cloned()
    }

    /// OAuth accounts are upserted per `(workspace_id, provider)` (at most
    /// one account per provider per workspace), so sync looks them up by
    /// that pair rather than by account id.
    pub async fn get_connector_account_by_workspace_provider(
        &self,
        workspace_id: &str,
        provider: alayasiki_core::model::ConnectorProvider,
    ) -> Option<ConnectorAccount> {
        self.connector_accounts
            .read()
            .await
            .values()
            .find(|account| account.workspace_id == workspace_id && account.provider == provider)
            .cloned()
    }

    /// CAS lock on `ConnectorSource.status`, serializing sync runs per
    /// source (spec.md §4.7, §5).
    pub async fn try_set_syncing(&self, source_id: &str) -> Result<bool, RepoError> {
        let _tx_guard = self.tx_lock.lock().await;

        let current = {
            let sources = self.connector_sources.read().await;
            match sources.get(source_id) {
                Some(source) => source.clone(),
                None => return Err(RepoError::NotFound),
            }
        };

        if !matches!(
            current.status,
            ConnectorSourceStatus::Pending
                | ConnectorSourceStatus::Active
                | ConnectorSourceStatus::Error
        ) {
            return Ok(false);
        }

        let mut updated = current;
        updated.status = ConnectorSourceStatus::Syncing;
        let entry = WalEntry::PutConnectorSource(updated);
        let bytes = serialize_wal_entry(&entry)?;
        {
            let mut wal = self.wal.lock().await;
            wal.append(&bytes).await?;
            wal.flush().await?;
        }
        self.apply_locked(&entry).await;
        Ok(true)
    }

    // ---- Snapshots & backup (supplemented feature: point-in-time reads) ----

    pub async fn current_snapshot_id(&self) -> String {
        let wal = self.wal.lock().await;
        format!("wal-lsn-{}", wal.current_lsn())
    }

    pub async fn create_backup_snapshot(&self) -> Result<String, RepoError> {
        let snapshot_manager = self
            .snapshot_manager
            .as_ref()
            .ok_or(RepoError::SnapshotNotConfigured)?;

        let snapshot = {
            let _tx_guard = self.tx_lock.lock().await;
            let lsn = self.wal.lock().await.current_lsn();

            let mut workspaces: Vec<Workspace> =
                self.workspaces.read().await.values().cloned().collect();
            workspaces.sort_by(|a, b| a.id.cmp(&b.id));

            let mut acl = self.acl.read().await.clone();
            acl.sort_by(|a, b| a.workspace_id.cmp(&b.workspace_id).then(a.user_id.cmp(&b.user_id)));

            let mut documents: Vec<Document> =
                self.documents.read().await.values().cloned().collect();
            documents.sort_by(|a, b| a.id.cmp(&b.id));

            let mut chunks: Vec<Chunk> = self.chunks.read().await.values().cloned().collect();
            chunks.sort_by(|a, b| a.id.cmp(&b.id));

            let mut connector_sources: Vec<ConnectorSource> =
                self.connector_sources.read().await.values().cloned().collect();
            connector_sources.sort_by(|a, b| a.id.cmp(&b.id));

            let mut connector_accounts: Vec<ConnectorAccount> =
                self.connector_accounts.read().await.values().cloned().collect();
            connector_accounts.sort_by(|a, b| a.id.cmp(&b.id));

            RepositoryBackupSnapshot {
                lsn,
                workspaces,
                acl,
                documents,
                chunks,
                connector_sources,
                connector_accounts,
            }
        };

        let encoded = serialize_backup_snapshot(&snapshot)?;
        snapshot_manager
            .create_snapshot(snapshot.lsn, &encoded)
            .await?;
        Ok(format!("wal-lsn-{}", snapshot.lsn))
    }

    pub async fn restore_from_latest_backup(&self) -> Result<String, RepoError> {
        if self.snapshot_manager.is_none() {
            return Err(RepoError::SnapshotNotConfigured);
        }

        let _tx_guard = self.tx_lock.lock().await;
        let target_lsn = self.wal.lock().await.current_lsn();

        let (mut materialized, base_lsn) =
            load_materialized_state_from_backup(self.snapshot_manager.as_ref(), Some(target_lsn))
                .await?;

        {
            let mut wal = self.wal.lock().await;
            wal.replay(|lsn, data| {
                if lsn <= base_lsn || lsn > target_lsn {
                    return Ok(());
                }
                let entry = decode_wal_entry(&data)?;
                apply_entry(&entry, &mut materialized);
                Ok(())
            })
            .await?;
        }

        *self.workspaces.write().await = materialized.workspaces;
        *self.acl.write().await = materialized.acl;
        *self.documents.write().await = materialized.documents;
        *self.chunks.write().await = materialized.chunks;
        *self.chunk_ids_by_document.write().await = materialized.chunk_ids_by_document;
        *self.ann_index.write().await = materialized.ann_index;
        *self.connector_sources.write().await = materialized.connector_sources;
        *self.connector_accounts.write().await = materialized.connector_accounts;

        Ok(format!("wal-lsn-{target_lsn}"))
    }

    pub async fn load_snapshot_view(&self, snapshot_id: &str) -> Result<SnapshotView, RepoError> {
        let target_lsn = parse_wal_snapshot_lsn(snapshot_id)
            .ok_or_else(|| RepoError::InvalidSnapshotId(snapshot_id.to_string()))?;

        let current_lsn = self.wal.lock().await.current_lsn();
        if target_lsn > current_lsn {
            return Err(RepoError::SnapshotNotFound(snapshot_id.to_string()));
        }

        let (mut materialized, base_lsn) =
            load_materialized_state_from_backup(self.snapshot_manager.as_ref(), Some(target_lsn))
                .await?;

        let mut wal = self.wal.lock().await;
        wal.replay(|lsn, data| {
            if lsn <= base_lsn || lsn > target_lsn {
                return Ok(());
            }
            let entry = decode_wal_entry(&data)?;
            apply_entry(&entry, &mut materialized);
            Ok(())
        })
        .await?;

        Ok(SnapshotView {
            snapshot_id: snapshot_id.to_string(),
            documents: materialized.documents,
            chunk_ids_by_document: materialized.chunk_ids_by_document,
            chunks: materialized.chunks,
        })
    }

    pub async fn list_document_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.documents.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

fn term_overlap_score(query_terms: &[String], content: &str) -> f32 {
    let content_terms = tokenize(content);
    if content_terms.is_empty() {
        return 0.0;
    }
    let matches = query_terms
        .iter()
        .filter(|term| content_terms.contains(term))
        .count();
    matches as f32 / query_terms.len() as f32
}

fn serialize_wal_entry(entry: &WalEntry) -> Result<Vec<u8>, RepoError> {
    let mut serializer = AllocSerializer::<4096>::default();
    serializer
        .serialize_value(entry)
        .map_err(|_| RepoError::Serialization)?;
    Ok(serializer.into_serializer().into_inner().to_vec())
}

fn serialize_backup_snapshot(snapshot: &RepositoryBackupSnapshot) -> Result<Vec<u8>, RepoError> {
    let mut serializer = AllocSerializer::<4096>::default();
    serializer
        .serialize_value(snapshot)
        .map_err(|_| RepoError::Serialization)?;
    Ok(serializer.into_serializer().into_inner().to_vec())
}

fn decode_wal_entry(bytes: &[u8]) -> Result<WalEntry, WalError> {
    let archived =
        rkyv::check_archived_root::<WalEntry>(bytes).map_err(|_| WalError::CorruptEntry)?;
    archived
        .deserialize(&mut rkyv::Infallible)
        .map_err(|_: std::convert::Infallible| WalError::CorruptEntry)
}

async fn deserialize_backup_snapshot(path: &Path) -> Result<RepositoryBackupSnapshot, RepoError> {
    let bytes = fs::read(path)
        .await
        .map_err(|err| RepoError::Snapshot(SnapshotError::Io(err)))?;
    let archived = rkyv::check_archived_root::<RepositoryBackupSnapshot>(&bytes[..])
        .map_err(|_| RepoError::Deserialization)?;
    archived
        .deserialize(&mut rkyv::Infallible)
        .map_err(|_| RepoError::Deserialization)
}

async fn load_materialized_state_from_backup(
    snapshot_manager: Option<&SnapshotManager>,
    target_lsn: Option<u64>,
) -> Result<(MaterializedState, u64), RepoError> {
    let Some(manager) = snapshot_manager else {
        return Ok((MaterializedState::default(), 0));
    };

    let selected = match target_lsn {
        Some(lsn) => manager.latest_snapshot_at_or_before(lsn).await?,
        None => manager.latest_snapshot().await?,
    };

    let Some((snapshot_lsn, path)) = selected else {
        return Ok((MaterializedState::default(), 0));
    };

    let snapshot = deserialize_backup_snapshot(&path).await?;
    if snapshot.lsn != snapshot_lsn {
        return Err(RepoError::Deserialization);
    }

    let mut materialized = MaterializedState::default();
    for workspace in snapshot.workspaces {
        materialized.workspaces.insert(workspace.id.clone(), workspace);
    }
    materialized.acl = snapshot.acl;
    for document in snapshot.documents {
        materialized.documents.insert(document.id.clone(), document);
    }
    for chunk in snapshot.chunks {
        materialized
            .chunk_ids_by_document
            .entry(chunk.document_id.clone())
            .or_default()
            .push(chunk.id.clone());
        materialized.ann_index.insert(chunk.id.clone(), chunk.embedding.clone());
        materialized.chunks.insert(chunk.id.clone(), chunk);
    }
    for source in snapshot.connector_sources {
        materialized.connector_sources.insert(source.id.clone(), source);
    }
    for account in snapshot.connector_accounts {
        materialized
            .connector_accounts
            .insert(account.id.clone(), account);
    }

    Ok((materialized, snapshot_lsn))
}

fn apply_entry(entry: &WalEntry, materialized: &mut MaterializedState) {
    match entry {
        WalEntry::PutWorkspace(workspace) => {
            materialized
                .workspaces
                .insert(workspace.id.clone(), workspace.clone());
        }
        WalEntry::PutAclEntry(entry) => {
            materialized
                .acl
                .retain(|e| !(e.workspace_id == entry.workspace_id && e.user_id == entry.user_id));
            materialized.acl.push(entry.clone());
        }
        WalEntry::RemoveAclEntry { workspace_id, user_id } => {
            materialized
                .acl
                .retain(|e| !(&e.workspace_id == workspace_id && &e.user_id == user_id));
        }
        WalEntry::PutDocument(document) => {
            materialized
                .documents
                .insert(document.id.clone(), document.clone());
        }
        WalEntry::DeleteDocument(document_id) => {
            materialized.documents.remove(document_id);
            remove_chunks(materialized, document_id);
        }
        WalEntry::SaveDocumentWithChunks { document, chunks } => {
            materialized
                .documents
                .insert(document.id.clone(), document.clone());
            remove_chunks(materialized, &document.id);
            let mut ids = Vec::with_capacity(chunks.len());
            for chunk in chunks {
                ids.push(chunk.id.clone());
                materialized
                    .ann_index
                    .insert(chunk.id.clone(), chunk.embedding.clone());
                materialized.chunks.insert(chunk.id.clone(), chunk.clone());
            }
            materialized
                .chunk_ids_by_document
                .insert(document.id.clone(), ids);
        }
        WalEntry::SaveChunks { document_id, chunks } => {
            remove_chunks(materialized, document_id);
            let mut ids = Vec::with_capacity(chunks.len());
            for chunk in chunks {
                ids.push(chunk.id.clone());
                materialized
                    .ann_index
                    .insert(chunk.id.clone(), chunk.embedding.clone());
                materialized.chunks.insert(chunk.id.clone(), chunk.clone());
            }
            materialized
                .chunk_ids_by_document
                .insert(document_id.clone(), ids);
        }
        WalEntry::DeleteChunksForDocument(document_id) => {
            remove_chunks(materialized, document_id);
        }
        WalEntry::TransitionDocumentStatus {
            document_id,
            status,
            error_message,
        } => {
            if let Some(document) = materialized.documents.get_mut(document_id) {
                document.status = *status;
                document.error_message = error_message.clone();
            }
        }
        WalEntry::UpdateExternalSourceMetadata {
            document_id,
            external,
        } => {
            if let Some(document) = materialized.documents.get_mut(document_id) {
                document.external = external.clone();
            }
        }
        WalEntry::PutConnectorSource(source) => {
            materialized
                .connector_sources
                .insert(source.id.clone(), source.clone());
        }
        WalEntry::PutConnectorAccount(account) => {
            materialized
                .connector_accounts
                .insert(account.id.clone(), account.clone());
        }
    }
}

fn remove_chunks(materialized: &mut MaterializedState, document_id: &str) {
    if let Some(ids) = materialized.chunk_ids_by_document.remove(document_id) {
        for id in ids {
            materialized.chunks.remove(&id);
            materialized.ann_index.delete(&id);
        }
    }
}

fn parse_wal_snapshot_lsn(snapshot_id: &str) -> Option<u64> {
    snapshot_id.strip_prefix("wal-lsn-")?.parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alayasiki_core::model::ChunkSecurityMetadata;
    use tempfile::tempdir;

    fn doc(id: &str, workspace_id: &str) -> Document {
        Document::new(id, workspace_id, "Title")
    }

    fn chunk(id: &str, document_id: &str, workspace_id: &str, index: u32, embedding: Vec<f32>) -> Chunk {
        Chunk {
            id: id.to_string(),
            document_id: document_id.to_string(),
            workspace_id: workspace_id.to_string(),
            chunk_index: index,
            content: format!("content for {id}"),
            embedding,
            metadata: HashMap::new(),
            security: ChunkSecurityMetadata::default(),
        }
    }

    #[tokio::test]
    async fn saves_and_reads_document_with_chunks() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path().join("repo.wal")).await.unwrap();

        let document = doc("d1", "ws1");
        let chunks = vec![
            chunk("c1", "d1", "ws1", 0, vec![1.0, 0.0]),
            chunk("c2", "d1", "ws1", 1, vec![0.0, 1.0]),
        ];
        repo.save_document_with_chunks(document.clone(), chunks)
            .await
            .unwrap();

        let loaded = repo.get_document("d1").await.unwrap();
        assert_eq!(loaded.id, "d1");
        assert_eq!(repo.chunks_for_document("d1").await.len(), 2);
    }

    #[tokio::test]
    async fn rejects_mismatched_embedding_dimensions() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path().join("repo.wal")).await.unwrap();

        let chunks = vec![
            chunk("c1", "d1", "ws1", 0, vec![1.0, 0.0]),
            chunk("c2", "d1", "ws1", 1, vec![0.0, 1.0, 0.0]),
        ];
        let result = repo.save_document_with_chunks(doc("d1", "ws1"), chunks).await;
        assert!(matches!(
            result,
            Err(RepoError::EmbeddingDimensionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn save_chunks_replaces_chunk_set_without_touching_document() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path().join("repo.wal")).await.unwrap();

        let mut document = doc("d1", "ws1");
        document.title = "Original Title".to_string();
        repo.save_document(document).await.unwrap();

        let chunks = vec![
            chunk("c1", "d1", "ws1", 0, vec![1.0, 0.0]),
            chunk("c2", "d1", "ws1", 1, vec![0.0, 1.0]),
        ];
        repo.save_chunks("d1", chunks, "ws1").await.unwrap();

        let loaded = repo.get_document("d1").await.unwrap();
        assert_eq!(loaded.title, "Original Title");
        assert_eq!(repo.chunks_for_document("d1").await.len(), 2);

        let replacement = vec![chunk("c3", "d1", "ws1", 0, vec![1.0, 0.0])];
        repo.save_chunks("d1", replacement, "ws1").await.unwrap();
        let chunks_after = repo.chunks_for_document("d1").await;
        assert_eq!(chunks_after.len(), 1);
        assert_eq!(chunks_after[0].id, "c3");
    }

    #[tokio::test]
    async fn save_chunks_rejects_unknown_document_and_wrong_workspace() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path().join("repo.wal")).await.unwrap();

        let missing = repo
            .save_chunks("missing-doc", vec![chunk("c1", "missing-doc", "ws1", 0, vec![1.0])], "ws1")
            .await;
        assert!(matches!(missing, Err(RepoError::NotFound)));

        repo.save_document(doc("d1", "ws1")).await.unwrap();
        let wrong_workspace = repo
            .save_chunks("d1", vec![chunk("c1", "d1", "ws1", 0, vec![1.0])], "ws2")
            .await;
        assert!(matches!(wrong_workspace, Err(RepoError::NotFound)));
    }

    #[tokio::test]
    async fn atomic_replace_leaves_no_stale_chunk_from_prior_generation() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path().join("repo.wal")).await.unwrap();

        repo.save_document_with_chunks(
            doc("d1", "ws1"),
            vec![chunk("c1", "d1", "ws1", 0, vec![1.0])],
        )
        .await
        .unwrap();
        repo.save_document_with_chunks(
            doc("d1", "ws1"),
            vec![chunk("c2", "d1", "ws1", 0, vec![2.0])],
        )
        .await
        .unwrap();

        let chunks = repo.chunks_for_document("d1").await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, "c2");
    }

    #[tokio::test]
    async fn find_similar_chunks_is_workspace_scoped() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path().join("repo.wal")).await.unwrap();

        repo.save_document_with_chunks(
            doc("dA", "A"),
            vec![chunk("cA", "dA", "A", 0, vec![0.5, 0.5])],
        )
        .await
        .unwrap();
        repo.save_document_with_chunks(
            doc("dB", "B"),
            vec![chunk("cB", "dB", "B", 0, vec![0.5, 0.5])],
        )
        .await
        .unwrap();

        let results = repo.find_similar_chunks("A", &[0.5, 0.5], 5).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.workspace_id, "A");
    }

    #[tokio::test]
    async fn transition_document_status_cas_rejects_wrong_from_state() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path().join("repo.wal")).await.unwrap();
        repo.save_document(doc("d1", "ws1")).await.unwrap();

        let transitioned = repo
            .transition_document_status(
                "d1",
                &[DocumentStatus::Processing],
                DocumentStatus::Ready,
                None,
            )
            .await
            .unwrap();
        assert!(!transitioned);

        let document = repo.get_document("d1").await.unwrap();
        assert_eq!(document.status, DocumentStatus::Pending);
    }

    #[tokio::test]
    async fn transition_document_status_cas_allows_matching_from_state() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path().join("repo.wal")).await.unwrap();
        repo.save_document(doc("d1", "ws1")).await.unwrap();

        let transitioned = repo
            .transition_document_status(
                "d1",
                &[DocumentStatus::Pending],
                DocumentStatus::Processing,
                None,
            )
            .await
            .unwrap();
        assert!(transitioned);
        assert_eq!(
            repo.get_document("d1").await.unwrap().status,
            DocumentStatus::Processing
        );
    }

    #[tokio::test]
    async fn replays_state_from_wal_after_reopen() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("repo.wal");

        {
            let repo = Repository::open(&wal_path).await.unwrap();
            repo.save_document_with_chunks(
                doc("d1", "ws1"),
                vec![chunk("c1", "d1", "ws1", 0, vec![1.0])],
            )
            .await
            .unwrap();
        }

        let repo = Repository::open(&wal_path).await.unwrap();
        assert!(repo.get_document("d1").await.is_some());
        assert_eq!(repo.chunks_for_document("d1").await.len(), 1);
    }

    #[tokio::test]
    async fn try_set_syncing_serializes_per_source() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path().join("repo.wal")).await.unwrap();
        repo.put_connector_source(ConnectorSource {
            id: "src1".into(),
            workspace_id: "ws1".into(),
            provider: alayasiki_core::model::ConnectorProvider::GoogleDrive,
            folder_id: "folder1".into(),
            status: ConnectorSourceStatus::Active,
            cursor_json: None,
            created_at: 0,
            updated_at: 0,
        })
        .await
        .unwrap();

        assert!(repo.try_set_syncing("src1").await.unwrap());
        assert!(!repo.try_set_syncing("src1").await.unwrap());
    }

    #[tokio::test]
    async fn load_snapshot_view_reconstructs_historical_state() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path().join("repo.wal")).await.unwrap();

        repo.save_document_with_chunks(
            doc("d1", "ws1"),
            vec![chunk("c1", "d1", "ws1", 0, vec![1.0])],
        )
        .await
        .unwrap();
        let snapshot_at_1 = repo.current_snapshot_id().await;

        repo.delete_document("d1").await.unwrap();

        let view = repo.load_snapshot_view(&snapshot_at_1).await.unwrap();
        assert!(view.get_document("d1").is_some());
        assert_eq!(view.chunks_for_document("d1").len(), 1);
    }

    #[tokio::test]
    async fn backup_and_restore_round_trips_state() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("repo.wal");
        let snapshot_dir = dir.path().join("snapshots");

        let repo = Repository::open_with_snapshots(&wal_path, &snapshot_dir)
            .await
            .unwrap();
        repo.save_document_with_chunks(
            doc("d1", "ws1"),
            vec![chunk("c1", "d1", "ws1", 0, vec![1.0])],
        )
        .await
        .unwrap();
        repo.create_backup_snapshot().await.unwrap();
        repo.delete_document("d1").await.unwrap();

        let restored = repo.restore_from_latest_backup().await.unwrap();
        assert!(restored.starts_with("wal-lsn-"));
        assert!(repo.get_document("d1").await.is_some());
    }
}
