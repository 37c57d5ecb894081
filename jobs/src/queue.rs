use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// The queue's job contract (spec.md §6): `ProcessDocument` is the real
/// document-processing job consumed by the worker pool. `ExtractEntities`
/// is the auxiliary keyword/entity enrichment job (SPEC_FULL.md §C.4) —
/// best-effort, never on the Ask critical path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Job {
    ProcessDocument {
        document_id: String,
        workspace_id: String,
    },
    ExtractEntities {
        document_id: String,
        chunk_index: u32,
        content: String,
        model_ref: String,
    },
}

#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> anyhow::Result<()>;
}

/// Simple in-memory queue using Tokio channels.
pub struct ChannelJobQueue {
    sender: mpsc::Sender<Job>,
}

impl ChannelJobQueue {
    pub fn new(sender: mpsc::Sender<Job>) -> Self {
        Self { sender }
    }
}

#[async_trait::async_trait]
impl JobQueue for ChannelJobQueue {
    async fn enqueue(&self, job: Job) -> anyhow::Result<()> {
        self.sender
            .send(job)
            .await
            .map_err(|e| anyhow::anyhow!("queue send error: {}", e))
    }
}
