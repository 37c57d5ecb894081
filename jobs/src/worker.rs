use crate::queue::Job;
use ingestion::processor::{IngestionPipeline, ProcessOutcome};
use slm::registry::ModelRegistry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Consumes `Job`s and dispatches `ProcessDocument` to the ingestion
/// pipeline (spec.md §6: "both paths call the same function" per
/// SPEC_FULL.md §G). `ExtractEntities` is a secondary, best-effort
/// enrichment stage fed by the lightweight model registry.
pub struct Worker {
    receiver: mpsc::Receiver<Job>,
    pipeline: Arc<IngestionPipeline>,
    registry: Arc<ModelRegistry>,
    default_model_ref: String,
}

impl Worker {
    pub fn new(receiver: mpsc::Receiver<Job>, pipeline: Arc<IngestionPipeline>) -> Self {
        Self {
            receiver,
            pipeline,
            registry: Arc::new(ModelRegistry::new()),
            default_model_ref: String::new(),
        }
    }

    pub fn with_registry(
        receiver: mpsc::Receiver<Job>,
        pipeline: Arc<IngestionPipeline>,
        registry: Arc<ModelRegistry>,
        default_model_ref: impl Into<String>,
    ) -> Self {
        Self {
            receiver,
            pipeline,
            registry,
            default_model_ref: default_model_ref.into(),
        }
    }

    pub async fn run(mut self) {
        info!("worker started");
        while let Some(job) = self.receiver.recv().await {
            match job {
                Job::ProcessDocument {
                    document_id,
                    workspace_id,
                } => {
                    info!(document_id = %document_id, workspace_id = %workspace_id, "processing document");
                    match self.pipeline.process(&document_id, &workspace_id).await {
                        Ok(ProcessOutcome::Processed) => {
                            info!(document_id = %document_id, "document processed")
                        }
                        Ok(outcome) => {
                            info!(document_id = %document_id, outcome = ?outcome, "document process short-circuited")
                        }
                        Err(err) => {
                            error!(document_id = %document_id, error = %err, "document processing failed")
                        }
                    }
                }
                Job::ExtractEntities {
                    document_id,
                    chunk_index,
                    content,
                    model_ref,
                } => {
                    if let Err(err) = self
                        .process_extraction(&document_id, chunk_index, &content, &model_ref)
                        .await
                    {
                        warn!(document_id = %document_id, chunk_index, error = %err, "entity extraction failed");
                    }
                }
            }
        }
        info!("worker stopped");
    }

    async fn process_extraction(
        &self,
        document_id: &str,
        chunk_index: u32,
        content: &str,
        model_ref: &str,
    ) -> anyhow::Result<()> {
        let resolved = self
            .registry
            .resolve(model_ref)
            .or_else(|_| self.registry.resolve(&self.default_model_ref))?;
        let entities = resolved.extractor.extract(content).await?;
        for entity in &entities {
            info!(
                document_id = %document_id,
                chunk_index,
                model = %format!("{}@{}", resolved.model_id, resolved.version),
                entity = %entity.text,
                label = %entity.label,
                confidence = entity.confidence,
                "entity extracted"
            );
        }
        Ok(())
    }
}
