use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// An inbound document upload, before a `model::Document` row exists.
/// `ingestion::processor` consumes this to create the `PENDING` document and
/// enqueue the processing job (spec.md §4.6 step 1-2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    pub filename: String,
    pub content: Vec<u8>,
    pub mime_type: String,
    pub metadata: HashMap<String, String>,
    pub idempotency_key: Option<String>,
}

impl UploadRequest {
    pub fn new(filename: String, content: Vec<u8>, mime_type: String) -> Self {
        Self {
            filename,
            content,
            mime_type,
            metadata: HashMap::new(),
            idempotency_key: None,
        }
    }
}

pub trait ContentHash {
    fn content_hash(&self) -> String;
}

impl ContentHash for UploadRequest {
    fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.mime_type.as_bytes());
        hasher.update(self.filename.as_bytes());
        hasher.update(&self.content);
        format!("{:x}", hasher.finalize())
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
