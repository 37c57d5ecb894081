use alayasiki_core::ingest::{ContentHash, UploadRequest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Inbound multipart payload for `POST /v1/workspaces/{ws}/documents/upload`
/// (spec.md §6). Multipart decoding itself is out of scope (HTTP framing is
/// an external collaborator); this is what the handler hands off once the
/// file part has been read into memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultipartUploadPayload {
    pub filename: String,
    pub content: Vec<u8>,
    pub mime_type: String,
    pub metadata: HashMap<String, String>,
    pub idempotency_key: Option<String>,
}

impl MultipartUploadPayload {
    pub fn into_upload_request(self) -> UploadRequest {
        UploadRequest {
            filename: self.filename,
            content: self.content,
            mime_type: self.mime_type,
            metadata: self.metadata,
            idempotency_key: self.idempotency_key,
        }
    }
}

/// The content hash a `Document` created from this upload would carry,
/// ahead of any blob-store write (callers resolve idempotency by this hash).
pub fn upload_content_hash(request: &UploadRequest) -> String {
    request.content_hash()
}
