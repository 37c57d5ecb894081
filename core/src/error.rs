use serde::{Deserialize, Serialize};

/// Typed error taxonomy (kinds, not type names) per spec.md §7. The HTTP
/// layer outside this core maps these to RFC 7807 problem documents; this
/// crate never performs that mapping itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    ValidationError,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    UnsupportedMedia,
    PayloadTooLarge,
    RateLimited,
    InternalError,
    /// Carries the name of the unavailable external collaborator, e.g.
    /// `"EmbeddingService"`, `"ChunkStore"`, `"LLMService"`.
    ServiceUnavailable(String),
    LlmError,
    EmbeddingError,
    DatabaseError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::ValidationError => write!(f, "VALIDATION_ERROR"),
            ErrorCode::Unauthorized => write!(f, "UNAUTHORIZED"),
            ErrorCode::Forbidden => write!(f, "FORBIDDEN"),
            ErrorCode::NotFound => write!(f, "NOT_FOUND"),
            ErrorCode::Conflict => write!(f, "CONFLICT"),
            ErrorCode::UnsupportedMedia => write!(f, "UNSUPPORTED_MEDIA"),
            ErrorCode::PayloadTooLarge => write!(f, "PAYLOAD_TOO_LARGE"),
            ErrorCode::RateLimited => write!(f, "RATE_LIMITED"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
            ErrorCode::ServiceUnavailable(resource) => {
                write!(f, "SERVICE_UNAVAILABLE[{resource}]")
            }
            ErrorCode::LlmError => write!(f, "LLM_ERROR"),
            ErrorCode::EmbeddingError => write!(f, "EMBEDDING_ERROR"),
            ErrorCode::DatabaseError => write!(f, "DATABASE_ERROR"),
        }
    }
}

pub trait AlayasikiError: std::error::Error {
    fn error_code(&self) -> ErrorCode;
}
