pub mod ask;
pub mod context;
pub mod dsl;
pub mod fusion;
pub mod retrieval;
pub mod semantic_cache;

pub use ask::{AskError, AskMetadata, AskOrchestrator, AskResult, EmbeddingClient, LlmClient};
pub use dsl::AskInput;
