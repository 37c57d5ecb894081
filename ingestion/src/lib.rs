pub mod api;
pub mod chunker;
pub mod embedding;
pub mod extract;
pub mod injection;
pub mod processor;
pub mod sync;

pub use chunker::{Chunker, ChunkingConfig, SemanticChunker};
pub use embedding::{DeterministicEmbedder, Embedder};
pub use extract::{ContentKind, ExtractError, ExtractedText, ParserRegistry};
pub use injection::{ApplyOutcome, InjectionFilter};
pub use processor::{IngestionError, IngestionPipeline};
