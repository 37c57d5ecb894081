use async_trait::async_trait;
use text_splitter::TextSplitter;

/// `(chunk_size, overlap)` with `0 ≤ overlap < chunk_size` (spec.md §4.6
/// step d).
#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl ChunkingConfig {
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be positive");
        assert!(overlap < chunk_size, "overlap must be less than chunk_size");
        Self { chunk_size, overlap }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self::new(1000, 100)
    }
}

#[async_trait]
pub trait Chunker: Send + Sync {
    async fn chunk(&self, content: &str, config: &ChunkingConfig) -> Vec<String>;
}

/// `text_splitter`-backed chunker. `text_splitter` has no built-in overlap,
/// so overlap is realized by re-prepending the trailing `overlap` characters
/// of the previous chunk onto the next one.
pub struct SemanticChunker;

impl SemanticChunker {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SemanticChunker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Chunker for SemanticChunker {
    async fn chunk(&self, content: &str, config: &ChunkingConfig) -> Vec<String> {
        let splitter = TextSplitter::default().with_trim_chunks(true);
        let pieces: Vec<&str> = splitter.chunks(content, config.chunk_size).collect();

        if config.overlap == 0 {
            return pieces.into_iter().map(str::to_string).collect();
        }

        let mut out = Vec::with_capacity(pieces.len());
        let mut previous_tail = String::new();
        for piece in pieces {
            let mut with_overlap = previous_tail.clone();
            with_overlap.push_str(piece);
            previous_tail = tail_chars(piece, config.overlap);
            out.push(with_overlap);
        }
        out
    }
}

fn tail_chars(text: &str, n: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let start = chars.len().saturating_sub(n);
    chars[start..].iter().collect()
}
