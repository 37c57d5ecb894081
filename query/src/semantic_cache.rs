use crate::dsl::AskInput;
use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

const UNICODE_NGRAM_SIZE: usize = 2;

/// Eviction policy for cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Least Recently Used - evict the oldest accessed entry.
    #[default]
    Lru,
    /// Least Frequently Used - evict the least accessed entry.
    Lfu,
}

/// Configuration for semantic cache behavior.
#[derive(Debug, Clone)]
pub struct SemanticCacheConfig {
    /// Maximum number of entries to keep in cache.
    pub max_entries: usize,
    /// Minimum similarity score to consider a cache hit (0.0 - 1.0).
    pub similarity_threshold: f32,
    /// Time-to-live for cache entries. None means no expiration.
    pub ttl_seconds: Option<u64>,
    /// Minimum query length to be eligible for caching.
    pub min_query_length: usize,
    /// Whether the cache is enabled. If false, insert/lookup are no-ops.
    pub enabled: bool,
    /// Eviction policy when max_entries is reached.
    pub eviction_policy: EvictionPolicy,
}

impl Default for SemanticCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 256,
            similarity_threshold: 0.6,
            ttl_seconds: None,
            min_query_length: 3,
            enabled: true,
            eviction_policy: EvictionPolicy::Lru,
        }
    }
}

/// Cache entries are scoped by everything that changes what an `ask()` call
/// would return: the workspace (so one tenant's cache can never answer
/// another's query — Testable Property 1 extends to the cache layer), the
/// retrieval/rerank toggles (different settings can surface different
/// evidence for the same text), and the prompt version (a prompt rewrite
/// should not serve answers grounded in the old wording).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SemanticCacheKey {
    pub workspace_id: String,
    pub top_k: usize,
    pub use_mmr: bool,
    pub hybrid_enabled: bool,
    pub rerank_enabled: bool,
    pub prompt_version: String,
}

impl SemanticCacheKey {
    pub fn from_ask_input(input: &AskInput, top_k: usize, prompt_version: &str) -> Self {
        Self {
            workspace_id: input.workspace_id.clone(),
            top_k,
            use_mmr: input.use_mmr,
            hybrid_enabled: input.hybrid_enabled,
            rerank_enabled: input.rerank_enabled,
            prompt_version: prompt_version.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct SemanticCacheEntry<T> {
    key: SemanticCacheKey,
    normalized_query: String,
    query_tokens: HashSet<String>,
    value: T,
    created_at: Instant,
    access_count: usize,
    last_accessed: Instant,
}

#[derive(Debug, Clone)]
pub struct SemanticCache<T> {
    config: SemanticCacheConfig,
    entries: VecDeque<SemanticCacheEntry<T>>,
}

impl<T: Clone> SemanticCache<T> {
    pub fn with_config(config: SemanticCacheConfig) -> Self {
        Self {
            config,
            entries: VecDeque::new(),
        }
    }

    pub fn lookup(&mut self, key: &SemanticCacheKey, query: &str) -> Option<T> {
        if !self.config.enabled || self.entries.is_empty() {
            return None;
        }

        let normalized_query = normalize_query(query);
        let query_tokens = tokenize(&normalized_query);

        // Check min_query_length
        if query.len() < self.config.min_query_length {
            return None;
        }

        let mut best_match: Option<(usize, f32)> = None;

        for (idx, entry) in self.entries.iter().enumerate() {
            if &entry.key != key {
                continue;
            }

            // Check TTL expiration
            if let Some(ttl) = self.config.ttl_seconds {
                if entry.created_at.elapsed() > Duration::from_secs(ttl) {
                    continue;
                }
            }

            let score = query_similarity(
                &entry.normalized_query,
                &entry.query_tokens,
                &normalized_query,
                &query_tokens,
            );
            if score < self.config.similarity_threshold {
                continue;
            }

            let replace = best_match.is_none_or(|(best_idx, best_score)| {
                matches!(score.partial_cmp(&best_score), Some(Ordering::Greater))
                    || (matches!(score.partial_cmp(&best_score), Some(Ordering::Equal))
                        && idx > best_idx)
            });

            if replace {
                best_match = Some((idx, score));
            }
        }

        let (idx, _) = best_match?;
        let mut matched = self.entries.remove(idx)?;

        // Update access metadata
        matched.access_count = matched.access_count.saturating_add(1);
        matched.last_accessed = Instant::now();

        let value = matched.value.clone();
        self.entries.push_back(matched);
        Some(value)
    }

    pub fn insert(&mut self, key: SemanticCacheKey, query: &str, value: T) {
        if !self.config.enabled {
            return;
        }

        // Check min_query_length
        if query.len() < self.config.min_query_length {
            return;
        }

        if self.config.max_entries == 0 {
            return;
        }

        let normalized_query = normalize_query(query);
        let query_tokens = tokenize(&normalized_query);

        if let Some(existing_idx) = self
            .entries
            .iter()
            .position(|entry| entry.key == key && entry.normalized_query == normalized_query)
        {
            self.entries.remove(existing_idx);
        }

        // Evict if necessary based on eviction policy
        while self.entries.len() >= self.config.max_entries {
            self.evict_one();
        }

        let now = Instant::now();
        self.entries.push_back(SemanticCacheEntry {
            key,
            normalized_query,
            query_tokens,
            value,
            created_at: now,
            access_count: 0,
            last_accessed: now,
        });
    }

    fn evict_one(&mut self) {
        if self.entries.is_empty() {
            return;
        }

        let idx = match self.config.eviction_policy {
            EvictionPolicy::Lru => {
                // Find the entry with the oldest last_accessed time
                self.entries
                    .iter()
                    .enumerate()
                    .min_by(|(_, a), (_, b)| a.last_accessed.cmp(&b.last_accessed))
                    .map(|(idx, _)| idx)
                    .unwrap_or(0)
            }
            EvictionPolicy::Lfu => {
                // Find the entry with the lowest access_count
                self.entries
                    .iter()
                    .enumerate()
                    .min_by(|(_, a), (_, b)| a.access_count.cmp(&b.access_count))
                    .map(|(idx, _)| idx)
                    .unwrap_or(0)
            }
        };

        self.entries.remove(idx);
    }
}

fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn query_similarity(
    lhs_query: &str,
    lhs_tokens: &HashSet<String>,
    rhs_query: &str,
    rhs_tokens: &HashSet<String>,
) -> f32 {
    if lhs_query == rhs_query {
        return 1.0;
    }
    if lhs_tokens.is_empty() || rhs_tokens.is_empty() {
        return 0.0;
    }

    let intersection = lhs_tokens.intersection(rhs_tokens).count();
    let union = lhs_tokens.len() + rhs_tokens.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f32 / union as f32
}

fn tokenize(text: &str) -> HashSet<String> {
    let mut out = HashSet::new();
    let mut buffer = String::new();

    for ch in text.chars().flat_map(|ch| ch.to_lowercase()) {
        if ch.is_alphanumeric() || ch == '_' {
            buffer.push(ch);
        } else if !buffer.is_empty() {
            out.insert(buffer.clone());
            buffer.clear();
        }
    }

    if !buffer.is_empty() {
        out.insert(buffer);
    }

    let unicode_tokens: Vec<String> = out
        .iter()
        .filter(|token| !token.is_ascii())
        .cloned()
        .collect();
    for token in unicode_tokens {
        for ngram in char_ngrams(&token, UNICODE_NGRAM_SIZE) {
            out.insert(ngram);
        }
    }

    out
}

fn char_ngrams(token: &str, n: usize) -> Vec<String> {
    let chars: Vec<char> = token.chars().collect();
    if chars.is_empty() || n == 0 {
        return Vec::new();
    }
    if chars.len() <= n {
        return vec![token.to_string()];
    }

    chars
        .windows(n)
        .map(|window| window.iter().collect::<String>())
        .collect()
}
