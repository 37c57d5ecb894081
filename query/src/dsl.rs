use alayasiki_core::model::Actor;

/// Default `top_k` when a caller doesn't set one (spec.md §4.8).
pub const DEFAULT_TOP_K: i64 = 5;
/// `top_k` above this is silently clamped, never rejected (spec.md §7:
/// "oversized top_k silently clamped").
pub const MAX_TOP_K: usize = 50;

/// Input to the ask orchestrator (spec.md §4.8). `top_k` is signed so a
/// caller-supplied `<= 0` can be distinguished from "not set" and routed to
/// the zero-evidence fallback rather than panicking on an unsigned
/// underflow.
#[derive(Debug, Clone)]
pub struct AskInput {
    pub query: String,
    pub workspace_id: String,
    pub actor: Option<Actor>,
    /// Overrides `query` for the LLM call only; citations and retrieval
    /// still key off `query`.
    pub llm_query: Option<String>,
    pub top_k: i64,
    pub use_mmr: bool,
    pub hybrid_enabled: bool,
    pub rerank_enabled: bool,
}

impl AskInput {
    pub fn new(query: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            workspace_id: workspace_id.into(),
            actor: None,
            llm_query: None,
            top_k: DEFAULT_TOP_K,
            use_mmr: false,
            hybrid_enabled: true,
            rerank_enabled: false,
        }
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn with_top_k(mut self, top_k: i64) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_mmr(mut self, use_mmr: bool) -> Self {
        self.use_mmr = use_mmr;
        self
    }

    pub fn with_hybrid(mut self, hybrid_enabled: bool) -> Self {
        self.hybrid_enabled = hybrid_enabled;
        self
    }

    pub fn with_rerank(mut self, rerank_enabled: bool) -> Self {
        self.rerank_enabled = rerank_enabled;
        self
    }

    pub fn with_llm_query(mut self, llm_query: impl Into<String>) -> Self {
        self.llm_query = Some(llm_query.into());
        self
    }
}

/// `None` means the caller's `top_k` was non-positive and the orchestrator
/// must short-circuit to the zero-evidence fallback (spec.md §4.8 step 3).
pub fn sanitize_top_k(top_k: i64) -> Option<usize> {
    if top_k <= 0 {
        return None;
    }
    Some((top_k as usize).min(MAX_TOP_K))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_or_negative_top_k_has_no_sanitized_value() {
        assert_eq!(sanitize_top_k(0), None);
        assert_eq!(sanitize_top_k(-3), None);
    }

    #[test]
    fn oversized_top_k_is_clamped_not_rejected() {
        assert_eq!(sanitize_top_k(1_000), Some(MAX_TOP_K));
    }

    #[test]
    fn in_range_top_k_passes_through() {
        assert_eq!(sanitize_top_k(5), Some(5));
    }

    #[test]
    fn builder_defaults_match_spec() {
        let input = AskInput::new("what is the refund policy", "ws1");
        assert_eq!(input.top_k, DEFAULT_TOP_K);
        assert!(!input.use_mmr);
        assert!(input.hybrid_enabled);
        assert!(!input.rerank_enabled);
    }
}
