use alayasiki_core::config::InjectionFilterMode;
use alayasiki_core::model::{Chunk, ChunkSecurityMetadata};

/// Fixed phrase catalog with per-pattern weight contributions to
/// `risk_score` (spec.md §4.5, Open Question resolved in SPEC_FULL.md §G).
/// Cardinality is bounded by this catalog, so the `prompt_injection_detected`
/// counter (labeled by pattern slug) never grows unbounded.
const PATTERN_CATALOG: &[(&str, &str, f32)] = &[
    ("ignore previous instructions", "ignore_previous_instructions", 0.9),
    ("ignore all previous instructions", "ignore_all_previous_instructions", 0.9),
    ("disregard prior instructions", "disregard_prior_instructions", 0.8),
    ("reveal system prompt", "reveal_system_prompt", 0.85),
    ("reveal the system prompt", "reveal_the_system_prompt", 0.85),
    ("you are now", "you_are_now", 0.5),
    ("new instructions", "new_instructions", 0.5),
    ("tool override", "tool_override", 0.7),
    ("bypass", "bypass", 0.4),
    ("jailbreak", "jailbreak", 0.6),
];

/// Scans `content` for every catalog phrase and returns the clamped risk
/// score plus the matched phrases and their metric slugs.
pub fn detect(content: &str) -> (f32, Vec<String>, Vec<&'static str>) {
    let lowered = content.to_lowercase();
    let mut score = 0.0_f32;
    let mut patterns = Vec::new();
    let mut slugs = Vec::new();

    for (phrase, slug, weight) in PATTERN_CATALOG {
        if lowered.contains(phrase) {
            score += weight;
            patterns.push((*phrase).to_string());
            slugs.push(*slug);
        }
    }

    (score.min(1.0), patterns, slugs)
}

pub struct InjectionFilter {
    pub mode: InjectionFilterMode,
    pub risk_threshold: f32,
}

impl InjectionFilter {
    pub fn new(mode: InjectionFilterMode, risk_threshold: f32) -> Self {
        Self { mode, risk_threshold }
    }
}

impl Default for InjectionFilter {
    fn default() -> Self {
        Self::new(InjectionFilterMode::Downrank, 0.6)
    }
}

/// Every detected pattern slug across the batch, for the caller to feed into
/// `core::metrics::MetricsCollector::record_prompt_injection_detected`.
pub struct ApplyOutcome {
    pub chunks: Vec<Chunk>,
    pub detected_pattern_slugs: Vec<&'static str>,
}

impl InjectionFilter {
    /// Annotates every chunk with `{security_flags, risk_score,
    /// detected_patterns}` and applies mode-specific reordering/exclusion.
    /// Used both at ingestion time (spec.md §4.6 step f) and again inline in
    /// the Ask pipeline (§4.8 step 7).
    pub fn apply(&self, chunks: Vec<Chunk>) -> ApplyOutcome {
        let mut detected_pattern_slugs = Vec::new();
        let mut annotated: Vec<Chunk> = chunks
            .into_iter()
            .map(|mut chunk| {
                let (risk_score, detected_patterns, slugs) = detect(&chunk.content);
                detected_pattern_slugs.extend(slugs);
                let security_flags = if risk_score >= self.risk_threshold {
                    vec!["prompt_injection_suspected".to_string()]
                } else {
                    Vec::new()
                };
                chunk.security = ChunkSecurityMetadata {
                    security_flags,
                    risk_score,
                    detected_patterns,
                };
                chunk
            })
            .collect();

        match self.mode {
            InjectionFilterMode::Off => {}
            InjectionFilterMode::Downrank => {
                annotated.sort_by_key(|chunk| chunk.security.risk_score >= self.risk_threshold);
            }
            InjectionFilterMode::Exclude => {
                annotated.retain(|chunk| chunk.security.risk_score < self.risk_threshold);
            }
        }

        ApplyOutcome {
            chunks: annotated,
            detected_pattern_slugs,
        }
    }
}
