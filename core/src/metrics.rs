use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Per-stage latency histograms for a single Ask pipeline run (spec.md
/// §4.8 step 13's metadata fields), plus the named counters referenced
/// throughout §4 (`retrieval_fallback`, `policy_refusal`,
/// `answer_without_sources_total`, `prompt_injection_detected_total`,
/// `sync_locked`).
#[derive(Debug, Clone, Default)]
pub struct AskMetrics {
    embed_ms: VecDeque<u64>,
    retrieve_ms: VecDeque<u64>,
    dense_ms: VecDeque<u64>,
    sparse_ms: VecDeque<u64>,
    fusion_ms: VecDeque<u64>,
    rerank_ms: VecDeque<u64>,
    llm_ms: VecDeque<u64>,
    total_ms: VecDeque<u64>,
    retrieval_fallback: HashMap<String, u64>,
    policy_refusal: HashMap<String, u64>,
    answer_without_sources_total: u64,
    prompt_injection_detected_total: HashMap<String, u64>,
    sync_locked: u64,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct AskMetricsSnapshot {
    pub embed_ms_p50: u64,
    pub retrieve_ms_p50: u64,
    pub dense_ms_p50: u64,
    pub sparse_ms_p50: u64,
    pub fusion_ms_p50: u64,
    pub rerank_ms_p50: u64,
    pub llm_ms_p50: u64,
    pub total_ms_p50: u64,
    pub retrieval_fallback: HashMap<String, u64>,
    pub policy_refusal: HashMap<String, u64>,
    pub answer_without_sources_total: u64,
    pub prompt_injection_detected_total: HashMap<String, u64>,
    pub sync_locked: u64,
}

#[derive(Debug, Clone, Default)]
pub struct QueryMetrics {
    pub total_queries: u64,
    pub cache_hits: u64,
    pub latencies: VecDeque<u64>, // microseconds
}

#[derive(Debug, Clone, Default)]
pub struct SlmMetrics {
    pub total_extractions: u64,
    pub total_confidence: f32,
    pub gpu_vram_usage_mb: u64,
}

pub struct MetricsCollector {
    state: Arc<Mutex<MetricsState>>,
}

struct MetricsState {
    query_metrics: QueryMetrics,
    slm_metrics: SlmMetrics,
    ask_metrics: AskMetrics,
    max_history: usize,
}

impl MetricsCollector {
    pub fn new(max_history: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MetricsState {
                query_metrics: QueryMetrics::default(),
                slm_metrics: SlmMetrics::default(),
                ask_metrics: AskMetrics::default(),
                max_history,
            })),
        }
    }

    /// Per-stage Ask pipeline timings (spec.md §4.8 step 13).
    #[allow(clippy::too_many_arguments)]
    pub fn record_ask_stages(
        &self,
        embed_ms: u64,
        retrieve_ms: u64,
        dense_ms: u64,
        sparse_ms: u64,
        fusion_ms: u64,
        rerank_ms: u64,
        llm_ms: u64,
        total_ms: u64,
    ) {
        let mut state = self.state.lock().unwrap();
        let max_history = state.max_history;
        let ask = &mut state.ask_metrics;
        for (deque, value) in [
            (&mut ask.embed_ms, embed_ms),
            (&mut ask.retrieve_ms, retrieve_ms),
            (&mut ask.dense_ms, dense_ms),
            (&mut ask.sparse_ms, sparse_ms),
            (&mut ask.fusion_ms, fusion_ms),
            (&mut ask.rerank_ms, rerank_ms),
            (&mut ask.llm_ms, llm_ms),
            (&mut ask.total_ms, total_ms),
        ] {
            deque.push_back(value);
            if deque.len() > max_history {
                deque.pop_front();
            }
        }
    }

    pub fn record_retrieval_fallback(&self, kind: &str) {
        *self
            .state
            .lock()
            .unwrap()
            .ask_metrics
            .retrieval_fallback
            .entry(kind.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_policy_refusal(&self, reason: &str) {
        *self
            .state
            .lock()
            .unwrap()
            .ask_metrics
            .policy_refusal
            .entry(reason.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_answer_without_sources(&self) {
        self.state.lock().unwrap().ask_metrics.answer_without_sources_total += 1;
    }

    pub fn record_prompt_injection_detected(&self, pattern: &str) {
        *self
            .state
            .lock()
            .unwrap()
            .ask_metrics
            .prompt_injection_detected_total
            .entry(pattern.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_sync_locked(&self) {
        self.state.lock().unwrap().ask_metrics.sync_locked += 1;
    }

    pub fn ask_snapshot(&self) -> AskMetricsSnapshot {
        let state = self.state.lock().unwrap();
        let ask = &state.ask_metrics;
        let p50 = |deque: &VecDeque<u64>| -> u64 {
            let mut sorted: Vec<u64> = deque.iter().copied().collect();
            sorted.sort_unstable();
            percentile(&sorted, 50.0)
        };
        AskMetricsSnapshot {
            embed_ms_p50: p50(&ask.embed_ms),
            retrieve_ms_p50: p50(&ask.retrieve_ms),
            dense_ms_p50: p50(&ask.dense_ms),
            sparse_ms_p50: p50(&ask.sparse_ms),
            fusion_ms_p50: p50(&ask.fusion_ms),
            rerank_ms_p50: p50(&ask.rerank_ms),
            llm_ms_p50: p50(&ask.llm_ms),
            total_ms_p50: p50(&ask.total_ms),
            retrieval_fallback: ask.retrieval_fallback.clone(),
            policy_refusal: ask.policy_refusal.clone(),
            answer_without_sources_total: ask.answer_without_sources_total,
            prompt_injection_detected_total: ask.prompt_injection_detected_total.clone(),
            sync_locked: ask.sync_locked,
        }
    }

    pub fn record_query(&self, latency_us: u64, is_cache_hit: bool) {
        let mut state = self.state.lock().unwrap();
        state.query_metrics.total_queries += 1;
        if is_cache_hit {
            state.query_metrics.cache_hits += 1;
        }
        state.query_metrics.latencies.push_back(latency_us);
        if state.query_metrics.latencies.len() > state.max_history {
            state.query_metrics.latencies.pop_front();
        }
    }

    pub fn query_snapshot(&self) -> QueryMetrics {
        self.state.lock().unwrap().query_metrics.clone()
    }

    pub fn record_slm_extraction(&self, avg_confidence: f32) {
        let mut state = self.state.lock().unwrap();
        state.slm_metrics.total_extractions += 1;
        state.slm_metrics.total_confidence += avg_confidence;
    }

    pub fn set_gpu_usage(&self, vram_mb: u64) {
        let mut state = self.state.lock().unwrap();
        state.slm_metrics.gpu_vram_usage_mb = vram_mb;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock().unwrap();
        let q = &state.query_metrics;
        let s = &state.slm_metrics;
        
        let mut sorted_latencies: Vec<u64> = q.latencies.iter().copied().collect();
        sorted_latencies.sort_unstable();

        let p50 = percentile(&sorted_latencies, 50.0);
        let p95 = percentile(&sorted_latencies, 95.0);
        let p99 = percentile(&sorted_latencies, 99.0);

        let hit_rate = if q.total_queries > 0 {
            q.cache_hits as f32 / q.total_queries as f32
        } else {
            0.0
        };

        let avg_extraction_confidence = if s.total_extractions > 0 {
            s.total_confidence / s.total_extractions as f32
        } else {
            0.0
        };

        MetricsSnapshot {
            total_queries: q.total_queries,
            hit_rate,
            p50,
            p95,
            p99,
            history_count: q.latencies.len(),
            avg_extraction_confidence,
            gpu_vram_usage_mb: s.gpu_vram_usage_mb,
        }
    }
}

fn percentile(sorted: &[u64], p: f32) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((p / 100.0) * (sorted.len() as f32)).ceil() as usize;
    sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub total_queries: u64,
    pub hit_rate: f32,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub history_count: usize,
    pub avg_extraction_confidence: f32,
    pub gpu_vram_usage_mb: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_ask_stage_latencies() {
        let collector = MetricsCollector::new(100);
        collector.record_ask_stages(10, 20, 5, 5, 1, 3, 200, 250);
        let snapshot = collector.ask_snapshot();
        assert_eq!(snapshot.embed_ms_p50, 10);
        assert_eq!(snapshot.llm_ms_p50, 200);
        assert_eq!(snapshot.total_ms_p50, 250);
    }

    #[test]
    fn counts_named_counters_by_label() {
        let collector = MetricsCollector::new(100);
        collector.record_retrieval_fallback("keyword_only");
        collector.record_retrieval_fallback("keyword_only");
        collector.record_policy_refusal("insufficient_evidence");
        collector.record_answer_without_sources();
        collector.record_prompt_injection_detected("ignore previous instructions");
        collector.record_sync_locked();

        let snapshot = collector.ask_snapshot();
        assert_eq!(snapshot.retrieval_fallback.get("keyword_only"), Some(&2));
        assert_eq!(
            snapshot.policy_refusal.get("insufficient_evidence"),
            Some(&1)
        );
        assert_eq!(snapshot.answer_without_sources_total, 1);
        assert_eq!(
            snapshot
                .prompt_injection_detected_total
                .get("ignore previous instructions"),
            Some(&1)
        );
        assert_eq!(snapshot.sync_locked, 1);
    }
}
