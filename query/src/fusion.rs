use alayasiki_core::model::Chunk;
use std::collections::HashMap;

/// Reciprocal Rank Fusion constant (GLOSSARY: `score(d) = sum 1/(k+rank_i(d))`).
pub const RRF_K: f64 = 60.0;

fn fusion_key(chunk: &Chunk) -> String {
    if !chunk.id.is_empty() {
        chunk.id.clone()
    } else {
        format!("{}:{}", chunk.document_id, chunk.chunk_index)
    }
}

/// Fuses any number of independently-ranked result lists into one ordered
/// list (spec.md §4.3 step 3). Each ranker contributes `1/(RRF_K + rank)`
/// per chunk it returned, ranks are 1-indexed within that ranker's own
/// list, and a chunk present in more than one list accumulates scores
/// across all of them. Ties are broken by the position the chunk first
/// appears in (first-ranker order), which makes fusion both commutative in
/// score and deterministic in final ordering.
pub fn reciprocal_rank_fusion(rankings: &[Vec<Chunk>]) -> Vec<Chunk> {
    let mut scores: HashMap<String, f64> = HashMap::new();
    let mut first_seen: HashMap<String, (usize, Chunk)> = HashMap::new();
    let mut order_counter = 0usize;

    for ranking in rankings {
        for (idx, chunk) in ranking.iter().enumerate() {
            let rank = idx + 1;
            let key = fusion_key(chunk);
            *scores.entry(key.clone()).or_insert(0.0) += 1.0 / (RRF_K + rank as f64);
            first_seen.entry(key).or_insert_with(|| {
                let pos = order_counter;
                order_counter += 1;
                (pos, chunk.clone())
            });
        }
    }

    let mut fused: Vec<(String, f64)> = scores.into_iter().collect();
    fused.sort_by(|(key_a, score_a), (key_b, score_b)| {
        score_b
            .partial_cmp(score_a)
            .unwrap()
            .then_with(|| first_seen[key_a].0.cmp(&first_seen[key_b].0))
    });

    fused
        .into_iter()
        .map(|(key, _)| first_seen.remove(&key).unwrap().1)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str) -> Chunk {
        Chunk::new(id, "doc-1", "ws-1", 0, format!("content {id}"), vec![1.0])
    }

    #[test]
    fn chunk_ranked_first_in_every_list_wins() {
        let dense = vec![chunk("a"), chunk("b"), chunk("c")];
        let sparse = vec![chunk("a"), chunk("c"), chunk("b")];
        let fused = reciprocal_rank_fusion(&[dense, sparse]);
        assert_eq!(fused[0].id, "a");
    }

    #[test]
    fn fusion_is_commutative_in_input_order() {
        let dense = vec![chunk("a"), chunk("b"), chunk("c")];
        let sparse = vec![chunk("b"), chunk("c"), chunk("a")];
        let forward = reciprocal_rank_fusion(&[dense.clone(), sparse.clone()]);
        let reversed = reciprocal_rank_fusion(&[sparse, dense]);
        let forward_ids: Vec<_> = forward.iter().map(|c| c.id.clone()).collect();
        let reversed_ids: Vec<_> = reversed.iter().map(|c| c.id.clone()).collect();
        assert_eq!(forward_ids, reversed_ids);
    }

    #[test]
    fn chunk_present_only_in_one_list_still_included() {
        let dense = vec![chunk("a"), chunk("b")];
        let sparse = vec![chunk("c")];
        let fused = reciprocal_rank_fusion(&[dense, sparse]);
        assert_eq!(fused.len(), 3);
        assert!(fused.iter().any(|c| c.id == "c"));
    }

    #[test]
    fn single_ranking_preserves_its_order() {
        let dense = vec![chunk("a"), chunk("b"), chunk("c")];
        let fused = reciprocal_rank_fusion(&[dense]);
        let ids: Vec<_> = fused.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_rankings_produce_empty_result() {
        let fused = reciprocal_rank_fusion(&[]);
        assert!(fused.is_empty());
    }
}
