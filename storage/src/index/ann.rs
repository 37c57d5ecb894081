use std::collections::HashMap;

/// Brute-force cosine-similarity ANN index (placeholder for HNSW/IVF),
/// keyed by chunk id.
pub struct LinearAnnIndex {
    embeddings: HashMap<String, Vec<f32>>,
}

impl LinearAnnIndex {
    pub fn new() -> Self {
        Self {
            embeddings: HashMap::new(),
        }
    }

    pub fn insert(&mut self, id: impl Into<String>, embedding: Vec<f32>) {
        self.embeddings.insert(id.into(), embedding);
    }

    pub fn delete(&mut self, id: &str) -> bool {
        self.embeddings.remove(id).is_some()
    }

    /// Find top-k nearest neighbors using cosine similarity.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(String, f32)> {
        let mut scores: Vec<(String, f32)> = self
            .embeddings
            .iter()
            .filter_map(|(id, emb)| cosine_similarity(query, emb).map(|score| (id.clone(), score)))
            .collect();

        scores.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scores.truncate(k);
        scores
    }

    /// Filters candidates by predicate before truncating to `k`, so workspace
    /// isolation can be enforced without scanning the whole result set.
    pub fn search_filtered<F>(&self, query: &[f32], k: usize, predicate: F) -> Vec<(String, f32)>
    where
        F: Fn(&str) -> bool,
    {
        let mut scores: Vec<(String, f32)> = self
            .embeddings
            .iter()
            .filter(|(id, _)| predicate(id))
            .filter_map(|(id, emb)| cosine_similarity(query, emb).map(|score| (id.clone(), score)))
            .collect();

        scores.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scores.truncate(k);
        scores
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}

impl Default for LinearAnnIndex {
    fn default() -> Self {
        Self::new()
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return Some(0.0);
    }

    Some(dot / (norm_a * norm_b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_ann_search() {
        let mut index = LinearAnnIndex::new();

        index.insert("1", vec![1.0, 0.0, 0.0]);
        index.insert("2", vec![0.0, 1.0, 0.0]);
        index.insert("3", vec![0.9, 0.1, 0.0]); // Similar to 1

        let results = index.search(&[1.0, 0.0, 0.0], 2);

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "1"); // Exact match first
        assert_eq!(results[1].0, "3"); // Similar second
    }

    #[test]
    fn test_linear_ann_delete() {
        let mut index = LinearAnnIndex::new();
        index.insert("1", vec![1.0, 0.0]);

        assert!(index.delete("1"));
        assert!(!index.delete("1")); // Already deleted
        assert!(index.is_empty());
    }

    #[test]
    fn test_search_filtered_enforces_predicate_before_truncation() {
        let mut index = LinearAnnIndex::new();
        index.insert("a", vec![1.0, 0.0]);
        index.insert("b", vec![1.0, 0.0]);

        let results = index.search_filtered(&[1.0, 0.0], 5, |id| id == "a");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "a");
    }
}
