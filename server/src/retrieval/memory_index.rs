//! Brute-force cosine index over in-memory chunks. Good enough for the corpus
//! sizes one mailbox produces; bulk re-indexing stays a background concern.

use std::sync::RwLock;

use async_trait::async_trait;

use crate::{error::AppResult, model::ContextChunk};

use super::{ScoredChunk, VectorIndex};

#[derive(Default)]
pub struct MemoryIndex {
    chunks: RwLock<Vec<ContextChunk>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chunks.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.read().unwrap().is_empty()
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn search(&self, vector: &[f32], k: usize) -> AppResult<Vec<ScoredChunk>> {
        let chunks = self.chunks.read().unwrap();
        let mut scored: Vec<ScoredChunk> = chunks
            .iter()
            .map(|chunk| ScoredChunk {
                similarity: cosine_similarity(vector, &chunk.embedding),
                chunk: chunk.clone(),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn insert(&self, chunk: ContextChunk) -> AppResult<()> {
        self.chunks.write().unwrap().push(chunk);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        // Mismatched or zero vectors score zero instead of NaN.
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_search_returns_top_k_descending() {
        let index = MemoryIndex::new();
        for (id, v) in [
            ("a", vec![1.0, 0.0]),
            ("b", vec![0.7, 0.7]),
            ("c", vec![0.0, 1.0]),
        ] {
            index
                .insert(ContextChunk::new(id, v, "summary", None))
                .await
                .unwrap();
        }

        let results = index.search(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.id, "a");
        assert_eq!(results[1].chunk.id, "b");
        assert!(results[0].similarity >= results[1].similarity);
    }
}
