//! Context retrieval: embed the query, nearest-neighbor search the index,
//! filter by similarity. Sits on the classification critical path, so the
//! whole lookup runs under a hard timeout and degrades to "no context" rather
//! than failing the item.

mod http_embedder;
mod memory_index;

pub use http_embedder::HttpEmbedder;
pub use memory_index::MemoryIndex;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    error::AppResult,
    model::ContextChunk,
    resilience::CircuitBreaker,
    server_config::cfg,
};

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> AppResult<Vec<f32>>;
}

#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: ContextChunk,
    pub similarity: f32,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Top-k nearest chunks, ordered by descending similarity.
    async fn search(&self, vector: &[f32], k: usize) -> AppResult<Vec<ScoredChunk>>;

    /// Append-only from the hot path: safe for concurrent readers.
    async fn insert(&self, chunk: ContextChunk) -> AppResult<()>;
}

#[derive(Clone)]
pub struct ContextRetriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    breaker: CircuitBreaker,
    top_k: usize,
    min_similarity: f32,
    timeout: Duration,
}

impl ContextRetriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        breaker: CircuitBreaker,
        top_k: usize,
        min_similarity: f32,
        timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            index,
            breaker,
            top_k,
            min_similarity,
            timeout,
        }
    }

    pub fn from_config(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        breaker: CircuitBreaker,
    ) -> Self {
        Self::new(
            embedder,
            index,
            breaker,
            cfg.retrieval.top_k,
            cfg.retrieval.min_similarity,
            Duration::from_millis(cfg.retrieval.timeout_ms),
        )
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Fetch the most relevant historical chunks for one query. Absence of
    /// context is a valid outcome: timeouts and embedding failures log a
    /// warning and return an empty set instead of failing the item.
    pub async fn retrieve(&self, query: &str) -> Vec<ContextChunk> {
        match tokio::time::timeout(self.timeout, self.lookup(query)).await {
            Ok(Ok(chunks)) => chunks,
            Ok(Err(e)) => {
                tracing::warn!("Context retrieval failed, classifying without context: {e}");
                Vec::new()
            }
            Err(_) => {
                tracing::warn!(
                    "Context retrieval timed out after {:?}, classifying without context",
                    self.timeout
                );
                Vec::new()
            }
        }
    }

    async fn lookup(&self, query: &str) -> AppResult<Vec<ContextChunk>> {
        let embedder = self.embedder.clone();
        let query = query.to_string();
        let vector = self
            .breaker
            .call(|| {
                let embedder = embedder.clone();
                let query = query.clone();
                async move { embedder.embed(&query).await }
            })
            .await?;

        let scored = self.index.search(&vector, self.top_k).await?;
        Ok(scored
            .into_iter()
            .filter(|s| s.similarity >= self.min_similarity)
            .take(self.top_k)
            .map(|s| s.chunk)
            .collect())
    }

    /// Append one summary to the index, embedding it first. Used by the hot
    /// path after successful classification and by feedback incorporation.
    pub async fn remember(
        &self,
        chunk_id: &str,
        summary: &str,
        label: Option<&str>,
    ) -> AppResult<()> {
        let embedder = self.embedder.clone();
        let text = summary.to_string();
        let vector = self
            .breaker
            .call(|| {
                let embedder = embedder.clone();
                let text = text.clone();
                async move { embedder.embed(&text).await }
            })
            .await?;

        self.index
            .insert(ContextChunk::new(chunk_id, vector, summary, label))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::RetryPolicy;
    use crate::testing::common::ScriptedEmbedder;

    fn test_breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "embedding",
            5,
            Duration::from_secs(60),
            RetryPolicy {
                max_attempts: 1,
                backoff_base_ms: 1,
                backoff_max_ms: 2,
            },
        )
    }

    fn retriever_with(
        embedder: Arc<dyn Embedder>,
        index: Arc<MemoryIndex>,
        min_similarity: f32,
        timeout_ms: u64,
    ) -> ContextRetriever {
        ContextRetriever::new(
            embedder,
            index,
            test_breaker(),
            3,
            min_similarity,
            Duration::from_millis(timeout_ms),
        )
    }

    async fn seed(index: &MemoryIndex, id: &str, vector: Vec<f32>, label: &str) {
        index
            .insert(ContextChunk::new(id, vector, "summary", Some(label)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_retrieve_orders_by_similarity_and_filters() {
        let embedder = Arc::new(ScriptedEmbedder::fixed(vec![1.0, 0.0]));
        let index = Arc::new(MemoryIndex::new());
        seed(&index, "close", vec![0.9, 0.1], "academic.exams").await;
        seed(&index, "closer", vec![1.0, 0.05], "academic.exams").await;
        seed(&index, "far", vec![-1.0, 0.2], "spam.scam").await;

        let retriever = retriever_with(embedder, index, 0.6, 500);
        let chunks = retriever.retrieve("exam schedule").await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].id, "closer");
        assert_eq!(chunks[1].id, "close");
    }

    #[tokio::test]
    async fn test_empty_index_yields_empty_context() {
        let embedder = Arc::new(ScriptedEmbedder::fixed(vec![1.0, 0.0]));
        let retriever = retriever_with(embedder, Arc::new(MemoryIndex::new()), 0.6, 500);
        assert!(retriever.retrieve("anything").await.is_empty());
    }

    #[tokio::test]
    async fn test_nothing_above_threshold_is_not_an_error() {
        let embedder = Arc::new(ScriptedEmbedder::fixed(vec![1.0, 0.0]));
        let index = Arc::new(MemoryIndex::new());
        seed(&index, "orthogonal", vec![0.0, 1.0], "spam.scam").await;

        let retriever = retriever_with(embedder, index, 0.6, 500);
        assert!(retriever.retrieve("query").await.is_empty());
    }

    #[tokio::test]
    async fn test_slow_embedding_times_out_to_no_context() {
        let embedder = Arc::new(ScriptedEmbedder::slow(vec![1.0, 0.0], 200));
        let index = Arc::new(MemoryIndex::new());
        seed(&index, "c1", vec![1.0, 0.0], "academic.exams").await;

        let retriever = retriever_with(embedder, index, 0.6, 20);
        assert!(retriever.retrieve("query").await.is_empty());
    }

    #[tokio::test]
    async fn test_remember_appends_to_index() {
        let embedder = Arc::new(ScriptedEmbedder::fixed(vec![1.0, 0.0]));
        let index = Arc::new(MemoryIndex::new());
        let retriever = retriever_with(embedder, index.clone(), 0.1, 500);

        retriever
            .remember("c1", "Scholarship deadline Friday", Some("finance.aid"))
            .await
            .unwrap();

        let chunks = retriever.retrieve("scholarship").await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].label_association.as_deref(), Some("finance.aid"));
    }
}
