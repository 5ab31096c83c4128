//! Retrieval: embedder + vector index behind a single call
//!
//! Applies the configured score floor; an empty result is not an error and
//! signals downstream fallback.

use crate::config::RetrievalConfig;
use crate::error::Result;
use crate::index::{ScoredChunk, VectorIndex};
use crate::model::Embedder;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Ordered retrieval result; scores are non-increasing and all at or above
/// the score floor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub hits: Vec<ScoredChunk>,
}

impl RetrievalResult {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }
}

/// Combines the embedder and vector index into one retrieval call
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            config,
        }
    }

    /// Retrieve the top-K passages for a query, dropping hits below the
    /// score floor
    pub async fn retrieve(
        &self,
        query_text: &str,
        k: usize,
        document_filter: Option<&str>,
    ) -> Result<RetrievalResult> {
        let query_vector = self.embedder.embed(query_text).await?;
        let mut hits = self
            .index
            .search(&query_vector, k, document_filter)
            .await?;

        let before = hits.len();
        hits.retain(|hit| hit.similarity >= self.config.score_floor);

        debug!(
            kept = hits.len(),
            dropped = before - hits.len(),
            floor = self.config.score_floor,
            "retrieval complete"
        );

        Ok(RetrievalResult { hits })
    }

    /// Retrieve with the configured default top-K
    pub async fn retrieve_default(
        &self,
        query_text: &str,
        document_filter: Option<&str>,
    ) -> Result<RetrievalResult> {
        self.retrieve(query_text, self.config.top_k, document_filter)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::Chunk;
    use crate::index::SqliteVectorIndex;
    use crate::model::normalize_l2;
    use crate::query;
    use async_trait::async_trait;

    struct AxisEmbedder;

    #[async_trait]
    impl Embedder for AxisEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            // Deterministic toy embedding: one axis per known word
            let mut v = vec![0.0f32; 4];
            for word in text.to_lowercase().split_whitespace() {
                match word {
                    "alpha" => v[0] += 1.0,
                    "beta" => v[1] += 1.0,
                    "gamma" => v[2] += 1.0,
                    _ => v[3] += 1.0,
                }
            }
            normalize_l2(&mut v);
            Ok(v)
        }

        fn dimension(&self) -> usize {
            4
        }

        fn version_tag(&self) -> String {
            "axis-v1".to_string()
        }
    }

    fn chunk(ordinal: u32, text: &str) -> Chunk {
        Chunk {
            ordinal,
            text: text.to_string(),
            char_start: 0,
            char_end: text.chars().count(),
            token_count: text.split_whitespace().count(),
            content_hash: query::fingerprint(text),
        }
    }

    async fn seeded_retriever(floor: f32) -> Retriever {
        let embedder = Arc::new(AxisEmbedder);
        let index = Arc::new(SqliteVectorIndex::in_memory(4).await.unwrap());

        for (i, text) in ["alpha alpha", "beta beta", "gamma gamma"].iter().enumerate() {
            let v = embedder.embed(text).await.unwrap();
            index.add("doc", &chunk(i as u32, text), &v).await.unwrap();
        }

        Retriever::new(
            embedder,
            index,
            RetrievalConfig {
                top_k: 10,
                score_floor: floor,
            },
        )
    }

    #[tokio::test]
    async fn test_retrieve_sorted_and_floored() {
        let retriever = seeded_retriever(0.6).await;
        let result = retriever.retrieve_default("alpha", Some("doc")).await.unwrap();

        assert!(!result.is_empty());
        assert_eq!(result.hits[0].text, "alpha alpha");
        for pair in result.hits.windows(2) {
            assert!(pair[0].similarity >= pair[1].similarity);
        }
        for hit in &result.hits {
            assert!(hit.similarity >= 0.6);
        }
    }

    #[tokio::test]
    async fn test_empty_result_permitted() {
        // A floor above the maximum mapped similarity drops everything
        let retriever = seeded_retriever(1.1).await;
        let result = retriever.retrieve_default("alpha", Some("doc")).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_k_truncates() {
        let retriever = seeded_retriever(0.0).await;
        let result = retriever.retrieve("alpha", 2, Some("doc")).await.unwrap();
        assert_eq!(result.len(), 2);
    }
}
