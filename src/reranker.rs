//! Cross-encoder reranking
//!
//! Second-pass scoring of (query, passage) pairs for precision at the top.
//! When the cross-encoder capability is missing or errors, the stage
//! degrades to a pass-through that preserves retrieval order; the
//! degradation is recorded so the orchestrator can surface it in response
//! metadata.

use crate::config::RerankConfig;
use crate::error::Result;
use crate::index::ScoredChunk;
use crate::model::CrossEncoder;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

/// A passage surviving the rerank stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankedPassage {
    pub hit: ScoredChunk,
    /// Cross-encoder score, or the retrieval score when degraded
    pub rerank_score: f32,
    /// Rank the passage held in the retrieval ordering
    pub retrieval_rank: usize,
}

/// Result of the rerank stage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RerankOutcome {
    pub passages: Vec<RerankedPassage>,
    /// True when the cross-encoder actually reordered the passages
    pub applied: bool,
}

/// Reranker over an optional cross-encoder capability
pub struct Reranker {
    cross_encoder: Option<Arc<dyn CrossEncoder>>,
    config: RerankConfig,
}

impl Reranker {
    pub fn new(cross_encoder: Option<Arc<dyn CrossEncoder>>, config: RerankConfig) -> Self {
        Self {
            cross_encoder,
            config,
        }
    }

    /// Rerank retrieved passages
    ///
    /// Truncates the input to `input_max`, scores each (query, passage)
    /// pair, drops passages below `min_score`, sorts by score with the
    /// original retrieval rank as tie-break, and keeps `top_k`.
    pub async fn rerank(&self, query: &str, hits: Vec<ScoredChunk>) -> Result<RerankOutcome> {
        let mut hits = hits;
        hits.truncate(self.config.input_max);

        if !self.config.enabled || hits.is_empty() {
            return Ok(self.pass_through(hits));
        }

        let Some(cross_encoder) = &self.cross_encoder else {
            debug!("cross-encoder unavailable, passing retrieval order through");
            return Ok(self.pass_through(hits));
        };

        let mut scored = Vec::with_capacity(hits.len());
        for (rank, hit) in hits.iter().enumerate() {
            match cross_encoder.score(query, &hit.text).await {
                Ok(score) => scored.push(RerankedPassage {
                    hit: hit.clone(),
                    rerank_score: score.clamp(0.0, 1.0),
                    retrieval_rank: rank,
                }),
                Err(e) => {
                    // One failed pair degrades the whole stage; a partially
                    // reranked list would not be comparable
                    warn!(error = %e, "cross-encoder failed, degrading to retrieval order");
                    return Ok(self.pass_through(hits));
                }
            }
        }

        scored.retain(|p| p.rerank_score >= self.config.min_score);
        scored.sort_by(|a, b| {
            b.rerank_score
                .partial_cmp(&a.rerank_score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.retrieval_rank.cmp(&b.retrieval_rank))
        });
        scored.truncate(self.config.top_k);

        debug!(kept = scored.len(), "rerank applied");
        Ok(RerankOutcome {
            passages: scored,
            applied: true,
        })
    }

    fn pass_through(&self, hits: Vec<ScoredChunk>) -> RerankOutcome {
        let passages = hits
            .into_iter()
            .take(self.config.top_k)
            .enumerate()
            .map(|(rank, hit)| RerankedPassage {
                rerank_score: hit.similarity,
                hit,
                retrieval_rank: rank,
            })
            .collect();
        RerankOutcome {
            passages,
            applied: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ChunkRef;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct TableCrossEncoder {
        scores: HashMap<String, f32>,
        fail: bool,
    }

    #[async_trait]
    impl CrossEncoder for TableCrossEncoder {
        async fn score(&self, _query: &str, passage: &str) -> Result<f32> {
            if self.fail {
                return Err(crate::error::EngineError::DependencyUnavailable(
                    "cross-encoder offline".to_string(),
                ));
            }
            Ok(*self.scores.get(passage).unwrap_or(&0.0))
        }
    }

    fn hit(name: &str, similarity: f32) -> ScoredChunk {
        ScoredChunk {
            chunk: ChunkRef {
                document_id: "doc".to_string(),
                chunk_ordinal: 0,
            },
            text: name.to_string(),
            char_start: 0,
            char_end: 0,
            similarity,
        }
    }

    fn config() -> RerankConfig {
        RerankConfig {
            enabled: true,
            input_max: 20,
            top_k: 5,
            min_score: 0.2,
        }
    }

    #[tokio::test]
    async fn test_rerank_reorders_by_cross_encoder() {
        // Retrieval order P1(0.4), P2(0.9), P3(0.7); cross-encoder says
        // P1=0.9, P2=0.1, P3=0.8, so the post-rerank order is P1, P3
        // with P2 dropped below the floor
        let scores = HashMap::from([
            ("P1".to_string(), 0.9f32),
            ("P2".to_string(), 0.1),
            ("P3".to_string(), 0.8),
        ]);
        let reranker = Reranker::new(
            Some(Arc::new(TableCrossEncoder {
                scores,
                fail: false,
            })),
            config(),
        );

        let outcome = reranker
            .rerank("q", vec![hit("P1", 0.4), hit("P2", 0.9), hit("P3", 0.7)])
            .await
            .unwrap();

        assert!(outcome.applied);
        let order: Vec<&str> = outcome.passages.iter().map(|p| p.hit.text.as_str()).collect();
        assert_eq!(order, vec!["P1", "P3"]);
    }

    #[tokio::test]
    async fn test_tie_break_on_retrieval_rank() {
        let scores = HashMap::from([
            ("A".to_string(), 0.5f32),
            ("B".to_string(), 0.5),
        ]);
        let reranker = Reranker::new(
            Some(Arc::new(TableCrossEncoder {
                scores,
                fail: false,
            })),
            config(),
        );

        let outcome = reranker
            .rerank("q", vec![hit("A", 0.9), hit("B", 0.8)])
            .await
            .unwrap();

        let order: Vec<&str> = outcome.passages.iter().map(|p| p.hit.text.as_str()).collect();
        assert_eq!(order, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_unavailable_cross_encoder_passes_through() {
        let reranker = Reranker::new(None, config());
        let outcome = reranker
            .rerank("q", vec![hit("P1", 0.9), hit("P2", 0.7)])
            .await
            .unwrap();

        assert!(!outcome.applied);
        let order: Vec<&str> = outcome.passages.iter().map(|p| p.hit.text.as_str()).collect();
        assert_eq!(order, vec!["P1", "P2"]);
    }

    #[tokio::test]
    async fn test_failing_cross_encoder_degrades() {
        let reranker = Reranker::new(
            Some(Arc::new(TableCrossEncoder {
                scores: HashMap::new(),
                fail: true,
            })),
            config(),
        );

        let outcome = reranker
            .rerank("q", vec![hit("P1", 0.9), hit("P2", 0.7)])
            .await
            .unwrap();

        assert!(!outcome.applied);
        assert_eq!(outcome.passages.len(), 2);
    }

    #[tokio::test]
    async fn test_input_max_and_top_k() {
        let mut cfg = config();
        cfg.input_max = 3;
        cfg.top_k = 2;
        cfg.min_score = 0.0;

        let scores: HashMap<String, f32> = (0..5)
            .map(|i| (format!("P{i}"), 0.9 - i as f32 * 0.1))
            .collect();
        let reranker = Reranker::new(
            Some(Arc::new(TableCrossEncoder {
                scores,
                fail: false,
            })),
            cfg,
        );

        let hits: Vec<ScoredChunk> = (0..5).map(|i| hit(&format!("P{i}"), 0.5)).collect();
        let outcome = reranker.rerank("q", hits).await.unwrap();
        assert_eq!(outcome.passages.len(), 2);
        assert_eq!(outcome.passages[0].hit.text, "P0");
    }
}
