//! Document-Grounded Question Answering Core
//!
//! A retrieval-augmented answering engine that:
//! - chunks and indexes documents into a vector index
//! - retrieves and cross-encoder-reranks candidate passages
//! - generates N candidate answers and selects the best by score
//! - gates answer quality and falls back to an external knowledge source
//! - learns from repeated questions through an adaptive cache
//!
//! # Example
//!
//! ```rust,no_run
//! use docqa::{AnswerEngine, AnswerRequest, EngineConfig};
//! use docqa::{SqliteDocumentStore, SqliteVectorIndex};
//! use docqa::ollama::{ModelServerConfig, OllamaModelClient};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let models = Arc::new(OllamaModelClient::new(ModelServerConfig::default())?);
//!     let index = Arc::new(SqliteVectorIndex::connect("sqlite:index.db", 768).await?);
//!     let store = Arc::new(SqliteDocumentStore::connect("sqlite:documents.db").await?);
//!
//!     let engine = AnswerEngine::builder(EngineConfig::default())
//!         .embedder(models.clone())
//!         .generator(models)
//!         .vector_index(index)
//!         .document_store(store)
//!         .build()
//!         .await?;
//!
//!     engine.ingest_text("doc-1", "user-1", "TypeScript is a typed superset of JavaScript.").await?;
//!     engine.drain_ingestion().await;
//!
//!     let response = engine
//!         .answer(AnswerRequest {
//!             question: "What is TypeScript?".to_string(),
//!             document_id: "doc-1".to_string(),
//!             user_id: "user-1".to_string(),
//!             options: Default::default(),
//!         })
//!         .await?;
//!
//!     println!("{} (confidence {:.2})", response.answer, response.confidence);
//!     Ok(())
//! }
//! ```

pub mod bestofn;
pub mod cache;
pub mod chunker;
pub mod classifier;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod index;
pub mod model;
pub mod ollama;
pub mod query;
pub mod reranker;
pub mod retriever;

// Re-export main types
pub use bestofn::{BestOfN, Candidate, CandidateScores};
pub use cache::{AdaptiveCache, AdaptiveCacheStats, CacheEntry, CacheHit};
pub use chunker::{Chunk, Chunker};
pub use classifier::{ClassificationRecord, Classifier, ClassifierRule, ClassifyMethod};
pub use config::{
    CacheConfig, ChunkingConfig, ClassifierConfig, DeadlineConfig, EngineConfig, FallbackConfig,
    GateConfig, GenerationConfig, LimitsConfig, RerankConfig, RetrievalConfig, ScoreWeights,
};
pub use document::{
    DocumentRecord, DocumentStatus, DocumentStore, IngestReceipt, IngestionService,
    SqliteDocumentStore,
};
pub use engine::{
    AnswerEngine, AnswerOptions, AnswerRequest, EngineBuilder, EngineStats, Origin, QaResponse,
    ResponseFormat, ResponseMetadata, SourceRef,
};
pub use error::{EngineError, IndexError, ModelError, Result};
pub use fallback::{ExternalAnswer, ExternalSource, ExternalSourceRef, WikipediaClient};
pub use index::{ChunkRef, ScoredChunk, SqliteVectorIndex, VectorIndex};
pub use model::{
    CrossEncoder, Embedder, GenerationOutput, Generator, LabelModel, LabelPrediction,
    SamplingParams,
};
pub use query::Query;
pub use reranker::{RerankOutcome, RerankedPassage, Reranker};
pub use retriever::{RetrievalResult, Retriever};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.starts_with(char::is_numeric));
    }
}
