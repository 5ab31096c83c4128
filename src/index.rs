//! Vector index with metadata sidecar
//!
//! Persists chunk embeddings plus provenance metadata and answers top-K
//! cosine-similarity queries. Raw cosine similarity lives in [-1, 1]; scores
//! are mapped to [0, 1] via `(s + 1) / 2` before leaving this component.
//! Writes are serialized per document by the ingestion service; search is
//! consistent with the most recent `add` in the calling process.

use crate::chunker::Chunk;
use crate::error::{IndexError, Result};
use crate::model::cosine_similarity;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

/// Reference to an indexed chunk
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRef {
    pub document_id: String,
    pub chunk_ordinal: u32,
}

/// A scored search hit with its stored metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: ChunkRef,
    /// Chunk text as stored at indexing time
    pub text: String,
    pub char_start: usize,
    pub char_end: usize,
    /// Similarity mapped to [0, 1]
    pub similarity: f32,
}

/// Vector index abstraction
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Add one chunk; idempotent on `(document_id, chunk_ordinal)`
    async fn add(&self, document_id: &str, chunk: &Chunk, embedding: &[f32]) -> Result<()>;

    /// Top-K cosine search, scores mapped to [0, 1], sorted descending
    async fn search(
        &self,
        query_vector: &[f32],
        k: usize,
        document_filter: Option<&str>,
    ) -> Result<Vec<ScoredChunk>>;

    /// Remove all chunks for a document
    async fn delete(&self, document_id: &str) -> Result<()>;

    /// Number of chunks stored for a document
    async fn chunk_count(&self, document_id: &str) -> Result<usize>;

    /// Store the embedding-model version tag. Returns the previous tag if it
    /// differed, so callers can invalidate derived state.
    async fn set_version_tag(&self, tag: &str) -> Result<Option<String>>;

    /// Currently stored embedding-model version tag
    async fn version_tag(&self) -> Result<Option<String>>;
}

/// SQLite-backed vector index with brute-force cosine search
pub struct SqliteVectorIndex {
    pool: SqlitePool,
    dimension: usize,
}

impl SqliteVectorIndex {
    /// Open (or create) the index at the given SQLite URL
    pub async fn connect(database_url: &str, dimension: usize) -> Result<Self> {
        info!(url = database_url, dimension, "initializing vector index");

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| IndexError::StorageFailed(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                document_id TEXT NOT NULL,
                chunk_ordinal INTEGER NOT NULL,
                content TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                char_start INTEGER NOT NULL,
                char_end INTEGER NOT NULL,
                embedding BLOB NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (document_id, chunk_ordinal)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id)")
            .execute(&pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS index_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool, dimension })
    }

    /// In-memory index for tests and ephemeral deployments
    pub async fn in_memory(dimension: usize) -> Result<Self> {
        Self::connect("sqlite::memory:", dimension).await
    }

    /// Serialize embedding for storage
    pub fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
        embedding
            .iter()
            .flat_map(|f| f.to_le_bytes().to_vec())
            .collect()
    }

    /// Deserialize embedding from storage
    pub fn deserialize_embedding(data: &[u8]) -> Vec<f32> {
        data.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(IndexError::InvalidDimension {
                expected: self.dimension,
                actual: vector.len(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn add(&self, document_id: &str, chunk: &Chunk, embedding: &[f32]) -> Result<()> {
        self.check_dimension(embedding)?;

        let blob = Self::serialize_embedding(embedding);
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO chunks
                (document_id, chunk_ordinal, content, content_hash,
                 char_start, char_end, embedding, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(document_id)
        .bind(chunk.ordinal as i64)
        .bind(&chunk.text)
        .bind(&chunk.content_hash)
        .bind(chunk.char_start as i64)
        .bind(chunk.char_end as i64)
        .bind(&blob)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(document_id, ordinal = chunk.ordinal, "indexed chunk");
        Ok(())
    }

    async fn search(
        &self,
        query_vector: &[f32],
        k: usize,
        document_filter: Option<&str>,
    ) -> Result<Vec<ScoredChunk>> {
        self.check_dimension(query_vector)?;

        let rows = match document_filter {
            Some(doc_id) => {
                sqlx::query(
                    "SELECT document_id, chunk_ordinal, content, char_start, char_end, embedding \
                     FROM chunks WHERE document_id = ?1",
                )
                .bind(doc_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT document_id, chunk_ordinal, content, char_start, char_end, embedding \
                     FROM chunks",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let embedding_blob: Vec<u8> = row.get("embedding");
            let embedding = Self::deserialize_embedding(&embedding_blob);
            let cosine = cosine_similarity(query_vector, &embedding);
            // Map [-1, 1] similarity into [0, 1] before it leaves the index
            let similarity = ((cosine + 1.0) / 2.0).clamp(0.0, 1.0);

            let ordinal: i64 = row.get("chunk_ordinal");
            results.push(ScoredChunk {
                chunk: ChunkRef {
                    document_id: row.get("document_id"),
                    chunk_ordinal: ordinal as u32,
                },
                text: row.get("content"),
                char_start: row.get::<i64, _>("char_start") as usize,
                char_end: row.get::<i64, _>("char_end") as usize,
                similarity,
            });
        }

        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.chunk_ordinal.cmp(&b.chunk.chunk_ordinal))
        });
        results.truncate(k);

        debug!(hits = results.len(), k, "vector search complete");
        Ok(results)
    }

    async fn delete(&self, document_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM chunks WHERE document_id = ?1")
            .bind(document_id)
            .execute(&self.pool)
            .await?;

        info!(
            document_id,
            removed = result.rows_affected(),
            "deleted document chunks"
        );
        Ok(())
    }

    async fn chunk_count(&self, document_id: &str) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM chunks WHERE document_id = ?1")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get("count");
        Ok(count as usize)
    }

    async fn set_version_tag(&self, tag: &str) -> Result<Option<String>> {
        let previous = self.version_tag().await?;

        sqlx::query("INSERT OR REPLACE INTO index_meta (key, value) VALUES ('embedding_version', ?1)")
            .bind(tag)
            .execute(&self.pool)
            .await?;

        match previous {
            Some(prev) if prev != tag => {
                info!(previous = %prev, current = tag, "embedding version changed");
                Ok(Some(prev))
            }
            _ => Ok(None),
        }
    }

    async fn version_tag(&self) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM index_meta WHERE key = 'embedding_version'")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query;

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

    fn unit(mut v: Vec<f32>) -> Vec<f32> {
        crate::model::normalize_l2(&mut v);
        v
    }

    #[tokio::test]
    async fn test_add_search_delete() {
        let index = SqliteVectorIndex::in_memory(3).await.unwrap();

        index
            .add("doc1", &chunk(0, "alpha"), &unit(vec![1.0, 0.0, 0.0]))
            .await
            .unwrap();
        index
            .add("doc1", &chunk(1, "beta"), &unit(vec![0.0, 1.0, 0.0]))
            .await
            .unwrap();

        let hits = index
            .search(&unit(vec![1.0, 0.0, 0.0]), 10, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text, "alpha");
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
        // Orthogonal vector maps to 0.5 after (s+1)/2
        assert!((hits[1].similarity - 0.5).abs() < 1e-6);

        index.delete("doc1").await.unwrap();
        assert_eq!(index.chunk_count("doc1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_scores_sorted_and_in_unit_range() {
        let index = SqliteVectorIndex::in_memory(3).await.unwrap();
        let vectors = [
            vec![1.0, 0.0, 0.0],
            vec![0.5, 0.5, 0.0],
            vec![-1.0, 0.0, 0.0],
            vec![0.0, 0.0, 1.0],
        ];
        for (i, v) in vectors.iter().enumerate() {
            index
                .add("doc", &chunk(i as u32, &format!("c{i}")), &unit(v.clone()))
                .await
                .unwrap();
        }

        let hits = index
            .search(&unit(vec![1.0, 0.0, 0.0]), 10, None)
            .await
            .unwrap();

        for pair in hits.windows(2) {
            assert!(pair[0].similarity >= pair[1].similarity);
        }
        for hit in &hits {
            assert!((0.0..=1.0).contains(&hit.similarity));
        }
        // Opposite vector lands at 0
        assert!(hits.last().unwrap().similarity < 1e-6);
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let index = SqliteVectorIndex::in_memory(3).await.unwrap();
        let c = chunk(0, "gamma");
        let v = unit(vec![1.0, 0.0, 0.0]);

        index.add("doc", &c, &v).await.unwrap();
        index.add("doc", &c, &v).await.unwrap();

        assert_eq!(index.chunk_count("doc").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_document_filter() {
        let index = SqliteVectorIndex::in_memory(3).await.unwrap();
        let v = unit(vec![1.0, 0.0, 0.0]);
        index.add("doc1", &chunk(0, "one"), &v).await.unwrap();
        index.add("doc2", &chunk(0, "two"), &v).await.unwrap();

        let hits = index.search(&v, 10, Some("doc2")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.document_id, "doc2");
    }

    #[tokio::test]
    async fn test_dimension_check() {
        let index = SqliteVectorIndex::in_memory(3).await.unwrap();
        let err = index
            .add("doc", &chunk(0, "bad"), &[1.0, 0.0])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "index");
    }

    #[tokio::test]
    async fn test_version_tag_change_detection() {
        let index = SqliteVectorIndex::in_memory(3).await.unwrap();
        assert!(index.version_tag().await.unwrap().is_none());

        assert!(index.set_version_tag("model-v1").await.unwrap().is_none());
        assert!(index.set_version_tag("model-v1").await.unwrap().is_none());

        let previous = index.set_version_tag("model-v2").await.unwrap();
        assert_eq!(previous.as_deref(), Some("model-v1"));
        assert_eq!(index.version_tag().await.unwrap().as_deref(), Some("model-v2"));
    }

    #[test]
    fn test_embedding_serialization_roundtrip() {
        let embedding = vec![1.5, -2.3, 0.0, 42.1];
        let serialized = SqliteVectorIndex::serialize_embedding(&embedding);
        let deserialized = SqliteVectorIndex::deserialize_embedding(&serialized);

        assert_eq!(embedding.len(), deserialized.len());
        for (orig, deser) in embedding.iter().zip(deserialized.iter()) {
            assert!((orig - deser).abs() < f32::EPSILON);
        }
    }
}
