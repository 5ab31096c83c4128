//! Document records and the ingestion pipeline
//!
//! Documents are created by upload, transitioned by a background indexing
//! task, referenced read-only by queries, and destroyed only via explicit
//! delete. A document reaches `Indexed` only after every one of its chunks
//! is present in the vector index; the single ingestion worker serializes
//! index writes per document.

use crate::chunker::Chunker;
use crate::config::{ChunkingConfig, LimitsConfig};
use crate::error::{EngineError, Result};
use crate::index::VectorIndex;
use crate::model::Embedder;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Document processing status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Extracting,
    Indexed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Extracting => "extracting",
            DocumentStatus::Indexed => "indexed",
            DocumentStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "pending" => DocumentStatus::Pending,
            "extracting" => DocumentStatus::Extracting,
            "indexed" => DocumentStatus::Indexed,
            _ => DocumentStatus::Failed,
        }
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored document record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: String,
    pub owner_id: String,
    pub filename: Option<String>,
    pub mime_hint: Option<String>,
    pub status: DocumentStatus,
    /// Extracted plain text; length bounded by the chunking caps
    pub text: String,
    pub page_count: Option<u32>,
    pub chunk_count: u32,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Ingestion status reported to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub document_id: String,
    pub status: DocumentStatus,
    pub chunk_count: Option<u32>,
}

/// Key/value store for document records
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put(&self, record: &DocumentRecord) -> Result<()>;

    async fn get(&self, document_id: &str) -> Result<Option<DocumentRecord>>;

    async fn set_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
        chunk_count: u32,
        error: Option<&str>,
    ) -> Result<()>;

    async fn delete(&self, document_id: &str) -> Result<()>;
}

/// SQLite-backed document record store
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| EngineError::Internal(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                document_id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                filename TEXT,
                mime_hint TEXT,
                status TEXT NOT NULL,
                text TEXT NOT NULL,
                page_count INTEGER,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        info!(url = database_url, "document store initialized");
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<DocumentRecord> {
        let status: String = row.get("status");
        let updated_at: String = row.get("updated_at");
        Ok(DocumentRecord {
            document_id: row.get("document_id"),
            owner_id: row.get("owner_id"),
            filename: row.get("filename"),
            mime_hint: row.get("mime_hint"),
            status: DocumentStatus::parse(&status),
            text: row.get("text"),
            page_count: row.get::<Option<i64>, _>("page_count").map(|p| p as u32),
            chunk_count: row.get::<i64, _>("chunk_count") as u32,
            error: row.get("error"),
            updated_at: DateTime::parse_from_rfc3339(&updated_at)
                .map_err(|e| EngineError::Internal(e.to_string()))?
                .with_timezone(&Utc),
        })
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn put(&self, record: &DocumentRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO documents
                (document_id, owner_id, filename, mime_hint, status, text,
                 page_count, chunk_count, error, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&record.document_id)
        .bind(&record.owner_id)
        .bind(&record.filename)
        .bind(&record.mime_hint)
        .bind(record.status.as_str())
        .bind(&record.text)
        .bind(record.page_count.map(|p| p as i64))
        .bind(record.chunk_count as i64)
        .bind(&record.error)
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, document_id: &str) -> Result<Option<DocumentRecord>> {
        let row = sqlx::query("SELECT * FROM documents WHERE document_id = ?1")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Self::record_from_row(&r)).transpose()
    }

    async fn set_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
        chunk_count: u32,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE documents
            SET status = ?1, chunk_count = ?2, error = ?3, updated_at = ?4
            WHERE document_id = ?5
            "#,
        )
        .bind(status.as_str())
        .bind(chunk_count as i64)
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(document_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, document_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM documents WHERE document_id = ?1")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// An ingestion job handed to the background worker
struct IngestJob {
    document_id: String,
}

/// Background ingestion service
///
/// `enqueue_text` records the document and queues it; the single worker task
/// chunks, embeds and indexes it, then flips the status. The bounded queue
/// applies backpressure: a full queue fails fast with `Overloaded`.
pub struct IngestionService {
    store: Arc<dyn DocumentStore>,
    index: Arc<dyn VectorIndex>,
    sender: flume::Sender<IngestJob>,
    worker: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl IngestionService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        chunking: ChunkingConfig,
        limits: &LimitsConfig,
    ) -> Arc<Self> {
        let (sender, receiver) = flume::bounded::<IngestJob>(limits.ingest_queue_size);

        let worker_store = Arc::clone(&store);
        let worker_index = Arc::clone(&index);
        let chunker = Chunker::new(chunking);

        let handle = tokio::spawn(async move {
            while let Ok(job) = receiver.recv_async().await {
                if let Err(e) = Self::process(
                    &*worker_store,
                    &*worker_index,
                    &*embedder,
                    &chunker,
                    &job.document_id,
                )
                .await
                {
                    error!(document_id = %job.document_id, error = %e, "ingestion failed");
                    let _ = worker_store
                        .set_status(
                            &job.document_id,
                            DocumentStatus::Failed,
                            0,
                            Some(&e.to_string()),
                        )
                        .await;
                }
            }
            debug!("ingestion worker stopped");
        });

        Arc::new(Self {
            store,
            index,
            sender,
            worker: tokio::sync::Mutex::new(Some(handle)),
        })
    }

    /// Record a document and queue it for indexing
    pub async fn enqueue_text(
        &self,
        document_id: &str,
        owner_id: &str,
        text: &str,
        filename: Option<String>,
        mime_hint: Option<String>,
    ) -> Result<IngestReceipt> {
        if document_id.is_empty() || owner_id.is_empty() {
            return Err(EngineError::InvalidInput(
                "document_id and owner_id must be non-empty".to_string(),
            ));
        }

        let record = DocumentRecord {
            document_id: document_id.to_string(),
            owner_id: owner_id.to_string(),
            filename,
            mime_hint,
            status: DocumentStatus::Pending,
            text: text.to_string(),
            page_count: None,
            chunk_count: 0,
            error: None,
            updated_at: Utc::now(),
        };
        self.store.put(&record).await?;

        self.sender
            .try_send(IngestJob {
                document_id: document_id.to_string(),
            })
            .map_err(|_| EngineError::Overloaded)?;

        Ok(IngestReceipt {
            document_id: document_id.to_string(),
            status: DocumentStatus::Pending,
            chunk_count: None,
        })
    }

    async fn process(
        store: &dyn DocumentStore,
        index: &dyn VectorIndex,
        embedder: &dyn Embedder,
        chunker: &Chunker,
        document_id: &str,
    ) -> Result<()> {
        let record = store
            .get(document_id)
            .await?
            .ok_or_else(|| EngineError::DocumentNotFound(document_id.to_string()))?;

        store
            .set_status(document_id, DocumentStatus::Extracting, 0, None)
            .await?;

        let chunks = chunker.chunk(&record.text)?;
        if chunks.is_empty() {
            store
                .set_status(
                    document_id,
                    DocumentStatus::Failed,
                    0,
                    Some("no extractable text"),
                )
                .await?;
            warn!(document_id, "document had no extractable text");
            return Ok(());
        }

        // Replace any previous chunk set before re-adding
        index.delete(document_id).await?;

        // Embeddings are independent and batch well; index writes stay
        // sequential so the document's chunk stream is serialized
        let embeddings = futures::future::join_all(
            chunks.iter().map(|chunk| embedder.embed(&chunk.text)),
        )
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

        for (chunk, embedding) in chunks.iter().zip(&embeddings) {
            index.add(document_id, chunk, embedding).await?;
        }

        store
            .set_status(document_id, DocumentStatus::Indexed, chunks.len() as u32, None)
            .await?;

        info!(document_id, chunks = chunks.len(), "document indexed");
        Ok(())
    }

    /// Current ingestion status for a document
    pub async fn status(&self, document_id: &str, owner_id: &str) -> Result<IngestReceipt> {
        let record = self.fetch_owned(document_id, owner_id).await?;
        Ok(IngestReceipt {
            document_id: record.document_id,
            status: record.status,
            chunk_count: match record.status {
                DocumentStatus::Indexed => Some(record.chunk_count),
                _ => None,
            },
        })
    }

    /// Fetch a record, enforcing ownership
    pub async fn fetch_owned(&self, document_id: &str, owner_id: &str) -> Result<DocumentRecord> {
        let record = self
            .store
            .get(document_id)
            .await?
            .ok_or_else(|| EngineError::DocumentNotFound(document_id.to_string()))?;

        // Not-owned documents are indistinguishable from missing ones
        if record.owner_id != owner_id {
            return Err(EngineError::DocumentNotFound(document_id.to_string()));
        }
        Ok(record)
    }

    /// Remove a document and all its chunks
    pub async fn delete(&self, document_id: &str, owner_id: &str) -> Result<()> {
        self.fetch_owned(document_id, owner_id).await?;
        self.index.delete(document_id).await?;
        self.store.delete(document_id).await?;
        info!(document_id, "document deleted");
        Ok(())
    }

    /// Wait for queued jobs to finish processing; test and shutdown helper
    pub async fn drain(&self) {
        while !self.sender.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        // The worker may still be mid-job after the queue empties
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    /// Stop the worker after the queue drains
    pub async fn shutdown(&self) {
        self.drain().await;
        let mut guard = self.worker.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}
