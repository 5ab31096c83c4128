//! Error handling for the answering core

use thiserror::Error;

/// Result type alias for the answering core
pub type Result<T> = std::result::Result<T, EngineError>;

/// Main error type for the answering core
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("document not ready: {0} (status: {1}), retry later")]
    NotReady(String, String),

    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("overloaded, retry with backoff")]
    Overloaded,

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors from the embedder / generator capabilities
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("generation failed: {0}")]
    GenerationFailed(String),

    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("timeout: operation took too long")]
    Timeout,

    #[error("all candidates failed")]
    AllCandidatesFailed,
}

/// Errors from the vector index and document stores
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("store not initialized")]
    NotInitialized,

    #[error("invalid embedding dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("search failed: {0}")]
    SearchFailed(String),

    #[error("storage failed: {0}")]
    StorageFailed(String),

    #[error("input too large: {actual} chars exceeds hard cap of {cap}")]
    InputTooLarge { actual: usize, cap: usize },
}

impl EngineError {
    /// Check if the error is retryable by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Overloaded
                | EngineError::NotReady(_, _)
                | EngineError::Model(ModelError::Timeout)
                | EngineError::Model(ModelError::ConnectionFailed(_))
                | EngineError::DependencyUnavailable(_)
                | EngineError::Http(_)
        )
    }

    /// Get error kind for logging/metrics and transport status mapping
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::DocumentNotFound(_) => "document_not_found",
            EngineError::NotReady(_, _) => "not_ready",
            EngineError::DependencyUnavailable(_) => "dependency_unavailable",
            EngineError::DeadlineExceeded => "deadline_exceeded",
            EngineError::Overloaded => "overloaded",
            EngineError::Model(_) => "model",
            EngineError::Index(IndexError::InputTooLarge { .. }) => "invalid_input",
            EngineError::Index(_) => "index",
            EngineError::Config(_) => "config",
            EngineError::Io(_) => "io",
            EngineError::Serialization(_) => "serialization",
            EngineError::Http(_) => "http",
            EngineError::Database(_) => "database",
            EngineError::Internal(_) => "internal",
        }
    }

    /// Whether the error is the caller's fault and must surface unchanged
    /// rather than degrade into a formatted failure answer
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidInput(_)
                | EngineError::DocumentNotFound(_)
                | EngineError::NotReady(_, _)
                | EngineError::Overloaded
                | EngineError::Index(IndexError::InputTooLarge { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let overloaded = EngineError::Overloaded;
        assert!(overloaded.is_retryable());

        let invalid = EngineError::InvalidInput("bad options".to_string());
        assert!(!invalid.is_retryable());

        let timeout = EngineError::Model(ModelError::Timeout);
        assert!(timeout.is_retryable());
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(EngineError::DeadlineExceeded.kind(), "deadline_exceeded");
        assert_eq!(
            EngineError::Index(IndexError::NotInitialized).kind(),
            "index"
        );
        // InputTooLarge is a caller problem, not a store problem
        assert_eq!(
            EngineError::Index(IndexError::InputTooLarge {
                actual: 11,
                cap: 10
            })
            .kind(),
            "invalid_input"
        );
    }

    #[test]
    fn test_caller_errors_surface() {
        assert!(EngineError::DocumentNotFound("d1".into()).is_caller_error());
        assert!(!EngineError::DependencyUnavailable("reranker".into()).is_caller_error());
    }
}
