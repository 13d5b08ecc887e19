//! Error handling for the retrieval engine

use thiserror::Error;

/// Result type alias for the retrieval engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Main error type for the retrieval engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Embedding error: {0}")]
    Embed(#[from] EmbedError),

    #[error("Ingestion error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Run already active for session {0}")]
    RunActive(uuid::Uuid),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Errors related to language model transport
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("Tokenization failed: {0}")]
    TokenizeFailed(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Prompt exceeds the model context window")]
    ContextWindowExceeded,

    #[error("Timeout: operation took too long")]
    Timeout,

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// Errors related to document/embedding storage
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(uuid::Uuid),

    #[error("Session not found: {0}")]
    SessionNotFound(uuid::Uuid),

    #[error("Invalid embedding dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Search failed: {0}")]
    SearchFailed(String),

    #[error("Storage failed: {0}")]
    StorageFailed(String),
}

/// Errors related to windowing and embedding
#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("Backend rejected input at minimum shrink ratio: {0}")]
    ShrinkExhausted(String),

    #[error("Embedding batch size mismatch: sent {sent}, received {received}")]
    BatchSizeMismatch { sent: usize, received: usize },
}

/// Errors related to fact ingestion
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Numeric verification failed: token {0:?} not present in evidence")]
    NumericVerification(String),

    #[error("Retries exhausted: {0}")]
    RetriesExhausted(String),
}

impl EngineError {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Llm(LlmError::Timeout)
                | EngineError::Llm(LlmError::ConnectionFailed(_))
                | EngineError::Http(_)
        )
    }

    /// True for the `not found` sentinel, which query paths treat as non-fatal
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::NotFound(_)
                | EngineError::Store(StoreError::NotFound(_))
                | EngineError::Store(StoreError::SessionNotFound(_))
        ) || matches!(self, EngineError::Database(sqlx::Error::RowNotFound))
    }

    /// Get error category for logging/metrics
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Llm(_) => "llm",
            EngineError::Store(_) => "store",
            EngineError::Embed(_) => "embed",
            EngineError::Ingest(_) => "ingest",
            EngineError::Config(_) => "config",
            EngineError::Executor(_) => "executor",
            EngineError::RunActive(_) => "run_active",
            EngineError::Cancelled => "cancelled",
            EngineError::Io(_) => "io",
            EngineError::Serialization(_) => "serialization",
            EngineError::Http(_) => "http",
            EngineError::Database(_) => "database",
            EngineError::NotFound(_) => "not_found",
        }
    }
}
