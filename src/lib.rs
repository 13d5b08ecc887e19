//! Session-scoped retrieval and evidence engine for an LLM statistics agent.
//!
//! The crate ingests assistant/tool execution pairs into deduplicated facts
//! with extracted statistical metadata, windows and embeds documents,
//! derives evidence-validated state cards, answers queries with hybrid
//! dense+lexical search filtered against a lightweight relationship graph,
//! and streams agent turns over SSE with at most one concurrent run per
//! session.
//!
//! # Example
//!
//! ```rust,no_run
//! use statmem::{Engine, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::load(None)?;
//!     let engine = std::sync::Arc::new(Engine::new(config).await?);
//!     statmem::api::serve(engine).await
//! }
//! ```

pub mod api;
pub mod config;
pub mod document;
pub mod embedder;
pub mod engine;
pub mod error;
pub mod executor;
pub mod graph;
pub mod ingest;
pub mod llm;
pub mod pdf;
pub mod query;
pub mod runner;
pub mod state;
pub mod stats;
pub mod store;

// Re-export main types
pub use config::{EngineConfig, IngestConfig, LlmConfig, RetrievalConfig, StoreConfig};
pub use document::{
    ChatMessage, Document, DocumentMeta, DocumentRole, DocumentType, EdgeType, EmbeddingWindow,
    GraphEdge, SearchHit, Session, SessionMode, VariableAlias,
};
pub use embedder::Embedder;
pub use engine::Engine;
pub use error::{EngineError, LlmError, Result, StoreError};
pub use executor::{CodeExecutor, HttpCodeExecutor};
pub use graph::Graph;
pub use ingest::{Ingestor, SessionDatasets};
pub use llm::{HttpLlmClient, LlmClient, Message, Role};
pub use pdf::{LocalPdfExtractor, PdfExtractor, PdfPipeline, PdfService};
pub use query::{HybridQuery, QueryOutcome, QueryRequest};
pub use runner::{AgentRunner, FenceDetector, SessionRegistry, SseEvent};
pub use state::StateBuilder;
pub use stats::StatMetadata;
pub use store::Store;

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
