//! Configuration management for the retrieval engine

use serde::{Deserialize, Serialize};

/// Main configuration for the retrieval engine
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// LLM transport configuration
    pub llm: LlmConfig,

    /// Document/embedding store configuration
    pub store: StoreConfig,

    /// Windowing and embedding configuration
    pub embedding: EmbeddingConfig,

    /// Fact ingestion configuration
    pub ingest: IngestConfig,

    /// Hybrid retrieval configuration
    pub retrieval: RetrievalConfig,

    /// Agent run orchestration configuration
    pub runner: RunnerConfig,

    /// HTTP server configuration
    pub server: ServerConfig,

    /// Python executor service configuration
    pub executor: ExecutorConfig,

    /// PDF extractor service configuration
    #[serde(default)]
    pub pdf: PdfConfig,
}

/// LLM transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of the OpenAI-compatible server
    pub base_url: String,

    /// Model for chat completions
    pub chat_model: String,

    /// Model for embeddings
    pub embedding_model: String,

    /// Maximum tokens for generation
    pub max_tokens: u32,

    /// Temperature for generation
    pub temperature: f32,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,

    /// Timeout for one-shot summarization calls in seconds
    pub summarize_timeout_secs: u64,

    /// Maximum retry attempts for transient failures
    pub max_retries: u32,

    /// Backoff base in milliseconds for HTTP 503
    pub backoff_base_ms: u64,

    /// Backoff cap in milliseconds
    pub backoff_max_ms: u64,

    /// Symmetric jitter as a fraction of the computed backoff
    pub backoff_jitter_ratio: f64,
}

/// Document/embedding store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database URL
    pub database_url: String,

    /// Embedding vector dimension
    pub embedding_dimension: usize,

    /// Timeout for cascading session deletion in seconds
    pub session_delete_timeout_secs: u64,
}

/// Windowing and embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Soft token limit of the embedding backend
    pub soft_token_limit: usize,

    /// Desired tokens per window
    pub target_tokens: usize,

    /// Safety margin subtracted from the effective target
    pub safety_margin: usize,

    /// Inputs shorter than this many characters are tokenized synchronously
    pub sync_tokenize_char_limit: usize,

    /// Token count cache capacity before cleanup
    pub token_cache_capacity: usize,

    /// Timeout for background exact-count validation in seconds
    pub background_tokenize_timeout_secs: u64,

    /// Timeout for embedding calls in seconds
    pub embed_timeout_secs: u64,
}

/// Fact ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Store facts as the single-line structured BM25 form instead of JSON
    pub structured_fact_content: bool,

    /// Analysis stages that always use the deterministic template
    pub template_only_stages: Vec<String>,

    /// Retry attempts for the detached ingestion task
    pub max_attempts: u32,

    /// Overall timeout for one ingestion pass in seconds
    pub task_timeout_secs: u64,
}

/// Hybrid retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Minimum cosine similarity for dense candidates
    pub semantic_similarity_threshold: f32,

    /// Minimum lexical score (including exact bonus) for BM25 candidates
    pub bm25_score_threshold: f32,

    /// Upper bound on gathered candidates per arm
    pub max_hybrid_candidates: usize,

    /// Weight of the normalized semantic score
    pub hybrid_semantic_weight: f32,

    /// Weight of the normalized BM25 score
    pub hybrid_bm25_weight: f32,

    /// Per-role boost for facts in dataset mode
    pub fact_boost: f32,

    /// Boost for summaries
    pub summary_boost: f32,

    /// Boost for document chunks in document mode
    pub document_boost: f32,

    /// Boost for state cards
    pub state_boost: f32,

    /// Multiplier applied to candidates with an incoming supports edge
    pub graph_supports_boost: f32,

    /// Enable pure-metadata fallback when hybrid search returns nothing
    pub enable_metadata_fallback: bool,

    /// Maximum parsed filters for the metadata fallback
    pub max_fallback_filters: usize,
}

/// Agent run orchestration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// System prompt template for the agent
    pub system_prompt: String,

    /// Memory block result budget per query
    pub memory_results: usize,

    /// Rolling fence-detector window size in bytes
    pub fence_window_bytes: usize,

    /// Maximum code execution rounds per turn
    pub max_exec_rounds: usize,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    pub bind_addr: String,

    /// Root directory for per-session workspaces
    pub workspace_root: String,

    /// Timeout for workspace directory removal in seconds
    pub workspace_cleanup_timeout_secs: u64,
}

/// Python executor service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Base URL of the sandboxed executor service
    pub base_url: String,

    /// Timeout for one code execution in seconds
    pub exec_timeout_secs: u64,
}

/// PDF extractor service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdfConfig {
    /// Base URL of the extractor microservice; empty disables it
    #[serde(default)]
    pub base_url: String,

    /// Extraction mode query parameter
    #[serde(default = "default_pdf_mode")]
    pub mode: String,

    /// Request timeout in seconds
    #[serde(default = "default_pdf_timeout")]
    pub request_timeout_secs: u64,
}

fn default_pdf_mode() -> String {
    "layout".to_string()
}

fn default_pdf_timeout() -> u64 {
    60
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            chat_model: "default".to_string(),
            embedding_model: "default-embed".to_string(),
            max_tokens: 4096,
            temperature: 0.2,
            request_timeout_secs: 300,
            summarize_timeout_secs: 30,
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
            backoff_jitter_ratio: 0.1,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:statmem.db".to_string(),
            embedding_dimension: 768,
            session_delete_timeout_secs: 5,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            soft_token_limit: 512,
            target_tokens: 480,
            safety_margin: 16,
            sync_tokenize_char_limit: 2_000,
            token_cache_capacity: 1_000,
            background_tokenize_timeout_secs: 5,
            embed_timeout_secs: 60,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            structured_fact_content: false,
            template_only_stages: vec![
                "assumption_check".to_string(),
                "descriptive".to_string(),
            ],
            max_attempts: 3,
            task_timeout_secs: 120,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            semantic_similarity_threshold: 0.7,
            bm25_score_threshold: 0.5,
            max_hybrid_candidates: 60,
            hybrid_semantic_weight: 0.65,
            hybrid_bm25_weight: 0.35,
            fact_boost: 0.15,
            summary_boost: 0.1,
            document_boost: 0.2,
            state_boost: 0.25,
            graph_supports_boost: 1.15,
            enable_metadata_fallback: true,
            max_fallback_filters: 3,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are a statistics agent. Answer using the provided context; \
                            emit Python inside <python></python> driven ```python fences when \
                            computation is required."
                .to_string(),
            memory_results: 6,
            fence_window_bytes: 2_048,
            max_exec_rounds: 8,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            workspace_root: "./workspaces".to_string(),
            workspace_cleanup_timeout_secs: 300,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8777".to_string(),
            exec_timeout_secs: 120,
        }
    }
}

impl Default for PdfConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            mode: default_pdf_mode(),
            request_timeout_secs: default_pdf_timeout(),
        }
    }
}

impl EngineConfig {
    /// Load configuration layered as defaults <- optional file <- STATMEM_* env vars
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&EngineConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let cfg: EngineConfig = builder
            .add_source(config::Environment::with_prefix("STATMEM").separator("__"))
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.llm.base_url.starts_with("http") {
            return Err(anyhow::anyhow!("Invalid LLM base URL: {}", self.llm.base_url));
        }

        if self.llm.chat_model.is_empty() {
            return Err(anyhow::anyhow!("Chat model name cannot be empty"));
        }

        if self.llm.embedding_model.is_empty() {
            return Err(anyhow::anyhow!("Embedding model name cannot be empty"));
        }

        if self.store.embedding_dimension == 0 {
            return Err(anyhow::anyhow!("Embedding dimension must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.retrieval.semantic_similarity_threshold) {
            return Err(anyhow::anyhow!(
                "Semantic similarity threshold must be between 0.0 and 1.0"
            ));
        }

        let weight_sum =
            self.retrieval.hybrid_semantic_weight + self.retrieval.hybrid_bm25_weight;
        if weight_sum <= 0.0 {
            return Err(anyhow::anyhow!("Hybrid weights must sum to a positive value"));
        }

        if self.embedding.soft_token_limit == 0 {
            return Err(anyhow::anyhow!("Soft token limit must be greater than 0"));
        }

        if self.retrieval.max_hybrid_candidates < 20 {
            return Err(anyhow::anyhow!("max_hybrid_candidates must be at least 20"));
        }

        Ok(())
    }
}
