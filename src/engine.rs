//! Root engine wiring every collaborator together. All shared mutable
//! state (session registry, token cache, session-dataset map) lives on the
//! engine so tests can construct isolated instances.

use crate::config::EngineConfig;
use crate::document::{ChatMessage, DocumentRole, Session, SessionMode};
use crate::embedder::Embedder;
use crate::error::Result;
use crate::executor::{CodeExecutor, HttpCodeExecutor};
use crate::graph::Graph;
use crate::ingest::{Ingestor, SessionDatasets};
use crate::llm::{HttpLlmClient, LlmClient};
use crate::pdf::PdfPipeline;
use crate::query::HybridQuery;
use crate::runner::{AgentRunner, SessionRegistry};
use crate::state::StateBuilder;
use crate::store::Store;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// The assembled retrieval engine
pub struct Engine {
    pub config: EngineConfig,
    pub store: Store,
    pub llm: Arc<dyn LlmClient>,
    pub embedder: Arc<Embedder>,
    pub graph: Graph,
    pub ingestor: Arc<Ingestor>,
    pub query: Arc<HybridQuery>,
    pub runner: Arc<AgentRunner>,
    pub registry: SessionRegistry,
    pub executor: Arc<dyn CodeExecutor>,
    pub pdf: Arc<PdfPipeline>,
    pub session_datasets: SessionDatasets,
}

impl Engine {
    /// Production wiring with HTTP collaborators
    pub async fn new(config: EngineConfig) -> Result<Self> {
        let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(config.llm.clone())?);
        let executor: Arc<dyn CodeExecutor> =
            Arc::new(HttpCodeExecutor::new(config.executor.clone())?);
        Self::with_collaborators(config, llm, executor).await
    }

    /// Wiring with injectable LLM and executor, for tests and embedding
    pub async fn with_collaborators(
        config: EngineConfig,
        llm: Arc<dyn LlmClient>,
        executor: Arc<dyn CodeExecutor>,
    ) -> Result<Self> {
        let store = Store::connect(config.store.clone()).await?;
        let embedder = Arc::new(Embedder::new(Arc::clone(&llm), config.embedding.clone()));
        let graph = Graph::new(store.clone());
        let session_datasets = SessionDatasets::new();
        let state_builder = Arc::new(StateBuilder::new(store.clone(), Arc::clone(&embedder)));

        let ingestor = Arc::new(Ingestor::new(
            store.clone(),
            Arc::clone(&llm),
            Arc::clone(&embedder),
            state_builder,
            graph.clone(),
            config.ingest.clone(),
            session_datasets.clone(),
        ));

        let query = Arc::new(HybridQuery::new(
            store.clone(),
            Arc::clone(&llm),
            graph.clone(),
            config.retrieval.clone(),
        ));

        let registry = SessionRegistry::new();
        let runner = Arc::new(AgentRunner::new(
            store.clone(),
            Arc::clone(&llm),
            Arc::clone(&query),
            Arc::clone(&ingestor),
            Arc::clone(&executor),
            registry.clone(),
            config.runner.clone(),
            config.ingest.clone(),
        ));

        let pdf = Arc::new(PdfPipeline::new(config.pdf.clone())?);

        info!("Engine assembled");
        Ok(Self {
            config,
            store,
            llm,
            embedder,
            graph,
            ingestor,
            query,
            runner,
            registry,
            executor,
            pdf,
            session_datasets,
        })
    }

    /// Create a session and its workspace directory
    pub async fn create_session(
        &self,
        user_id: Option<Uuid>,
        mode: SessionMode,
    ) -> Result<Session> {
        let id = Uuid::new_v4();
        let workspace = self.workspace_path(id);
        tokio::fs::create_dir_all(&workspace).await?;

        let session = Session {
            id,
            user_id,
            workspace_path: workspace.to_string_lossy().to_string(),
            mode,
            title: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.store.create_session(&session).await?;
        Ok(session)
    }

    /// Delete a session and cascade: rows, dataset memory, executor
    /// binding, workspace directory
    pub async fn delete_session(&self, session_id: Uuid) -> Result<()> {
        let deadline = Duration::from_secs(self.config.store.session_delete_timeout_secs);
        match tokio::time::timeout(deadline, self.store.delete_session(session_id)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("Session row deletion timed out for {session_id}");
            }
        }

        self.session_datasets.forget(session_id);

        if let Err(e) = self.executor.cleanup(session_id).await {
            warn!("Executor cleanup failed for {session_id}: {e}");
        }

        let workspace = self.workspace_path(session_id);
        if workspace.exists() {
            let cleanup_deadline =
                Duration::from_secs(self.config.server.workspace_cleanup_timeout_secs);
            match tokio::time::timeout(cleanup_deadline, tokio::fs::remove_dir_all(&workspace))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Workspace removal failed for {session_id}: {e}"),
                Err(_) => warn!("Workspace removal timed out for {session_id}"),
            }
        }

        Ok(())
    }

    /// Persist a user turn and return it for streaming
    pub async fn submit_user_message(
        &self,
        session_id: Uuid,
        content: &str,
    ) -> Result<ChatMessage> {
        let message = ChatMessage {
            id: Uuid::new_v4(),
            session_id,
            role: DocumentRole::User,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        self.store.create_message(&message).await?;
        self.store.touch_session(session_id).await?;
        Ok(message)
    }

    /// Extract and ingest an uploaded PDF; shifts the session mode toward
    /// documents
    pub async fn upload_pdf(
        &self,
        session_id: Uuid,
        filename: &str,
        data: &[u8],
    ) -> Result<usize> {
        let pages = self.pdf.extract_pages(data).await?;
        let written = self.ingestor.ingest_pdf(session_id, filename, &pages).await?;

        let mode = if self.session_datasets.get(session_id).is_some() {
            SessionMode::Mixed
        } else {
            SessionMode::Document
        };
        self.store.set_session_mode(session_id, mode).await?;

        Ok(written)
    }

    /// Save an uploaded dataset file into the session workspace and remember
    /// it as the session's active dataset
    pub async fn upload_dataset(
        &self,
        session_id: Uuid,
        filename: &str,
        data: &[u8],
    ) -> Result<PathBuf> {
        let workspace = self.workspace_path(session_id);
        tokio::fs::create_dir_all(&workspace).await?;

        let target = workspace.join(filename);
        tokio::fs::write(&target, data).await?;
        self.session_datasets.remember(session_id, filename);
        Ok(target)
    }

    pub fn workspace_path(&self, session_id: Uuid) -> PathBuf {
        Path::new(&self.config.server.workspace_root).join(session_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream::BoxStream;

    struct StubLlm;

    #[async_trait]
    impl LlmClient for StubLlm {
        async fn chat(&self, _m: &[crate::llm::Message]) -> Result<String> {
            Ok(String::new())
        }
        async fn chat_stream(
            &self,
            _m: &[crate::llm::Message],
        ) -> Result<BoxStream<'static, Result<String>>> {
            unimplemented!("not used")
        }
        async fn embed(&self, _t: &str) -> Result<Vec<f32>> {
            Ok(vec![0.5; 8])
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.5; 8]).collect())
        }
        async fn count_tokens(&self, text: &str) -> Result<usize> {
            Ok(text.split_whitespace().count().max(1))
        }
    }

    struct NoopExecutor;

    #[async_trait]
    impl CodeExecutor for NoopExecutor {
        async fn execute(&self, _s: Uuid, _c: &str) -> Result<String> {
            Ok(String::new())
        }
        async fn cleanup(&self, _s: Uuid) -> Result<()> {
            Ok(())
        }
    }

    async fn test_engine(workspace_root: &str) -> Engine {
        let mut config = EngineConfig::default();
        config.store.database_url = "sqlite::memory:".to_string();
        config.store.embedding_dimension = 8;
        config.server.workspace_root = workspace_root.to_string();

        Engine::with_collaborators(config, Arc::new(StubLlm), Arc::new(NoopExecutor))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_session_lifecycle_with_workspace() {
        let root = tempfile::tempdir().unwrap();
        let engine = test_engine(root.path().to_str().unwrap()).await;

        let session = engine.create_session(None, SessionMode::Dataset).await.unwrap();
        assert!(engine.workspace_path(session.id).exists());

        engine
            .upload_dataset(session.id, "iris.csv", b"a,b\n1,2\n")
            .await
            .unwrap();
        assert_eq!(
            engine.session_datasets.get(session.id).as_deref(),
            Some("iris.csv")
        );

        let message = engine.submit_user_message(session.id, "hello").await.unwrap();
        assert_eq!(message.role, DocumentRole::User);

        engine.delete_session(session.id).await.unwrap();
        assert!(!engine.workspace_path(session.id).exists());
        assert!(engine.store.get_session(session.id).await.unwrap_err().is_not_found());
        assert!(engine.session_datasets.get(session.id).is_none());
    }

    #[tokio::test]
    async fn test_isolated_engines_share_nothing() {
        let root_a = tempfile::tempdir().unwrap();
        let root_b = tempfile::tempdir().unwrap();
        let a = test_engine(root_a.path().to_str().unwrap()).await;
        let b = test_engine(root_b.path().to_str().unwrap()).await;

        let session = a.create_session(None, SessionMode::Dataset).await.unwrap();
        a.session_datasets.remember(session.id, "iris.csv");

        assert!(b.session_datasets.get(session.id).is_none());
        assert!(b.store.get_session(session.id).await.unwrap_err().is_not_found());
    }
}
