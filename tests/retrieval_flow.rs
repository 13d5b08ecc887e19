//! End-to-end retrieval pipeline tests: ingest assistant/tool turns, derive
//! state cards, and answer queries with deduplicated memory blocks.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use statmem::{
    ChatMessage, CodeExecutor, DocumentRole, Engine, EngineConfig, LlmClient, QueryRequest,
    Result, SessionMode,
};
use std::sync::Arc;
use uuid::Uuid;

/// Keyword-axis embeddings so tests control similarity; chat returns a
/// fixed verified summary.
struct AxisLlm;

fn axis_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; 8];
    let lower = text.to_lowercase();
    if lower.contains("shapiro") || lower.contains("normality") {
        v[0] = 1.0;
    } else if lower.contains("histogram") {
        v[1] = 1.0;
    } else {
        v[2] = 1.0;
    }
    v
}

#[async_trait]
impl LlmClient for AxisLlm {
    async fn chat(&self, _messages: &[statmem::Message]) -> Result<String> {
        Ok("Analysis step summary".to_string())
    }
    async fn chat_stream(
        &self,
        _messages: &[statmem::Message],
    ) -> Result<BoxStream<'static, Result<String>>> {
        unimplemented!("streaming not exercised here")
    }
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(axis_vector(text))
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| axis_vector(t)).collect())
    }
    async fn count_tokens(&self, text: &str) -> Result<usize> {
        Ok(text.split_whitespace().count().max(1))
    }
}

struct NoopExecutor;

#[async_trait]
impl CodeExecutor for NoopExecutor {
    async fn execute(&self, _session_id: Uuid, _code: &str) -> Result<String> {
        Ok(String::new())
    }
    async fn cleanup(&self, _session_id: Uuid) -> Result<()> {
        Ok(())
    }
}

async fn test_engine() -> (Engine, tempfile::TempDir) {
    let workspace = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::default();
    config.store.database_url = "sqlite::memory:".to_string();
    config.store.embedding_dimension = 8;
    config.server.workspace_root = workspace.path().to_string_lossy().to_string();

    let engine = Engine::with_collaborators(config, Arc::new(AxisLlm), Arc::new(NoopExecutor))
        .await
        .unwrap();
    (engine, workspace)
}

fn turn_message(session_id: Uuid, role: DocumentRole, content: &str, order: i64) -> ChatMessage {
    ChatMessage {
        id: Uuid::new_v4(),
        session_id,
        role,
        content: content.to_string(),
        created_at: Utc::now() + chrono::Duration::milliseconds(order),
    }
}

const SHAPIRO_ASSISTANT: &str = "Checking normality.\n<python>\nimport pandas as pd\nfrom scipy import stats\ndf = pd.read_csv('iris.csv')\nw, p = stats.shapiro(df['residuals'])\nprint(f'W={w:.3f}, p={p:.3f}')\n</python>";

const SHAPIRO_TOOL_WITH_SCHEMA: &str =
    "Index(['residuals', 'fitted'])\nShape: (48, 2)\nW=0.923, p=0.016";

async fn ingest_shapiro_turn(engine: &Engine, session_id: Uuid) {
    let messages = vec![
        turn_message(session_id, DocumentRole::User, "Check normality of residuals", 0),
        turn_message(session_id, DocumentRole::Assistant, SHAPIRO_ASSISTANT, 1),
        turn_message(session_id, DocumentRole::Tool, SHAPIRO_TOOL_WITH_SCHEMA, 2),
    ];
    for message in &messages {
        engine.store.create_message(message).await.unwrap();
    }
    let history = engine.store.list_messages(session_id).await.unwrap();
    engine.ingestor.ingest_messages(session_id, &history).await.unwrap();
}

#[tokio::test]
async fn ingested_fact_is_retrievable_as_memory() {
    let (engine, _workspace) = test_engine().await;
    let session = engine.create_session(None, SessionMode::Dataset).await.unwrap();

    ingest_shapiro_turn(&engine, session.id).await;

    let outcome = engine
        .query
        .query(&QueryRequest {
            session_id: session.id,
            query: "was the normality assumption satisfied",
            n_results: 4,
            exclude_hashes: &[],
            history_doc_ids: &[],
            done_ledger: None,
            mode: SessionMode::Dataset,
        })
        .await
        .unwrap();

    assert!(outcome.documents_used >= 1);
    assert!(outcome.memory_block.starts_with("<memory>\n"));
    assert!(outcome.memory_block.ends_with("</memory>\n"));
    assert!(outcome.memory_block.contains("W=0.923"));
}

#[tokio::test]
async fn reingesting_history_writes_nothing_new() {
    let (engine, _workspace) = test_engine().await;
    let session = engine.create_session(None, SessionMode::Dataset).await.unwrap();

    ingest_shapiro_turn(&engine, session.id).await;
    let history = engine.store.list_messages(session.id).await.unwrap();
    let written = engine.ingestor.ingest_messages(session.id, &history).await.unwrap();
    assert_eq!(written, 0);
}

#[tokio::test]
async fn state_card_emitted_and_retained() {
    let (engine, _workspace) = test_engine().await;
    let session = engine.create_session(None, SessionMode::Dataset).await.unwrap();

    ingest_shapiro_turn(&engine, session.id).await;

    let cards = engine.store.list_state_documents(session.id).await.unwrap();
    assert_eq!(cards.len(), 1);
    let header = cards[0].stored_content.lines().next().unwrap();
    assert!(header.contains("dataset:iris.csv"));
    assert!(header.contains("n:48"));
    assert!(header.contains("stage:assumption_check"));
    assert!(cards[0].stored_content.contains("W=0.923"));

    // the card id is deterministic for (session, dataset, stage)
    assert_eq!(
        cards[0].id,
        statmem::state::state_card_id(session.id, "iris.csv", "assumption_check")
    );
}

#[tokio::test]
async fn history_documents_are_excluded_from_memory() {
    let (engine, _workspace) = test_engine().await;
    let session = engine.create_session(None, SessionMode::Dataset).await.unwrap();

    ingest_shapiro_turn(&engine, session.id).await;

    // find every shapiro-related document and put it in history
    let outcome = engine
        .query
        .query(&QueryRequest {
            session_id: session.id,
            query: "normality shapiro",
            n_results: 10,
            exclude_hashes: &[],
            history_doc_ids: &[],
            done_ledger: None,
            mode: SessionMode::Dataset,
        })
        .await
        .unwrap();
    assert!(outcome.documents_used >= 1);

    let all_ids: Vec<Uuid> = engine
        .store
        .metadata_search_documents(session.id, &[("role".to_string(), "fact".to_string())], 50)
        .await
        .unwrap()
        .into_iter()
        .map(|h| h.document_id)
        .collect();

    let outcome = engine
        .query
        .query(&QueryRequest {
            session_id: session.id,
            query: "normality shapiro",
            n_results: 10,
            exclude_hashes: &[],
            history_doc_ids: &all_ids,
            done_ledger: None,
            mode: SessionMode::Dataset,
        })
        .await
        .unwrap();

    // the fact itself is gone; whatever remains is not one of the history ids
    for id in &all_ids {
        assert!(!outcome.memory_block.contains(&id.to_string()));
    }
    assert!(!outcome.memory_block.contains("- assistant: Checking normality."));
}

#[tokio::test]
async fn superseding_rerun_wins_retrieval() {
    let (engine, _workspace) = test_engine().await;
    let session = engine.create_session(None, SessionMode::Dataset).await.unwrap();

    ingest_shapiro_turn(&engine, session.id).await;

    // rerun of the same test with corrected output
    let rerun = vec![
        turn_message(session.id, DocumentRole::Assistant, SHAPIRO_ASSISTANT, 10),
        turn_message(
            session.id,
            DocumentRole::Tool,
            "Index(['residuals', 'fitted'])\nShape: (48, 2)\nW=0.951, p=0.090",
            11,
        ),
    ];
    for message in &rerun {
        engine.store.create_message(message).await.unwrap();
    }
    let history = engine.store.list_messages(session.id).await.unwrap();
    engine.ingestor.ingest_messages(session.id, &history).await.unwrap();

    let outcome = engine
        .query
        .query(&QueryRequest {
            session_id: session.id,
            query: "what did the shapiro test show",
            n_results: 3,
            exclude_hashes: &[],
            history_doc_ids: &[],
            done_ledger: None,
            mode: SessionMode::Dataset,
        })
        .await
        .unwrap();

    assert!(outcome.memory_block.contains("p=0.090") || outcome.memory_block.contains("0.090"));
    assert!(!outcome.memory_block.contains("p=0.016"));
}

#[tokio::test]
async fn pdf_upload_flows_into_document_retrieval() {
    let (engine, _workspace) = test_engine().await;
    let session = engine.create_session(None, SessionMode::Dataset).await.unwrap();

    let pages = vec![
        "Study methodology and histogram of sample distribution.".to_string(),
        "Conclusions about treatment efficacy.".to_string(),
    ];
    let written = engine
        .ingestor
        .ingest_pdf(session.id, "study.pdf", &pages)
        .await
        .unwrap();
    assert_eq!(written, 2);
    assert!(engine.store.has_session_pdf_embeddings(session.id).await.unwrap());

    let outcome = engine
        .query
        .query(&QueryRequest {
            session_id: session.id,
            query: "histogram of the sample",
            n_results: 3,
            exclude_hashes: &[],
            history_doc_ids: &[],
            done_ledger: None,
            mode: SessionMode::Document,
        })
        .await
        .unwrap();

    assert!(outcome.memory_block.contains("methodology"));
}
