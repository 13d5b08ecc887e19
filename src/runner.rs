//! Streaming agent turn orchestration: prompt assembly with memory, fence-
//! aware stream stopping, sandboxed code execution rounds, SSE event
//! emission, per-session run exclusivity and deferred ingestion.

use crate::config::{IngestConfig, RunnerConfig};
use crate::document::{content_hash, ChatMessage, DocumentRole, Session, SessionMode};
use crate::error::{EngineError, Result};
use crate::executor::CodeExecutor;
use crate::ingest::{dataset_clue, Ingestor};
use crate::llm::{
    assistant_message, system_message, tool_message, user_message, LlmClient, Message,
};
use crate::query::{HybridQuery, QueryRequest};
use crate::store::Store;
use chrono::Utc;
use futures::StreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

const OPEN_FENCE: &str = "```python";
const CLOSE_FENCE: &str = "```";

static FENCED_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```python\s*\n?(.*?)```").unwrap());

static GENERATED_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[\w./-]+\.(?:html|png|svg)\b").unwrap());

/// SSE event envelope sent to the chat client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SseEvent {
    ConnectionEstablished,
    RemoveLoader,
    CreateContainer,
    Chunk { content: String },
    FileAppendHtml { content: String },
    End,
    Error { content: String },
}

/// Rolling-window state machine that stops generation at the first complete
/// ```python fence. The window is bounded so per-chunk work stays constant.
pub struct FenceDetector {
    window: String,
    /// Bytes dropped from the window front
    trimmed: usize,
    /// Total bytes fed so far
    streamed: usize,
    /// Absolute byte position of the opening fence, once seen
    open_at: Option<usize>,
    max_window: usize,
}

/// Result of feeding one delta
#[derive(Debug, PartialEq)]
pub struct FenceScan {
    /// Portion of the delta to emit (truncated at the closing fence)
    pub emit: String,
    /// Generation should stop after this delta
    pub stop: bool,
}

impl FenceDetector {
    pub fn new(max_window: usize) -> Self {
        Self {
            window: String::new(),
            trimmed: 0,
            streamed: 0,
            open_at: None,
            max_window: max_window.max(OPEN_FENCE.len() * 2),
        }
    }

    pub fn feed(&mut self, delta: &str) -> FenceScan {
        let delta_start = self.streamed;
        self.window.push_str(delta);
        self.streamed += delta.len();

        if self.open_at.is_none() {
            if let Some(rel) = self.window.find(OPEN_FENCE) {
                self.open_at = Some(self.trimmed + rel);
            }
        }

        let mut scan = FenceScan { emit: delta.to_string(), stop: false };

        if let Some(open_abs) = self.open_at {
            let search_abs = open_abs + OPEN_FENCE.len();
            let rel_from = search_abs.saturating_sub(self.trimmed);
            if rel_from <= self.window.len() {
                if let Some(rel_close) = self.window[rel_from..].find(CLOSE_FENCE) {
                    let close_end = self.trimmed + rel_from + rel_close + CLOSE_FENCE.len();
                    scan.emit = if close_end > delta_start {
                        delta[..(close_end - delta_start).min(delta.len())].to_string()
                    } else {
                        String::new()
                    };
                    scan.stop = true;
                }
            }
        }

        if !scan.stop && self.window.len() > self.max_window {
            let mut cut = self.window.len() - self.max_window;
            while !self.window.is_char_boundary(cut) {
                cut += 1;
            }
            self.window.drain(..cut);
            self.trimmed += cut;
        }

        scan
    }
}

/// Extract the code inside the first complete fence, shedding an optional
/// `<python>` wrapper the prompt format asks for
pub fn extract_fenced_code(text: &str) -> Option<String> {
    let inner = FENCED_CODE_RE.captures(text)?.get(1)?.as_str().trim();
    let inner = inner
        .strip_prefix("<python>")
        .map(|s| s.strip_suffix("</python>").unwrap_or(s))
        .unwrap_or(inner)
        .trim();
    (!inner.is_empty()).then(|| inner.to_string())
}

struct RunEntry {
    user_message_id: Uuid,
    cancel_tx: watch::Sender<bool>,
}

/// Per-session run bookkeeping enforcing at most one active run
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<Uuid, RunEntry>>>,
}

/// Live run handle; dropping it releases the session slot
pub struct RunGuard {
    registry: SessionRegistry,
    session_id: Uuid,
    cancel_rx: watch::Receiver<bool>,
}

impl RunGuard {
    pub fn cancel_receiver(&self) -> watch::Receiver<bool> {
        self.cancel_rx.clone()
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry
            .inner
            .lock()
            .expect("registry poisoned")
            .remove(&self.session_id);
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the session slot; `RunActive` when a run is already live
    pub fn begin(&self, session_id: Uuid, user_message_id: Uuid) -> Result<RunGuard> {
        let mut map = self.inner.lock().expect("registry poisoned");
        if map.contains_key(&session_id) {
            return Err(EngineError::RunActive(session_id));
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        map.insert(session_id, RunEntry { user_message_id, cancel_tx });
        Ok(RunGuard { registry: self.clone(), session_id, cancel_rx })
    }

    /// The live run's user message id, if any
    pub fn status(&self, session_id: Uuid) -> Option<Uuid> {
        self.inner
            .lock()
            .expect("registry poisoned")
            .get(&session_id)
            .map(|e| e.user_message_id)
    }

    /// Cancel the live run; true when a run was signalled
    pub fn stop(&self, session_id: Uuid) -> bool {
        self.inner
            .lock()
            .expect("registry poisoned")
            .get(&session_id)
            .map(|e| e.cancel_tx.send(true).is_ok())
            .unwrap_or(false)
    }
}

/// Orchestrates one streamed agent turn per user message
pub struct AgentRunner {
    store: Store,
    llm: Arc<dyn LlmClient>,
    query: Arc<HybridQuery>,
    ingestor: Arc<Ingestor>,
    executor: Arc<dyn CodeExecutor>,
    registry: SessionRegistry,
    config: RunnerConfig,
    ingest_config: IngestConfig,
}

impl AgentRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        llm: Arc<dyn LlmClient>,
        query: Arc<HybridQuery>,
        ingestor: Arc<Ingestor>,
        executor: Arc<dyn CodeExecutor>,
        registry: SessionRegistry,
        config: RunnerConfig,
        ingest_config: IngestConfig,
    ) -> Self {
        Self { store, llm, query, ingestor, executor, registry, config, ingest_config }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Run the agent turn for a persisted user message, emitting SSE events
    /// into `events`. A dropped receiver means the client disconnected and
    /// silently ends emission.
    pub async fn run_turn(
        &self,
        session_id: Uuid,
        user_message_id: Uuid,
        events: mpsc::Sender<SseEvent>,
    ) -> Result<()> {
        let guard = self.registry.begin(session_id, user_message_id)?;
        let mut cancel_rx = guard.cancel_receiver();

        let _ = events.send(SseEvent::ConnectionEstablished).await;

        let session = self.store.get_session(session_id).await?;
        let history = self.store.list_messages(session_id).await?;
        let user_text = self.store.get_message(user_message_id).await?.content;

        let _ = events.send(SseEvent::RemoveLoader).await;
        let _ = events.send(SseEvent::CreateContainer).await;

        if let Some(gate) = self.gating_message(&session, &history, &user_text).await {
            self.persist_message(session_id, DocumentRole::Assistant, &gate).await?;
            let _ = events.send(SseEvent::Chunk { content: gate }).await;
            let _ = events.send(SseEvent::End).await;
            return Ok(());
        }

        let mut prompt = self.build_prompt(&session, &history, &user_text).await;

        let mut cancelled = false;
        for round in 0..self.config.max_exec_rounds {
            let mut stream = self.llm.chat_stream(&prompt).await?;
            let mut detector = FenceDetector::new(self.config.fence_window_bytes);
            let mut assistant_text = String::new();
            let mut stopped_at_fence = false;

            loop {
                tokio::select! {
                    changed = cancel_rx.changed() => {
                        if changed.is_ok() && *cancel_rx.borrow() {
                            info!("Run cancelled for session {session_id}");
                            cancelled = true;
                            break;
                        }
                    }
                    item = stream.next() => match item {
                        Some(Ok(delta)) => {
                            let scan = detector.feed(&delta);
                            if !scan.emit.is_empty() {
                                assistant_text.push_str(&scan.emit);
                                let _ = events
                                    .send(SseEvent::Chunk { content: scan.emit })
                                    .await;
                            }
                            if scan.stop {
                                stopped_at_fence = true;
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            let _ = events
                                .send(SseEvent::Error { content: "model stream failed".to_string() })
                                .await;
                            return Err(e);
                        }
                        None => break,
                    }
                }
            }
            // dropping the stream stops generation on the backend
            drop(stream);

            if !assistant_text.is_empty() {
                self.persist_message(session_id, DocumentRole::Assistant, &assistant_text)
                    .await?;
                prompt.push(assistant_message(&assistant_text));
            }

            if cancelled {
                break;
            }

            let code = if stopped_at_fence { extract_fenced_code(&assistant_text) } else { None };
            let Some(code) = code else { break };

            debug!("Executing fenced code (round {round}) for session {session_id}");
            let tool_output = match self.executor.execute(session_id, &code).await {
                Ok(output) => output,
                Err(e) => {
                    warn!("Executor failed: {e}");
                    format!("Error: {e}")
                }
            };

            self.persist_message(session_id, DocumentRole::Tool, &tool_output).await?;
            let _ = events
                .send(SseEvent::Chunk { content: format!("\n{tool_output}\n") })
                .await;

            // surface generated files as embeddable fragments
            for m in GENERATED_FILE_RE.find_iter(&tool_output) {
                let file = m.as_str().trim_start_matches("./");
                let fragment = format!(
                    "<a href=\"/workspaces/{session_id}/{file}\" target=\"_blank\">{file}</a>"
                );
                let _ = events.send(SseEvent::FileAppendHtml { content: fragment }).await;
            }

            prompt.push(tool_message(&tool_output));
        }

        let _ = events.send(SseEvent::End).await;

        if session.title.is_none() {
            self.spawn_title_generation(session_id, user_text);
        }
        self.schedule_ingestion(session_id);

        Ok(())
    }

    /// Degraded-UX fallbacks that answer without invoking the model
    async fn gating_message(
        &self,
        session: &Session,
        history: &[ChatMessage],
        user_text: &str,
    ) -> Option<String> {
        let lower = user_text.to_lowercase();
        let looks_document_oriented = ["pdf", "document", "page", "report"]
            .iter()
            .any(|cue| lower.contains(cue));

        let has_pdf = self
            .store
            .has_session_pdf_embeddings(session.id)
            .await
            .unwrap_or(false);

        if looks_document_oriented && !has_pdf && session.mode != SessionMode::Dataset {
            return Some(
                "Your document is still being indexed. Give it a moment and ask again."
                    .to_string(),
            );
        }

        let has_dataset_file = self.ingestor.session_datasets().get(session.id).is_some();
        let user_turns = history.iter().filter(|m| m.role == DocumentRole::User).count();
        if user_turns <= 1
            && !has_pdf
            && !has_dataset_file
            && !looks_document_oriented
            && dataset_clue(user_text).is_none()
        {
            return Some(
                "Upload a CSV or PDF, or tell me which dataset to analyze, and I will get \
                 started."
                    .to_string(),
            );
        }

        None
    }

    /// System template + optional memory block + conversation history
    async fn build_prompt(
        &self,
        session: &Session,
        history: &[ChatMessage],
        user_text: &str,
    ) -> Vec<Message> {
        let exclude_hashes: Vec<String> =
            history.iter().map(|m| content_hash(&m.content)).collect();
        let history_doc_ids = self
            .store
            .find_document_ids_by_content_hash(session.id, &exclude_hashes)
            .await
            .unwrap_or_default();

        let memory = match self
            .query
            .query(&QueryRequest {
                session_id: session.id,
                query: user_text,
                n_results: self.config.memory_results,
                exclude_hashes: &exclude_hashes,
                history_doc_ids: &history_doc_ids,
                done_ledger: None,
                mode: session.mode,
            })
            .await
        {
            Ok(outcome) => outcome.memory_block,
            Err(e) => {
                warn!("Memory query failed, continuing without context: {e}");
                String::new()
            }
        };

        let system = if memory.is_empty() {
            self.config.system_prompt.clone()
        } else {
            format!("{}\n\n{memory}", self.config.system_prompt)
        };

        let mut prompt = vec![system_message(system)];
        for message in history {
            prompt.push(match message.role {
                DocumentRole::Assistant => assistant_message(&message.content),
                DocumentRole::Tool => tool_message(&message.content),
                _ => user_message(&message.content),
            });
        }
        prompt
    }

    async fn persist_message(
        &self,
        session_id: Uuid,
        role: DocumentRole,
        content: &str,
    ) -> Result<()> {
        self.store
            .create_message(&ChatMessage {
                id: Uuid::new_v4(),
                session_id,
                role,
                content: content.to_string(),
                created_at: Utc::now(),
            })
            .await
    }

    /// Fire-and-forget session title from the first user turn
    fn spawn_title_generation(&self, session_id: Uuid, user_text: String) {
        let llm = Arc::clone(&self.llm);
        let store = self.store.clone();
        tokio::spawn(async move {
            let prompt = [
                system_message("Reply with a plain 3-6 word title for this conversation."),
                user_message(user_text),
            ];
            match tokio::time::timeout(Duration::from_secs(10), llm.chat(&prompt)).await {
                Ok(Ok(title)) => {
                    let title = title.trim().trim_matches('"');
                    if !title.is_empty() {
                        if let Err(e) = store.set_session_title(session_id, title).await {
                            warn!("Title persist failed: {e}");
                        }
                    }
                }
                Ok(Err(e)) => warn!("Title generation failed: {e}"),
                Err(_) => warn!("Title generation timed out"),
            }
        });
    }

    /// Detached post-turn ingestion with bounded retries; operates on
    /// persisted state, so it survives the turn's cancellation
    pub fn schedule_ingestion(&self, session_id: Uuid) {
        let store = self.store.clone();
        let ingestor = Arc::clone(&self.ingestor);
        let attempts = self.ingest_config.max_attempts.max(1);
        let deadline = Duration::from_secs(self.ingest_config.task_timeout_secs);

        tokio::spawn(async move {
            let work = Self::ingest_with_retries(store, ingestor, session_id, attempts);
            if tokio::time::timeout(deadline, work).await.is_err() {
                warn!("Ingestion task timed out for session {session_id}");
            }
        });
    }

    async fn ingest_with_retries(
        store: Store,
        ingestor: Arc<Ingestor>,
        session_id: Uuid,
        attempts: u32,
    ) {
        for attempt in 0..attempts {
            let messages = match store.list_messages(session_id).await {
                Ok(messages) => messages,
                Err(e) => {
                    warn!("Ingestion message load failed: {e}");
                    Vec::new()
                }
            };

            match ingestor.ingest_messages(session_id, &messages).await {
                Ok(written) => {
                    debug!("Ingestion wrote {written} documents for session {session_id}");
                    return;
                }
                Err(e) => {
                    warn!("Ingestion attempt {attempt} failed: {e}");
                    if attempt + 1 < attempts {
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                    }
                }
            }
        }
        warn!("Ingestion abandoned for session {session_id} after {attempts} attempts");
    }

    /// Synchronous ingestion entry point for callers that need completion
    pub async fn ingest_now(&self, session_id: Uuid) -> Result<usize> {
        let messages = self.store.list_messages(session_id).await?;
        self.ingestor.ingest_messages(session_id, &messages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbeddingConfig, RetrievalConfig, StoreConfig};
    use crate::embedder::Embedder;
    use crate::graph::Graph;
    use crate::ingest::SessionDatasets;
    use crate::state::StateBuilder;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    // ---- fence detector ----

    #[test]
    fn test_no_fence_passes_through() {
        let mut detector = FenceDetector::new(2048);
        let scan = detector.feed("plain prose without code");
        assert_eq!(scan.emit, "plain prose without code");
        assert!(!scan.stop);
    }

    #[test]
    fn test_fence_in_single_delta_truncates_after_close() {
        let mut detector = FenceDetector::new(2048);
        let scan = detector.feed("Look:\n```python\nprint(1)\n``` and this hallucinated output");
        assert!(scan.stop);
        assert_eq!(scan.emit, "Look:\n```python\nprint(1)\n```");
    }

    #[test]
    fn test_fence_spanning_deltas() {
        let mut detector = FenceDetector::new(2048);
        assert!(!detector.feed("starting ``").stop);
        assert!(!detector.feed("`python\nx = ").stop);
        let scan = detector.feed("1\n``` trailing");
        assert!(scan.stop);
        assert_eq!(scan.emit, "1\n```");
    }

    #[test]
    fn test_close_split_across_deltas() {
        let mut detector = FenceDetector::new(2048);
        assert!(!detector.feed("```python\ncode\n`").stop);
        let scan = detector.feed("`` extra");
        assert!(scan.stop);
        assert_eq!(scan.emit, "``");
    }

    #[test]
    fn test_stray_close_before_open_is_ignored() {
        let mut detector = FenceDetector::new(2048);
        assert!(!detector.feed("see ``` alone\n").stop);
        assert!(!detector.feed("```python\nx = 1\n").stop);
        assert!(detector.feed("```").stop);
    }

    #[test]
    fn test_window_stays_bounded() {
        let mut detector = FenceDetector::new(256);
        for _ in 0..100 {
            let scan = detector.feed(&"a".repeat(64));
            assert!(!scan.stop);
        }
        assert!(detector.window.len() <= 256);
        // fence after heavy streaming still detected
        assert!(!detector.feed("```python\nx\n").stop);
        assert!(detector.feed("```").stop);
    }

    #[test]
    fn test_extract_fenced_code_strips_python_tags() {
        let text = "intro\n```python\n<python>\nprint('hi')\n</python>\n```";
        assert_eq!(extract_fenced_code(text).as_deref(), Some("print('hi')"));

        let bare = "```python\nx = 1\n```";
        assert_eq!(extract_fenced_code(bare).as_deref(), Some("x = 1"));

        assert_eq!(extract_fenced_code("no fences"), None);
    }

    // ---- session registry ----

    #[test]
    fn test_at_most_one_run_per_session() {
        let registry = SessionRegistry::new();
        let session = Uuid::new_v4();
        let msg1 = Uuid::new_v4();

        let guard = registry.begin(session, msg1).unwrap();
        assert!(matches!(
            registry.begin(session, Uuid::new_v4()),
            Err(EngineError::RunActive(_))
        ));
        assert_eq!(registry.status(session), Some(msg1));

        drop(guard);
        assert_eq!(registry.status(session), None);
        assert!(registry.begin(session, Uuid::new_v4()).is_ok());
    }

    #[test]
    fn test_stop_signals_cancellation() {
        let registry = SessionRegistry::new();
        let session = Uuid::new_v4();
        let guard = registry.begin(session, Uuid::new_v4()).unwrap();
        let cancel_rx = guard.cancel_receiver();

        assert!(!*cancel_rx.borrow());
        assert!(registry.stop(session));
        assert!(*cancel_rx.borrow());

        assert!(!registry.stop(Uuid::new_v4()));
    }

    #[test]
    fn test_independent_sessions_run_concurrently() {
        let registry = SessionRegistry::new();
        let _a = registry.begin(Uuid::new_v4(), Uuid::new_v4()).unwrap();
        let _b = registry.begin(Uuid::new_v4(), Uuid::new_v4()).unwrap();
    }

    // ---- run_turn integration ----

    /// Streams scripted deltas per round; embeds on a fixed axis
    struct ScriptedLlm {
        scripts: StdMutex<VecDeque<Vec<&'static str>>>,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat(&self, _m: &[Message]) -> Result<String> {
            Ok("Residual Normality Check".to_string())
        }
        async fn chat_stream(&self, _m: &[Message]) -> Result<BoxStream<'static, Result<String>>> {
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected extra stream round");
            Ok(futures::stream::iter(
                script.into_iter().map(|s| Ok(s.to_string())).collect::<Vec<_>>(),
            )
            .boxed())
        }
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]).collect())
        }
        async fn count_tokens(&self, text: &str) -> Result<usize> {
            Ok(text.split_whitespace().count().max(1))
        }
    }

    #[derive(Default)]
    struct RecordingExecutor {
        calls: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl CodeExecutor for RecordingExecutor {
        async fn execute(&self, _session_id: Uuid, code: &str) -> Result<String> {
            self.calls.lock().unwrap().push(code.to_string());
            Ok("W=0.923, p=0.016".to_string())
        }
        async fn cleanup(&self, _session_id: Uuid) -> Result<()> {
            Ok(())
        }
    }

    async fn runner_with(
        scripts: Vec<Vec<&'static str>>,
    ) -> (AgentRunner, Store, Arc<RecordingExecutor>, Uuid) {
        let store = Store::connect(StoreConfig {
            database_url: "sqlite::memory:".to_string(),
            embedding_dimension: 8,
            ..Default::default()
        })
        .await
        .unwrap();

        let session = Session {
            id: Uuid::new_v4(),
            user_id: None,
            workspace_path: "/tmp/ws".to_string(),
            mode: SessionMode::Dataset,
            title: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.create_session(&session).await.unwrap();

        let llm: Arc<dyn LlmClient> =
            Arc::new(ScriptedLlm { scripts: StdMutex::new(scripts.into()) });
        let embedder = Arc::new(Embedder::new(llm.clone(), EmbeddingConfig::default()));
        let graph = Graph::new(store.clone());
        let state_builder = Arc::new(StateBuilder::new(store.clone(), embedder.clone()));
        let ingestor = Arc::new(Ingestor::new(
            store.clone(),
            llm.clone(),
            embedder,
            state_builder,
            graph.clone(),
            IngestConfig::default(),
            SessionDatasets::new(),
        ));
        let query = Arc::new(HybridQuery::new(
            store.clone(),
            llm.clone(),
            graph,
            RetrievalConfig::default(),
        ));
        let executor = Arc::new(RecordingExecutor::default());

        let runner = AgentRunner::new(
            store.clone(),
            llm,
            query,
            ingestor,
            executor.clone(),
            SessionRegistry::new(),
            RunnerConfig::default(),
            IngestConfig::default(),
        );
        (runner, store, executor, session.id)
    }

    async fn seed_user_message(store: &Store, session_id: Uuid, content: &str) -> Uuid {
        let message = ChatMessage {
            id: Uuid::new_v4(),
            session_id,
            role: DocumentRole::User,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        store.create_message(&message).await.unwrap();
        message.id
    }

    async fn collect_events(mut rx: mpsc::Receiver<SseEvent>) -> Vec<SseEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = event == SseEvent::End;
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn test_turn_with_code_execution_round() {
        let (runner, store, executor, session_id) = runner_with(vec![
            vec![
                "Checking normality.\n```python\n<python>\n",
                "print('shapiro')\n</python>\n``` ignored tail",
            ],
            vec!["The residuals look non-normal (p=0.016)."],
        ])
        .await;

        let user_id = seed_user_message(&store, session_id, "Check normality in iris.csv").await;
        let (tx, rx) = mpsc::channel(64);
        runner.run_turn(session_id, user_id, tx).await.unwrap();
        let events = collect_events(rx).await;

        assert_eq!(events.first(), Some(&SseEvent::ConnectionEstablished));
        assert!(events.contains(&SseEvent::RemoveLoader));
        assert!(events.contains(&SseEvent::CreateContainer));
        assert_eq!(events.last(), Some(&SseEvent::End));

        // the hallucinated tail after the closing fence was never emitted
        let streamed: String = events
            .iter()
            .filter_map(|e| match e {
                SseEvent::Chunk { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert!(streamed.contains("```python"));
        assert!(!streamed.contains("ignored tail"));
        assert!(streamed.contains("W=0.923, p=0.016"));
        assert!(streamed.contains("non-normal"));

        // executor saw the unwrapped code
        assert_eq!(executor.calls.lock().unwrap().as_slice(), ["print('shapiro')"]);

        // assistant and tool turns are persisted in order
        let messages = store.list_messages(session_id).await.unwrap();
        let roles: Vec<DocumentRole> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                DocumentRole::User,
                DocumentRole::Assistant,
                DocumentRole::Tool,
                DocumentRole::Assistant,
            ]
        );

        // the slot is free again
        assert_eq!(runner.registry().status(session_id), None);
    }

    #[tokio::test]
    async fn test_turn_without_closing_fence_runs_no_code() {
        let (runner, store, executor, session_id) = runner_with(vec![vec![
            "Just prose, no executable code at all.",
        ]])
        .await;

        let user_id =
            seed_user_message(&store, session_id, "Describe the columns of iris.csv").await;
        let (tx, rx) = mpsc::channel(64);
        runner.run_turn(session_id, user_id, tx).await.unwrap();
        let events = collect_events(rx).await;

        assert!(executor.calls.lock().unwrap().is_empty());
        let streamed: String = events
            .iter()
            .filter_map(|e| match e {
                SseEvent::Chunk { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(streamed, "Just prose, no executable code at all.");
    }

    #[tokio::test]
    async fn test_onboarding_gate_skips_model() {
        // no scripts: any stream call would panic
        let (runner, store, executor, session_id) = runner_with(vec![]).await;

        let user_id = seed_user_message(&store, session_id, "hi there").await;
        let (tx, rx) = mpsc::channel(64);
        runner.run_turn(session_id, user_id, tx).await.unwrap();
        let events = collect_events(rx).await;

        assert!(executor.calls.lock().unwrap().is_empty());
        assert!(events.iter().any(|e| matches!(
            e,
            SseEvent::Chunk { content } if content.contains("Upload a CSV or PDF")
        )));
        assert_eq!(events.last(), Some(&SseEvent::End));
    }

    #[tokio::test]
    async fn test_second_run_rejected_while_first_active() {
        let (runner, store, _executor, session_id) = runner_with(vec![]).await;
        let user_id = seed_user_message(&store, session_id, "hello").await;

        let _guard = runner.registry().begin(session_id, user_id).unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let err = runner.run_turn(session_id, user_id, tx).await.unwrap_err();
        assert!(matches!(err, EngineError::RunActive(_)));
    }

    #[tokio::test]
    async fn test_ingest_now_after_turn() {
        let (runner, store, _executor, session_id) = runner_with(vec![
            vec!["```python\n<python>\ndf = pd.read_csv('iris.csv')\nstats.shapiro(df['residuals'])\n</python>\n```"],
            vec!["done"],
        ])
        .await;

        let user_id = seed_user_message(&store, session_id, "Check normality in iris.csv").await;
        let (tx, rx) = mpsc::channel(64);
        runner.run_turn(session_id, user_id, tx).await.unwrap();
        collect_events(rx).await;

        runner.ingest_now(session_id).await.unwrap();

        // the assistant/tool pair became a fact (strict single-row
        // idempotency is covered by the ingest module's own tests)
        let hits = store
            .metadata_search_documents(
                session_id,
                &[("role".to_string(), "fact".to_string())],
                10,
            )
            .await
            .unwrap();
        assert!(!hits.is_empty());
    }
}
