//! Message ingestion: pairs assistant/tool turns into deduplicated facts,
//! extracts statistical metadata, summarizes with numeric verification, and
//! writes documents plus their embedding windows.

use crate::config::IngestConfig;
use crate::document::{
    content_hash, filter_structural, normalize_text, ChatMessage, Document, DocumentMeta,
    DocumentRole,
};
use crate::embedder::Embedder;
use crate::error::{IngestError, Result};
use crate::graph::Graph;
use crate::llm::{system_message, user_message, LlmClient};
use crate::state::StateBuilder;
use crate::stats::StatMetadata;
use crate::store::Store;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Separator between the stable fact parts that feed the content hash
const FACT_HASH_SEPARATOR: &str = "\n###TOOL_OUTPUT###\n";

static PYTHON_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<python>(.*?)</python>").unwrap());

static DATASET_CLUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bdataset:\s*([\w.-]+\.\w+)|\b([\w-]+\.(?:csv|xlsx|parquet))\b").unwrap()
});

static NUMBER_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?").unwrap());

/// Process-wide memory of the dataset each session is working on
#[derive(Clone, Default)]
pub struct SessionDatasets {
    inner: Arc<RwLock<HashMap<Uuid, String>>>,
}

impl SessionDatasets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: Uuid) -> Option<String> {
        self.inner.read().expect("dataset map poisoned").get(&session_id).cloned()
    }

    pub fn remember(&self, session_id: Uuid, dataset: &str) {
        self.inner
            .write()
            .expect("dataset map poisoned")
            .insert(session_id, dataset.to_string());
    }

    pub fn forget(&self, session_id: Uuid) {
        self.inner.write().expect("dataset map poisoned").remove(&session_id);
    }
}

/// Turns conversation messages into durable retrieval documents
pub struct Ingestor {
    store: Store,
    llm: Arc<dyn LlmClient>,
    embedder: Arc<Embedder>,
    state_builder: Arc<StateBuilder>,
    graph: Graph,
    config: IngestConfig,
    session_datasets: SessionDatasets,
}

impl Ingestor {
    pub fn new(
        store: Store,
        llm: Arc<dyn LlmClient>,
        embedder: Arc<Embedder>,
        state_builder: Arc<StateBuilder>,
        graph: Graph,
        config: IngestConfig,
        session_datasets: SessionDatasets,
    ) -> Self {
        Self { store, llm, embedder, state_builder, graph, config, session_datasets }
    }

    /// Ingest a session's messages. Assistant+tool pairs become facts;
    /// everything else becomes a plain conversational document. Already
    /// ingested content short-circuits on its hash, so re-running over the
    /// full history is idempotent.
    pub async fn ingest_messages(
        &self,
        session_id: Uuid,
        messages: &[ChatMessage],
    ) -> Result<usize> {
        let mut written = 0;
        let mut i = 0;

        while i < messages.len() {
            let message = &messages[i];
            let next_is_tool = messages
                .get(i + 1)
                .map(|m| m.role == DocumentRole::Tool)
                .unwrap_or(false);

            if message.role == DocumentRole::Assistant && next_is_tool {
                let nearest_user = messages[..i]
                    .iter()
                    .rev()
                    .find(|m| m.role == DocumentRole::User)
                    .map(|m| m.content.clone());

                if self
                    .ingest_fact(session_id, message, &messages[i + 1], nearest_user)
                    .await?
                {
                    written += 1;
                }
                i += 2;
                continue;
            }

            if self.ingest_plain(session_id, message).await? {
                written += 1;
            }
            i += 1;
        }

        // advisory only; never blocks ingestion
        if let Err(e) = self.store.touch_graph_sync(session_id).await {
            warn!("Graph sync touch failed: {e}");
        }

        Ok(written)
    }

    /// One assistant/tool pair. Returns true when a new fact row was written.
    async fn ingest_fact(
        &self,
        session_id: Uuid,
        assistant: &ChatMessage,
        tool: &ChatMessage,
        nearest_user: Option<String>,
    ) -> Result<bool> {
        let assistant_text = normalize_text(&assistant.content);
        let tool_text = normalize_text(&tool.content);

        let code = extract_python(&assistant_text);
        let meta = if code.is_empty() {
            StatMetadata::default()
        } else {
            StatMetadata::extract(&code, &tool_text)
        };

        if let Some(ref dataset) = meta.dataset {
            self.session_datasets.remember(session_id, dataset);
        }

        // hash only the stable parts so prose-variant reruns coalesce
        let hash = content_hash(&format!("{code}{FACT_HASH_SEPARATOR}{tool_text}"));
        if self
            .store
            .find_document_by_hash(session_id, DocumentRole::Fact, &hash)
            .await?
            .is_some()
        {
            debug!("Fact already ingested, skipping");
            return Ok(false);
        }

        let fact_text = self.fact_text(&meta, &code, &tool_text).await;

        let stored_content = if self.config.structured_fact_content && !meta.is_empty() {
            meta.to_structured_line()
        } else {
            let mut payload = serde_json::Map::new();
            if let Some(user) = nearest_user {
                payload.insert("user".to_string(), serde_json::Value::String(user));
            }
            payload.insert(
                "assistant".to_string(),
                serde_json::Value::String(assistant_text.clone()),
            );
            payload.insert("tool".to_string(), serde_json::Value::String(tool_text.clone()));
            serde_json::Value::Object(payload).to_string()
        };

        let mut metadata: DocumentMeta = meta.to_map();
        metadata.insert("session_id".to_string(), session_id.to_string());
        metadata.insert("role".to_string(), "fact".to_string());
        metadata.insert("type".to_string(), "fact".to_string());
        metadata.insert("content_hash".to_string(), hash.clone());
        metadata.insert("assistant_hash".to_string(), content_hash(&assistant_text));
        self.enrich_dataset(session_id, &mut metadata, &assistant_text);
        let metadata = filter_structural(&metadata);

        let embedding_content = match self.embedder.ensure_token_limit(&fact_text).await {
            Ok(bounded) => bounded,
            Err(e) => {
                warn!("Token limit enforcement failed, storing unbounded text: {e}");
                fact_text.clone()
            }
        };

        let doc = Document::new(
            session_id,
            DocumentRole::Fact,
            stored_content,
            embedding_content.clone(),
            hash,
            metadata,
        );

        // an earlier run of the same test over the same variables and
        // dataset is superseded by this fact
        let superseded = self.find_prior_fact_runs(session_id, &meta).await;

        self.store.upsert_document(&doc).await?;
        self.embed_document(doc.id, &embedding_content).await?;

        for old_id in superseded {
            self.graph
                .create_edge(
                    doc.id,
                    old_id,
                    crate::document::EdgeType::Supersedes,
                    &doc.metadata,
                    session_id,
                    doc.metadata.get("dataset").map(String::as_str).unwrap_or(""),
                )
                .await;
        }

        // alias bookkeeping so later queries resolve raw spellings
        if let (Some(dataset), false) = (doc.metadata.get("dataset"), meta.variables.is_empty()) {
            for variable in &meta.variables {
                self.graph
                    .create_or_update_alias(
                        session_id,
                        dataset,
                        &variable.to_lowercase(),
                        std::slice::from_ref(variable),
                    )
                    .await;
            }
        }

        // state card synthesis is best-effort on top of the fact
        if meta.primary_test.is_some() && meta.analysis_stage.is_some() {
            let session_dataset = self.session_datasets.get(session_id);
            if let Err(e) = self
                .state_builder
                .build(session_id, &meta, &tool_text, session_dataset.as_deref())
                .await
            {
                warn!("State card synthesis failed: {e}");
            }
        }

        info!("Ingested fact {} for session {session_id}", doc.id);
        Ok(true)
    }

    /// One non-fact message, deduplicated by normalized content hash
    async fn ingest_plain(&self, session_id: Uuid, message: &ChatMessage) -> Result<bool> {
        let normalized = normalize_text(&message.content);
        if normalized.is_empty() {
            return Ok(false);
        }

        let hash = content_hash(&normalized);
        if self
            .store
            .find_document_by_hash(session_id, message.role, &hash)
            .await?
            .is_some()
        {
            return Ok(false);
        }

        let mut metadata = DocumentMeta::new();
        metadata.insert("session_id".to_string(), session_id.to_string());
        metadata.insert("role".to_string(), message.role.as_str().to_string());
        metadata.insert("content_hash".to_string(), hash.clone());
        self.enrich_dataset(session_id, &mut metadata, &normalized);
        let metadata = filter_structural(&metadata);

        let embedding_content = match self.embedder.ensure_token_limit(&normalized).await {
            Ok(bounded) => bounded,
            Err(e) => {
                warn!("Token limit enforcement failed, storing unbounded text: {e}");
                normalized.clone()
            }
        };

        let doc = Document::new(
            session_id,
            message.role,
            normalized,
            embedding_content.clone(),
            hash,
            metadata,
        );
        self.store.upsert_document(&doc).await?;
        self.embed_document(doc.id, &embedding_content).await?;
        Ok(true)
    }

    /// Ingest extracted PDF pages as embedded chunk documents
    pub async fn ingest_pdf(
        &self,
        session_id: Uuid,
        filename: &str,
        pages: &[String],
    ) -> Result<usize> {
        let normalized: Vec<String> = pages.iter().map(|p| normalize_text(p)).collect();
        let windows_per_page = self.embedder.create_windows_batch(&normalized).await?;

        let mut written = 0;
        for (page_number, (page, windows)) in
            normalized.iter().zip(windows_per_page).enumerate()
        {
            if page.is_empty() {
                continue;
            }

            let hash = content_hash(page);
            if self
                .store
                .find_document_by_hash(session_id, DocumentRole::Document, &hash)
                .await?
                .is_some()
            {
                continue;
            }

            let mut metadata = DocumentMeta::new();
            metadata.insert("session_id".to_string(), session_id.to_string());
            metadata.insert("role".to_string(), "document".to_string());
            metadata.insert("type".to_string(), "pdf".to_string());
            metadata.insert("filename".to_string(), filename.to_string());
            metadata.insert("page_number".to_string(), (page_number + 1).to_string());
            metadata.insert("chunk_index".to_string(), page_number.to_string());
            metadata.insert("content_hash".to_string(), hash.clone());

            let doc = Document::new(
                session_id,
                DocumentRole::Document,
                page.clone(),
                page.clone(),
                hash,
                filter_structural(&metadata),
            );
            self.store.upsert_document(&doc).await?;

            for window in &windows {
                self.store
                    .create_embedding(
                        doc.id,
                        window.index as i64,
                        window.start as i64,
                        window.end as i64,
                        &window.text,
                        &window.vector,
                    )
                    .await?;
            }
            written += 1;
        }

        info!("Ingested {written} PDF pages of {filename} for session {session_id}");
        Ok(written)
    }

    pub fn session_datasets(&self) -> &SessionDatasets {
        &self.session_datasets
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Earlier facts recording the same test over the same variables and
    /// dataset; lookup failures degrade to no supersession
    async fn find_prior_fact_runs(&self, session_id: Uuid, meta: &StatMetadata) -> Vec<Uuid> {
        let Some(ref primary_test) = meta.primary_test else {
            return Vec::new();
        };
        let Some(ref dataset) = meta.dataset else {
            return Vec::new();
        };

        let mut filters = vec![
            ("role".to_string(), "fact".to_string()),
            ("primary_test".to_string(), primary_test.clone()),
            ("dataset".to_string(), dataset.clone()),
        ];
        if !meta.variables.is_empty() {
            filters.push(("variables".to_string(), meta.variables.join(",")));
        }

        match self
            .store
            .metadata_search_documents(session_id, &filters, 5)
            .await
        {
            Ok(hits) => hits.into_iter().map(|h| h.document_id).collect(),
            Err(e) => {
                warn!("Prior fact lookup failed: {e}");
                Vec::new()
            }
        }
    }

    /// Searchable one-sentence fact text: deterministic template for routine
    /// stages, otherwise a numerically verified LLM summary with template
    /// fallback.
    async fn fact_text(&self, meta: &StatMetadata, code: &str, tool_output: &str) -> String {
        let template = deterministic_template(meta);

        let stage_forbids_llm = meta
            .analysis_stage
            .as_ref()
            .map(|stage| self.config.template_only_stages.contains(stage))
            .unwrap_or(false);

        if stage_forbids_llm {
            if let Some(text) = template {
                return decorate_fact_text(text, meta);
            }
        } else if let Some(summary) = self.summarize_fact(meta, code, tool_output).await {
            return decorate_fact_text(summary, meta);
        } else if let Some(text) = template {
            return decorate_fact_text(text, meta);
        }

        // nothing statistical recognized; fall back to the output itself
        let first_line = tool_output.lines().next().unwrap_or_default();
        let mut text = format!("Tool output: {first_line}");
        text.truncate(240);
        text
    }

    async fn summarize_fact(
        &self,
        meta: &StatMetadata,
        code: &str,
        tool_output: &str,
    ) -> Option<String> {
        let prompt = format!(
            "Summarize this statistical analysis step in one short sentence. \
             Use only numbers that appear verbatim in the output.\n\
             Code:\n{code}\n\nOutput:\n{tool_output}"
        );

        let messages = [
            system_message("You write terse one-sentence analysis summaries."),
            user_message(prompt),
        ];

        let summary = match self.llm.chat(&messages).await {
            Ok(summary) => normalize_text(&summary),
            Err(e) => {
                warn!("Fact summarization failed: {e}");
                return None;
            }
        };

        match verify_fact_numbers(&summary, &meta.to_map(), tool_output) {
            Ok(()) => Some(summary),
            Err(e) => {
                warn!("Summary rejected: {e}");
                None
            }
        }
    }

    /// Dataset enrichment: extraction result, explicit clue in text, or the
    /// session-remembered value, in that order. A key already present (even
    /// empty) is left alone.
    fn enrich_dataset(&self, session_id: Uuid, metadata: &mut DocumentMeta, text: &str) {
        if metadata.contains_key("dataset") {
            return;
        }
        if let Some(clue) = dataset_clue(text) {
            metadata.insert("dataset".to_string(), clue);
            return;
        }
        if let Some(remembered) = self.session_datasets.get(session_id) {
            metadata.insert("dataset".to_string(), remembered);
        }
    }

    async fn embed_document(&self, document_id: Uuid, text: &str) -> Result<()> {
        let windows = self.embedder.create_windows(text).await?;
        for window in &windows {
            self.store
                .create_embedding(
                    document_id,
                    window.index as i64,
                    window.start as i64,
                    window.end as i64,
                    &window.text,
                    &window.vector,
                )
                .await?;
        }
        Ok(())
    }
}

/// Python source between `<python>` tags; multiple blocks join with newlines
pub fn extract_python(text: &str) -> String {
    PYTHON_TAG_RE
        .captures_iter(text)
        .map(|caps| caps[1].trim().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Explicit dataset clue in free text
pub fn dataset_clue(text: &str) -> Option<String> {
    DATASET_CLUE_RE.captures(text).and_then(|caps| {
        caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str().to_string())
    })
}

/// Stage-aware deterministic fact sentence, e.g.
/// `Shapiro Wilk on residuals resulted in W=0.923 p=0.016 (significant at α=0.05).`
pub fn deterministic_template(meta: &StatMetadata) -> Option<String> {
    let test = meta.primary_test.as_ref()?;

    let mut sentence = title_words(test);
    if !meta.variables.is_empty() {
        sentence.push_str(&format!(" on {}", meta.variables.join(", ")));
    }
    sentence.push_str(" resulted in");

    let mut parts = Vec::new();
    if let Some(ref stat) = meta.test_statistic {
        parts.push(stat.clone());
    }
    if let Some(ref p) = meta.p_value {
        parts.push(format!("p={p}"));
    }
    if parts.is_empty() {
        sentence.push_str(" no reported statistic");
    } else {
        sentence.push(' ');
        sentence.push_str(&parts.join(" "));
    }

    if let Some(sig) = meta.sig_at_05 {
        if sig {
            sentence.push_str(" (significant at α=0.05)");
        } else {
            sentence.push_str(" (not significant at α=0.05)");
        }
    }
    sentence.push('.');
    Some(sentence)
}

/// Append the inline human-readable tag block to a fact sentence
fn decorate_fact_text(sentence: String, meta: &StatMetadata) -> String {
    let mut tags = Vec::new();
    if let Some(ref t) = meta.primary_test {
        tags.push(format!("test:{t}"));
    }
    if let Some(ref s) = meta.analysis_stage {
        tags.push(format!("stage:{s}"));
    }
    if let Some(ref d) = meta.dataset {
        tags.push(format!("dataset:{d}"));
    }
    if tags.is_empty() {
        sentence
    } else {
        format!("{sentence} [{}]", tags.join(" | "))
    }
}

/// Accept a generated fact only when every numeric token in it appears
/// verbatim in a metadata value or in the raw tool output. Fails with the
/// first offending token otherwise.
pub fn verify_fact_numbers(
    fact: &str,
    metadata: &HashMap<String, String>,
    tool_output: &str,
) -> std::result::Result<(), IngestError> {
    for m in NUMBER_TOKEN_RE.find_iter(fact) {
        let token = m.as_str().trim_end_matches(['.', ',', ')']);
        if token.is_empty() {
            continue;
        }

        let in_metadata = metadata.values().any(|v| v.contains(token));
        let in_output = tool_output.contains(token);
        if !in_metadata && !in_output {
            return Err(IngestError::NumericVerification(token.to_string()));
        }
    }
    Ok(())
}

/// `shapiro-wilk` -> `Shapiro Wilk`
fn title_words(name: &str) -> String {
    name.split(['-', '_', ' '])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
