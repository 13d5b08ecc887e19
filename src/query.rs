//! Hybrid dense+lexical retrieval: candidate gathering, graph-aware
//! filtering, scoring, three-stage post-filtering and memory block emission.

use crate::config::RetrievalConfig;
use crate::document::{content_hash, DocumentMeta, SearchHit, SessionMode};
use crate::error::Result;
use crate::graph::Graph;
use crate::llm::LlmClient;
use crate::store::Store;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Multiplier applied when candidate content is a near-duplicate of the query
const ECHO_PENALTY: f32 = 0.1;

/// Multiplier applied to error-bearing content for non-error queries
const ERROR_PENALTY: f32 = 0.5;

/// Cumulative cap on metadata hint boosts
const HINT_BOOST_CAP: f32 = 0.4;

/// Maximum 5-gram containment between two emitted candidates
const SHINGLE_CONTAINMENT_LIMIT: f32 = 0.9;

/// Length-overlap fraction above which a candidate counts as an echo
const ECHO_OVERLAP: f32 = 0.85;

/// One query against a session's memory
#[derive(Debug, Clone)]
pub struct QueryRequest<'a> {
    pub session_id: Uuid,
    pub query: &'a str,
    pub n_results: usize,
    /// Content hashes the caller already holds (prompt history)
    pub exclude_hashes: &'a [String],
    /// Document ids already present in the prompt
    pub history_doc_ids: &'a [Uuid],
    /// Optional textual ledger of completed steps
    pub done_ledger: Option<&'a str>,
    pub mode: SessionMode,
}

/// Result of a memory query
#[derive(Debug, Clone, Default)]
pub struct QueryOutcome {
    /// `<memory>…</memory>` block, empty when nothing qualified
    pub memory_block: String,
    /// Distinct documents inside the block
    pub documents_used: usize,
}

#[derive(Debug, Clone)]
struct Candidate {
    document_id: Uuid,
    /// Parent id for chunks and summaries, own id otherwise
    lookup_id: Uuid,
    metadata: DocumentMeta,
    content: String,
    semantic: f32,
    lexical: f32,
    has_semantic: bool,
    has_bm25: bool,
    score: f32,
}

impl Candidate {
    fn role(&self) -> &str {
        self.metadata.get("role").map(String::as_str).unwrap_or("")
    }

    fn is_summary(&self) -> bool {
        self.role() == "summary"
            || self.metadata.get("type").map(String::as_str) == Some("summary")
    }
}

/// Hybrid retrieval engine
pub struct HybridQuery {
    store: Store,
    llm: Arc<dyn LlmClient>,
    graph: Graph,
    config: RetrievalConfig,
}

impl HybridQuery {
    pub fn new(store: Store, llm: Arc<dyn LlmClient>, graph: Graph, config: RetrievalConfig) -> Self {
        Self { store, llm, graph, config }
    }

    /// Answer a query with a deduplicated memory block
    pub async fn query(&self, request: &QueryRequest<'_>) -> Result<QueryOutcome> {
        if request.query.trim().is_empty() || request.n_results == 0 {
            return Ok(QueryOutcome::default());
        }

        let mut candidates = self.gather_candidates(request).await?;
        self.validate_against_graph(&mut candidates).await;
        self.score_candidates(&mut candidates, request);
        let kept = self.post_filter(candidates, request).await;
        let kept = self.apply_supports_boost(kept).await;

        let outcome = emit_memory_block(&kept, request);
        if outcome.documents_used > 0 {
            return Ok(outcome);
        }

        if self.config.enable_metadata_fallback {
            return self.metadata_fallback(request).await;
        }
        Ok(QueryOutcome::default())
    }

    /// Dense and lexical candidate gathering merged per document
    async fn gather_candidates(&self, request: &QueryRequest<'_>) -> Result<Vec<Candidate>> {
        let limit = (request.n_results * 4).clamp(20, self.config.max_hybrid_candidates);

        let dense = match self.llm.embed(request.query).await {
            Ok(vector) => {
                let hits = self
                    .store
                    .vector_search_documents(&vector, limit, request.session_id, request.exclude_hashes)
                    .await?;
                hits.into_iter()
                    .filter(|h| h.score >= self.config.semantic_similarity_threshold)
                    .collect()
            }
            Err(e) => {
                warn!("Query embedding failed, lexical arm only: {e}");
                Vec::new()
            }
        };

        let lexical: Vec<SearchHit> = self
            .store
            .search_documents_bm25(request.query, limit, request.session_id, request.exclude_hashes)
            .await?
            .into_iter()
            .filter(|h| h.score + h.exact_bonus >= self.config.bm25_score_threshold)
            .collect();

        let mut merged: HashMap<Uuid, Candidate> = HashMap::new();

        for hit in dense {
            let entry = merged.entry(hit.document_id).or_insert_with(|| Candidate {
                document_id: hit.document_id,
                lookup_id: hit.document_id,
                metadata: hit.metadata.clone(),
                content: hit.content.clone(),
                semantic: 0.0,
                lexical: 0.0,
                has_semantic: false,
                has_bm25: false,
                score: 0.0,
            });
            if hit.score > entry.semantic {
                entry.semantic = hit.score;
                entry.content = hit.content;
            }
            entry.has_semantic = true;
        }

        for hit in lexical {
            let entry = merged.entry(hit.document_id).or_insert_with(|| Candidate {
                document_id: hit.document_id,
                lookup_id: hit.document_id,
                metadata: hit.metadata.clone(),
                content: hit.content.clone(),
                semantic: 0.0,
                lexical: 0.0,
                has_semantic: false,
                has_bm25: false,
                score: 0.0,
            });
            let lex = hit.score + hit.exact_bonus;
            if lex > entry.lexical {
                entry.lexical = lex;
            }
            entry.has_bm25 = true;
        }

        let mut candidates: Vec<Candidate> = merged.into_values().collect();

        // chunks and summaries surface their parent's body
        let parent_ids: Vec<Uuid> = candidates
            .iter()
            .filter_map(|c| {
                matches!(
                    c.metadata.get("type").map(String::as_str),
                    Some("chunk") | Some("summary") | Some("document_chunk")
                )
                .then(|| {
                    c.metadata
                        .get("parent_document_id")
                        .and_then(|v| Uuid::parse_str(v).ok())
                })
                .flatten()
            })
            .collect();

        if !parent_ids.is_empty() {
            let parents = self.store.get_documents_batch(&parent_ids).await?;
            let by_id: HashMap<Uuid, String> =
                parents.into_iter().map(|d| (d.id, d.stored_content)).collect();

            for candidate in &mut candidates {
                if let Some(parent_id) = candidate
                    .metadata
                    .get("parent_document_id")
                    .and_then(|v| Uuid::parse_str(v).ok())
                {
                    candidate.lookup_id = parent_id;
                    if let Some(body) = by_id.get(&parent_id) {
                        candidate.content = body.clone();
                    }
                    // a missing parent is non-fatal; the chunk text stands in
                }
            }
        }

        let in_both = candidates.iter().filter(|c| c.has_semantic && c.has_bm25).count();
        debug!("Gathered {} merged candidates ({in_both} in both arms)", candidates.len());
        Ok(candidates)
    }

    /// Drop candidates whose resolved lookup id is superseded or blocked
    async fn validate_against_graph(&self, candidates: &mut Vec<Candidate>) {
        let mut kept = Vec::with_capacity(candidates.len());
        for candidate in candidates.drain(..) {
            if self.graph.is_superseded(candidate.lookup_id).await
                || self.graph.is_blocked(candidate.lookup_id).await
            {
                debug!("Dropping graph-invalidated candidate {}", candidate.document_id);
                continue;
            }
            kept.push(candidate);
        }
        *candidates = kept;
    }

    /// Weighted hybrid score with mode boosts, error penalty, metadata hint
    /// boost and echo penalty
    fn score_candidates(&self, candidates: &mut [Candidate], request: &QueryRequest<'_>) {
        let max_semantic = candidates.iter().map(|c| c.semantic).fold(0.0f32, f32::max);
        let max_lexical = candidates.iter().map(|c| c.lexical).fold(0.0f32, f32::max);

        let hints = parse_query_hints(request.query);
        let query_norm = echo_normalize(request.query);
        let query_about_errors = request.query.to_lowercase().contains("error");

        for candidate in candidates.iter_mut() {
            let semantic_norm = if max_semantic > 0.0 { candidate.semantic / max_semantic } else { 0.0 };
            let lexical_norm = if max_lexical > 0.0 { candidate.lexical / max_lexical } else { 0.0 };

            let mut score = self.config.hybrid_semantic_weight * semantic_norm
                + self.config.hybrid_bm25_weight * lexical_norm;

            score += self.mode_boost(candidate, request.mode);

            if !query_about_errors && candidate.content.contains("Error:") {
                score *= ERROR_PENALTY;
            }

            score += self.hint_boost(candidate, &hints);

            if is_echo(&query_norm, &candidate.content) {
                score *= ECHO_PENALTY;
            }

            candidate.score = score;
        }
    }

    fn mode_boost(&self, candidate: &Candidate, mode: SessionMode) -> f32 {
        let role = candidate.role();
        let dataset_boost = match role {
            "fact" => self.config.fact_boost,
            "state" => self.config.state_boost,
            "summary" => self.config.summary_boost,
            _ => 0.0,
        };
        let document_boost = match role {
            "document" => self.config.document_boost,
            "summary" => self.config.summary_boost,
            _ => 0.0,
        };

        match mode {
            SessionMode::Dataset => dataset_boost,
            SessionMode::Document => document_boost,
            SessionMode::Mixed => dataset_boost.max(document_boost),
        }
    }

    /// Hint boost, capped cumulatively. A dataset hint that is present but
    /// empty still earns a small boost for dataset-bearing candidates;
    /// an absent hint earns nothing. The distinction is deliberate.
    fn hint_boost(&self, candidate: &Candidate, hints: &HashMap<String, String>) -> f32 {
        let mut boost = 0.0f32;

        match hints.get("dataset") {
            Some(wanted) if wanted.is_empty() => {
                if candidate.metadata.contains_key("dataset") {
                    boost += 0.1;
                }
            }
            Some(wanted) => {
                if candidate.metadata.get("dataset") == Some(wanted) {
                    boost += 0.2;
                }
            }
            None => {}
        }

        if let Some(role) = hints.get("role") {
            if candidate.role() == role {
                boost += 0.2;
            }
        }

        if let Some(test) = hints.get("primary_test") {
            if candidate.metadata.get("primary_test") == Some(test) {
                boost += 0.2;
            }
        }

        boost.min(HINT_BOOST_CAP)
    }

    /// Three-stage post-filter: history exclusion, per-lookup bucketing,
    /// shingled near-duplicate removal
    async fn post_filter(
        &self,
        candidates: Vec<Candidate>,
        request: &QueryRequest<'_>,
    ) -> Vec<Candidate> {
        let history: HashSet<Uuid> = request.history_doc_ids.iter().copied().collect();
        let excluded: HashSet<&str> = request.exclude_hashes.iter().map(String::as_str).collect();

        // (a) the model already has these in its prompt
        let after_history: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| !history.contains(&c.document_id) && !history.contains(&c.lookup_id))
            .collect();

        // (b) one candidate per lookup id: the best summary, else the best
        // non-summary
        let mut buckets: HashMap<Uuid, Vec<Candidate>> = HashMap::new();
        for candidate in after_history {
            buckets.entry(candidate.lookup_id).or_default().push(candidate);
        }

        let mut bucketed: Vec<Candidate> = buckets
            .into_values()
            .filter_map(|mut bucket| {
                bucket.sort_by(|a, b| {
                    b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
                });
                let best_summary_idx = bucket.iter().position(|c| c.is_summary());
                match best_summary_idx {
                    Some(idx) => Some(bucket.swap_remove(idx)),
                    None => bucket.into_iter().next(),
                }
            })
            .collect();

        bucketed.sort_by(|a, b| {
            b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
        });

        // (c) shingled dedup plus the excluded-hash belt and suspenders
        let mut kept: Vec<Candidate> = Vec::new();
        let mut kept_shingles: Vec<HashSet<u64>> = Vec::new();

        for candidate in bucketed {
            if excluded.contains(content_hash(&candidate.content).as_str()) {
                continue;
            }

            let shingles = shingle_set(&candidate.content);
            let near_duplicate = kept_shingles
                .iter()
                .any(|existing| containment(&shingles, existing) > SHINGLE_CONTAINMENT_LIMIT);
            if near_duplicate {
                continue;
            }

            kept_shingles.push(shingles);
            kept.push(candidate);
        }

        kept
    }

    /// Multiply scores of supported candidates and re-sort
    async fn apply_supports_boost(&self, mut candidates: Vec<Candidate>) -> Vec<Candidate> {
        for candidate in candidates.iter_mut() {
            if self
                .graph
                .has_incoming(candidate.lookup_id, crate::document::EdgeType::Supports)
                .await
            {
                candidate.score *= self.config.graph_supports_boost;
            }
        }
        candidates.sort_by(|a, b| {
            b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates
    }

    /// Pure metadata containment search when hybrid retrieval comes back dry
    async fn metadata_fallback(&self, request: &QueryRequest<'_>) -> Result<QueryOutcome> {
        let filters = parse_fallback_filters(request.query, self.config.max_fallback_filters);
        if filters.is_empty() {
            return Ok(QueryOutcome::default());
        }

        debug!("Metadata fallback with filters {filters:?}");
        let hits = self
            .store
            .metadata_search_documents(request.session_id, &filters, request.n_results.max(1) * 2)
            .await?;

        let history: HashSet<Uuid> = request.history_doc_ids.iter().copied().collect();
        let candidates: Vec<Candidate> = hits
            .into_iter()
            .filter(|h| !history.contains(&h.document_id))
            .map(|h| Candidate {
                document_id: h.document_id,
                lookup_id: h.document_id,
                metadata: h.metadata,
                content: h.content,
                semantic: 0.0,
                lexical: 0.0,
                has_semantic: false,
                has_bm25: false,
                score: 1.0,
            })
            .collect();

        Ok(emit_memory_block(&candidates, request))
    }
}

/// Hints parsed from the raw query. Key presence with an empty value is
/// meaningful and distinct from absence.
fn parse_query_hints(query: &str) -> HashMap<String, String> {
    let mut hints = HashMap::new();
    let lower = query.to_lowercase();

    if let Some(caps) = regex_dataset_hint().captures(query) {
        let value = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        hints.insert("dataset".to_string(), value.to_string());
    } else if let Some(clue) = crate::ingest::dataset_clue(query) {
        hints.insert("dataset".to_string(), clue);
    }

    for role in ["fact", "summary", "document", "state"] {
        if lower.contains(role) {
            hints.insert("role".to_string(), role.to_string());
            break;
        }
    }

    if let Some(test) = crate::stats::detect_test(query) {
        hints.insert("primary_test".to_string(), test);
    }

    hints
}

fn regex_dataset_hint() -> &'static regex::Regex {
    static RE: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
        regex::Regex::new(r"(?i)\bdataset:\s*(\S*)").unwrap()
    });
    &RE
}

/// Filters for the metadata fallback, pinned to the key union
/// `{dataset, role, primary_test, analysis_stage, sig_at_05}`
fn parse_fallback_filters(query: &str, max_filters: usize) -> Vec<(String, String)> {
    let mut filters = Vec::new();
    let lower = query.to_lowercase();

    if let Some(clue) = crate::ingest::dataset_clue(query) {
        filters.push(("dataset".to_string(), clue));
    }
    if let Some(test) = crate::stats::detect_test(query) {
        filters.push(("primary_test".to_string(), test));
    }
    for stage in crate::stats::STAGES {
        if lower.contains(stage) {
            filters.push(("analysis_stage".to_string(), stage.to_string()));
            break;
        }
    }
    for role in ["fact", "summary", "document", "state"] {
        if lower.contains(role) {
            filters.push(("role".to_string(), role.to_string()));
            break;
        }
    }
    if lower.contains("significant") {
        filters.push(("sig_at_05".to_string(), "true".to_string()));
    }

    filters.truncate(max_filters);
    filters
}

/// Assemble the `<memory>` block from scored candidates
fn emit_memory_block(candidates: &[Candidate], request: &QueryRequest<'_>) -> QueryOutcome {
    let excluded: HashSet<&str> = request.exclude_hashes.iter().map(String::as_str).collect();

    let mut body = String::new();
    let mut emitted_lookups: HashSet<Uuid> = HashSet::new();
    let mut last_user_line: Option<String> = None;

    for candidate in candidates {
        if emitted_lookups.len() >= request.n_results {
            break;
        }
        if emitted_lookups.contains(&candidate.lookup_id) {
            continue;
        }

        let role = candidate.role();
        if role == "fact" {
            if let Ok(serde_json::Value::Object(payload)) =
                serde_json::from_str::<serde_json::Value>(&candidate.content)
            {
                let assistant = payload.get("assistant").and_then(|v| v.as_str());
                let tool = payload.get("tool").and_then(|v| v.as_str());
                if let (Some(assistant), Some(tool)) = (assistant, tool) {
                    let assistant_hash = candidate
                        .metadata
                        .get("assistant_hash")
                        .cloned()
                        .unwrap_or_else(|| content_hash(assistant));
                    if excluded.contains(assistant_hash.as_str()) {
                        continue;
                    }

                    if let Some(user) = payload.get("user").and_then(|v| v.as_str()) {
                        let user_line = format!("- user: {user}\n");
                        if last_user_line.as_deref() != Some(user_line.as_str()) {
                            body.push_str(&user_line);
                            last_user_line = Some(user_line);
                        }
                    }
                    body.push_str(&format!("- assistant: {assistant}\n"));
                    body.push_str(&format!("- tool: {tool}\n"));
                    emitted_lookups.insert(candidate.lookup_id);
                    continue;
                }
            }
            // structured single-line facts render as plain rows
            body.push_str(&format!("- fact: {}\n", candidate.content));
            last_user_line = None;
            emitted_lookups.insert(candidate.lookup_id);
            continue;
        }

        let label = if role.is_empty() { "document" } else { role };
        body.push_str(&format!("- {label}: {}\n", candidate.content));
        last_user_line = None;
        emitted_lookups.insert(candidate.lookup_id);
    }

    if emitted_lookups.is_empty() {
        return QueryOutcome::default();
    }

    let mut block = String::from("<memory>\n");
    if let Some(ledger) = request.done_ledger {
        if !ledger.trim().is_empty() {
            block.push_str(&format!("Completed steps: {}\n", ledger.trim()));
        }
    }
    block.push_str(&body);
    block.push_str("</memory>\n");

    QueryOutcome { memory_block: block, documents_used: emitted_lookups.len() }
}

/// Lowercase, strip non-alphanumerics, collapse whitespace
fn echo_normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Near-duplicate of the query: normalized equality or >= 85% length
/// containment of one inside the other
fn is_echo(query_norm: &str, content: &str) -> bool {
    if query_norm.is_empty() {
        return false;
    }
    let content_norm = echo_normalize(content);
    if content_norm == *query_norm {
        return true;
    }

    let (shorter, longer) = if content_norm.len() <= query_norm.len() {
        (content_norm.as_str(), query_norm)
    } else {
        (query_norm, content_norm.as_str())
    };
    longer.contains(shorter)
        && shorter.len() as f32 >= ECHO_OVERLAP * longer.len() as f32
}

/// Hashed 5-gram character shingles of normalized content
fn shingle_set(text: &str) -> HashSet<u64> {
    let normalized = echo_normalize(text);
    let chars: Vec<char> = normalized.chars().collect();
    let mut shingles = HashSet::new();

    if chars.len() < 5 {
        if !chars.is_empty() {
            shingles.insert(hash_shingle(&normalized));
        }
        return shingles;
    }

    for window in chars.windows(5) {
        let gram: String = window.iter().collect();
        shingles.insert(hash_shingle(&gram));
    }
    shingles
}

fn hash_shingle(gram: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    gram.hash(&mut hasher);
    hasher.finish()
}

/// `|A ∩ B| / min(|A|, |B|)`
fn containment(a: &HashSet<u64>, b: &HashSet<u64>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f32;
    intersection / a.len().min(b.len()) as f32
}
