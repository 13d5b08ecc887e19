//! Evidence-validated State Card synthesis. A card summarizes one analysis
//! stage over one dataset; every precondition fails closed, so a card is
//! only emitted when the tool output actually backs it.

use crate::document::{content_hash, Document, DocumentMeta, DocumentRole};
use crate::embedder::Embedder;
use crate::error::Result;
use crate::stats::StatMetadata;
use crate::store::Store;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Namespace for deterministic state card ids
const STATE_CARD_NAMESPACE: Uuid = Uuid::from_bytes([
    0x8b, 0x1f, 0x3e, 0x6a, 0x2d, 0x94, 0x4c, 0x7b, 0x9a, 0x05, 0x61, 0xc8, 0xd2, 0x37, 0x5e,
    0x40,
]);

/// Cards kept per session, newest first
const STATE_RETENTION: usize = 4;

static INDEX_COLS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Index\(\[([^\]]*)\]").unwrap());
static COLUMNS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Columns:\s*\[([^\]]*)\]").unwrap());
static SHAPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Shape:\s*\((\d+),\s*(\d+)\)").unwrap());
static N_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bn\s*=\s*(\d+)\b").unwrap());
static OBS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)observations:\s*(\d+)\b").unwrap());

static P_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bp\s*[=:<]\s*([0-9]*\.?[0-9]+(?:[eE][+-]?[0-9]+)?)").unwrap()
});
static W_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bW\s*=\s*([0-9]*\.?[0-9]+)").unwrap());
static V_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:cram[eé]r'?s\s+V|\bV)\s*[=:]\s*([0-9]*\.?[0-9]+)").unwrap()
});
static R_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\br\s*=\s*(-?[0-9]*\.?[0-9]+)").unwrap());

static CHI_CONTEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)chi[\s_-]?squared?|chi2|crosstab").unwrap());

/// Deterministic card id for `(session, dataset, stage)`
pub fn state_card_id(session_id: Uuid, dataset: &str, stage: &str) -> Uuid {
    let name = format!("{session_id}|{dataset}|{stage}");
    Uuid::new_v5(&STATE_CARD_NAMESPACE, name.as_bytes())
}

/// First 8 hex characters of SHA-256 over sorted columns joined by `|`
pub fn schema_hash(columns: &[String]) -> String {
    let mut sorted = columns.to_vec();
    sorted.sort();
    let digest = Sha256::digest(sorted.join("|").as_bytes());
    digest.iter().take(4).map(|b| format!("{:02x}", b)).collect()
}

/// Schema evidence pulled from a tool output
#[derive(Debug, Clone, PartialEq)]
struct SchemaEvidence {
    columns: Vec<String>,
    n: u64,
}

/// Verbatim numeric evidence accepted for detail lines
#[derive(Debug, Clone, Default)]
struct NumericEvidence {
    p: Option<String>,
    w: Option<String>,
    v: Option<String>,
    r: Option<String>,
}

/// Builds and persists state cards
pub struct StateBuilder {
    store: Store,
    embedder: Arc<Embedder>,
}

impl StateBuilder {
    pub fn new(store: Store, embedder: Arc<Embedder>) -> Self {
        Self { store, embedder }
    }

    /// Attempt to synthesize a card. Returns the card document id when all
    /// evidence checks pass, `None` when any precondition fails.
    pub async fn build(
        &self,
        session_id: Uuid,
        meta: &StatMetadata,
        tool_output: &str,
        session_dataset: Option<&str>,
    ) -> Result<Option<Uuid>> {
        let Some(dataset) = meta
            .dataset
            .clone()
            .or_else(|| session_dataset.map(str::to_string))
        else {
            debug!("State card skipped: no dataset resolvable");
            return Ok(None);
        };

        let Some(stage) = meta.analysis_stage.clone() else {
            debug!("State card skipped: no analysis stage");
            return Ok(None);
        };

        let Some(schema) = extract_schema(tool_output) else {
            debug!("State card skipped: schema columns or n not extractable");
            return Ok(None);
        };

        // key drift: every referenced variable must exist in the schema
        for variable in &meta.variables {
            if !schema.columns.iter().any(|c| c == variable) {
                debug!("State card skipped: variable {variable:?} not in schema");
                return Ok(None);
            }
        }

        let Some(evidence) = extract_numeric_evidence(tool_output) else {
            debug!("State card skipped: numeric evidence out of range");
            return Ok(None);
        };

        if CHI_CONTEXT_RE.is_match(tool_output)
            && !counts_sum_matches(tool_output, schema.n)
        {
            debug!("State card skipped: crosstab counts do not sum to n");
            return Ok(None);
        }

        let hash = schema_hash(&schema.columns);
        let content = render_card(&dataset, schema.n, &stage, &schema.columns, &hash, meta, &evidence);

        let card_id = state_card_id(session_id, &dataset, &stage);
        if let Ok(previous) = self.store.get_document(card_id).await {
            let previous_hash = previous.metadata.get("schema_hash").cloned().unwrap_or_default();
            if previous_hash == hash && previous.stored_content != content {
                warn!(
                    "Overwriting state card {card_id} for {dataset}/{stage} with changed content"
                );
            }
        }

        let mut metadata = DocumentMeta::new();
        metadata.insert("session_id".to_string(), session_id.to_string());
        metadata.insert("role".to_string(), "state".to_string());
        metadata.insert("type".to_string(), "state".to_string());
        metadata.insert("dataset".to_string(), dataset.clone());
        metadata.insert("stage".to_string(), stage.clone());
        metadata.insert("schema_hash".to_string(), hash);
        metadata.insert("content_hash".to_string(), content_hash(&content));

        let mut doc = Document::new(
            session_id,
            DocumentRole::State,
            content.clone(),
            content.clone(),
            content_hash(&content),
            metadata,
        );
        doc.id = card_id;

        self.store.upsert_document(&doc).await?;

        // card text changed, so regenerate its windows
        self.store.delete_document_embeddings(card_id).await?;
        let windows = self.embedder.create_windows(&content).await?;
        for window in &windows {
            self.store
                .create_embedding(
                    card_id,
                    window.index as i64,
                    window.start as i64,
                    window.end as i64,
                    &window.text,
                    &window.vector,
                )
                .await?;
        }

        self.store
            .prune_state_documents(session_id, STATE_RETENTION)
            .await?;

        info!("State card {card_id} emitted for {dataset}/{stage}");
        Ok(Some(card_id))
    }
}

/// Columns and observation count from a tool output; `None` when either is
/// missing
fn extract_schema(tool_output: &str) -> Option<SchemaEvidence> {
    let columns = INDEX_COLS_RE
        .captures(tool_output)
        .or_else(|| COLUMNS_RE.captures(tool_output))
        .map(|caps| {
            caps[1]
                .split(',')
                .map(|c| c.trim().trim_matches(|ch| ch == '\'' || ch == '"').to_string())
                .filter(|c| !c.is_empty())
                .collect::<Vec<_>>()
        })?;

    if columns.is_empty() {
        return None;
    }

    let n = SHAPE_RE
        .captures(tool_output)
        .and_then(|caps| caps[1].parse::<u64>().ok())
        .or_else(|| N_RE.captures(tool_output).and_then(|caps| caps[1].parse().ok()))
        .or_else(|| OBS_RE.captures(tool_output).and_then(|caps| caps[1].parse().ok()))?;

    Some(SchemaEvidence { columns, n })
}

/// Verbatim numeric evidence with range sanity; `None` when any present
/// value is outside its valid range
fn extract_numeric_evidence(tool_output: &str) -> Option<NumericEvidence> {
    let mut evidence = NumericEvidence::default();

    if let Some(caps) = P_RE.captures(tool_output) {
        let raw = caps[1].to_string();
        let value: f64 = raw.parse().ok()?;
        if !(0.0..=1.0).contains(&value) {
            return None;
        }
        evidence.p = Some(raw);
    }
    if let Some(caps) = W_RE.captures(tool_output) {
        let raw = caps[1].to_string();
        let value: f64 = raw.parse().ok()?;
        if value <= 0.0 || value > 1.0 {
            return None;
        }
        evidence.w = Some(raw);
    }
    if let Some(caps) = V_RE.captures(tool_output) {
        let raw = caps[1].to_string();
        let value: f64 = raw.parse().ok()?;
        if !(0.0..=1.0).contains(&value) {
            return None;
        }
        evidence.v = Some(raw);
    }
    if let Some(caps) = R_RE.captures(tool_output) {
        let raw = caps[1].to_string();
        let value: f64 = raw.parse().ok()?;
        if !(-1.0..=1.0).contains(&value) {
            return None;
        }
        evidence.r = Some(raw);
    }

    Some(evidence)
}

/// Sum plausible integer counts (0 <= x < 10^6) outside the schema markers
/// and compare against n
fn counts_sum_matches(tool_output: &str, n: u64) -> bool {
    // strip shape/n markers so their numbers are not counted as cells
    let mut cleaned = SHAPE_RE.replace_all(tool_output, " ").to_string();
    cleaned = N_RE.replace_all(&cleaned, " ").to_string();
    cleaned = OBS_RE.replace_all(&cleaned, " ").to_string();

    let mut total: u64 = 0;
    for token in cleaned.split_whitespace() {
        if let Ok(value) = token.parse::<u64>() {
            if value < 1_000_000 {
                total += value;
            }
        }
    }
    total == n
}

fn render_card(
    dataset: &str,
    n: u64,
    stage: &str,
    columns: &[String],
    hash: &str,
    meta: &StatMetadata,
    evidence: &NumericEvidence,
) -> String {
    let mut sorted_cols = columns.to_vec();
    sorted_cols.sort();

    let mut out = format!(
        "[dataset:{dataset} | n:{n} | stage:{stage} | schema_cols:{} | schema_hash:{hash}]",
        sorted_cols.join(",")
    );

    let test_label = meta
        .primary_test
        .as_deref()
        .map(title_case)
        .unwrap_or_else(|| "Test".to_string());

    let mut lines: Vec<String> = Vec::new();
    if let Some(ref w) = evidence.w {
        match evidence.p {
            Some(ref p) => lines.push(format!("Shapiro-Wilk: W={w}, p={p}.")),
            None => lines.push(format!("Shapiro-Wilk: W={w}.")),
        }
    }
    if let Some(ref v) = evidence.v {
        lines.push(format!("Cramér's V: V={v}."));
    }
    if let Some(ref r) = evidence.r {
        match evidence.p {
            Some(ref p) => lines.push(format!("Pearson r: r={r}, p={p}.")),
            None => lines.push(format!("Pearson r: r={r}.")),
        }
    }
    if lines.is_empty() {
        if let Some(ref p) = evidence.p {
            lines.push(format!("{test_label}: p={p}."));
        }
    }

    for line in lines.into_iter().take(3) {
        out.push('\n');
        out.push_str(&line);
    }
    out
}

/// `shapiro-wilk` -> `Shapiro Wilk`
fn title_case(name: &str) -> String {
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
