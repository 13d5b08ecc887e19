//! Core entity types: documents, embedding windows, sessions, messages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use uuid::Uuid;

/// Role a stored document plays in retrieval
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DocumentRole {
    User,
    Assistant,
    Tool,
    Fact,
    Document,
    Summary,
    State,
}

impl DocumentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentRole::User => "user",
            DocumentRole::Assistant => "assistant",
            DocumentRole::Tool => "tool",
            DocumentRole::Fact => "fact",
            DocumentRole::Document => "document",
            DocumentRole::Summary => "summary",
            DocumentRole::State => "state",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(DocumentRole::User),
            "assistant" => Some(DocumentRole::Assistant),
            "tool" => Some(DocumentRole::Tool),
            "fact" => Some(DocumentRole::Fact),
            "document" => Some(DocumentRole::Document),
            "summary" => Some(DocumentRole::Summary),
            "state" => Some(DocumentRole::State),
            _ => None,
        }
    }
}

/// Structural document type, absent for plain conversational rows
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Fact,
    Chunk,
    DocumentChunk,
    Summary,
    Pdf,
    State,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Fact => "fact",
            DocumentType::Chunk => "chunk",
            DocumentType::DocumentChunk => "document_chunk",
            DocumentType::Summary => "summary",
            DocumentType::Pdf => "pdf",
            DocumentType::State => "state",
        }
    }
}

/// Fixed set of structural metadata keys persisted with documents.
/// Unknown keys are dropped at storage time.
pub const STRUCTURAL_KEYS: &[&str] = &[
    "session_id",
    "role",
    "document_id",
    "type",
    "parent_document_id",
    "parent_document_role",
    "chunk_index",
    "dataset",
    "filename",
    "page_number",
    "content_hash",
    "assistant_hash",
    "stage",
    "schema_hash",
    "source_type",
    "source_captured_at",
    "source_content_hash",
    // extracted statistical keys; the metadata fallback filters on a
    // subset of these
    "test_types",
    "primary_test",
    "analysis_stage",
    "variables",
    "p_value",
    "test_statistic",
    "effect_size",
    "sample_size",
    "sig_at_05",
    "sig_at_01",
    "sig_at_001",
];

/// Document metadata as a string map over the structural key set.
///
/// Absence of a key and an empty value mean different things (a dataset
/// hint that is present but empty still earns a small boost), so callers
/// must distinguish `get(..) == None` from `get(..) == Some("")`.
pub type DocumentMeta = HashMap<String, String>;

/// Retain only structural keys in a metadata map
pub fn filter_structural(meta: &DocumentMeta) -> DocumentMeta {
    meta.iter()
        .filter(|(k, _)| STRUCTURAL_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// A durable retrieval document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: DocumentRole,
    /// Authoritative text
    pub stored_content: String,
    /// Possibly truncated copy that was actually embedded
    pub embedding_content: String,
    /// SHA-256 of normalized dedup-stable text
    pub content_hash: String,
    pub metadata: DocumentMeta,
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn new(
        session_id: Uuid,
        role: DocumentRole,
        stored_content: String,
        embedding_content: String,
        content_hash: String,
        metadata: DocumentMeta,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            role,
            stored_content,
            embedding_content,
            content_hash,
            metadata,
            created_at: Utc::now(),
        }
    }

    /// Parent document id, if this row is a chunk or summary of another
    pub fn parent_document_id(&self) -> Option<Uuid> {
        self.metadata
            .get("parent_document_id")
            .and_then(|v| Uuid::parse_str(v).ok())
    }
}

/// One embedded slice of a document's embedding content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingWindow {
    pub document_id: Uuid,
    pub window_index: i64,
    /// Byte offset of the window start within `embedding_content`
    pub window_start: i64,
    /// Byte offset one past the window end
    pub window_end: i64,
    pub window_text: String,
    pub vector: Vec<f32>,
}

/// Unified result shape for both dense and lexical search
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub document_id: Uuid,
    pub window_index: i64,
    pub metadata: DocumentMeta,
    pub content: String,
    pub embedding_content: String,
    pub score: f32,
    /// Additive bonus when the whole query occurs as a phrase (lexical arm only)
    pub exact_bonus: f32,
}

/// Session interaction mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Dataset,
    Document,
    Mixed,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Dataset => "dataset",
            SessionMode::Document => "document",
            SessionMode::Mixed => "mixed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dataset" => Some(SessionMode::Dataset),
            "document" => Some(SessionMode::Document),
            "mixed" => Some(SessionMode::Mixed),
            _ => None,
        }
    }
}

/// A chat session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub workspace_path: String,
    pub mode: SessionMode,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: DocumentRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Directed relationship between documents
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    Supersedes,
    Supports,
    Blocks,
    Compares,
    EmittedIn,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Supersedes => "supersedes",
            EdgeType::Supports => "supports",
            EdgeType::Blocks => "blocks",
            EdgeType::Compares => "compares",
            EdgeType::EmittedIn => "emitted_in",
        }
    }
}

/// Directed graph edge between documents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from_id: Uuid,
    pub to_id: Uuid,
    pub edge_type: EdgeType,
    pub metadata: DocumentMeta,
    pub session_id: Uuid,
    pub dataset: String,
}

/// Canonical variable name with its observed raw spellings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableAlias {
    pub session_id: Uuid,
    pub dataset: String,
    pub canonical_name: String,
    pub raw_aliases: Vec<String>,
}

/// Canonicalize text for hashing and dedup: CRLF to LF, per-line trailing
/// whitespace trimmed, outer whitespace trimmed.
pub fn normalize_text(text: &str) -> String {
    text.replace("\r\n", "\n")
        .lines()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// SHA-256 of normalized text, hex-encoded
pub fn content_hash(text: &str) -> String {
    let normalized = normalize_text(text);
    let digest = Sha256::digest(normalized.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in [
            DocumentRole::User,
            DocumentRole::Assistant,
            DocumentRole::Tool,
            DocumentRole::Fact,
            DocumentRole::Document,
            DocumentRole::Summary,
            DocumentRole::State,
        ] {
            assert_eq!(DocumentRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(DocumentRole::parse("robot"), None);
    }

    #[test]
    fn test_normalize_text() {
        let input = "line one  \r\nline two\t\r\n\r\n  ";
        assert_eq!(normalize_text(input), "line one\nline two");
    }

    #[test]
    fn test_content_hash_ignores_line_endings() {
        let unix = "a = 1\nprint(a)";
        let windows = "a = 1\r\nprint(a)   ";
        assert_eq!(content_hash(unix), content_hash(windows));
        assert_eq!(content_hash(unix).len(), 64);
    }

    #[test]
    fn test_filter_structural_drops_unknown_keys() {
        let mut meta = DocumentMeta::new();
        meta.insert("dataset".to_string(), "iris.csv".to_string());
        meta.insert("favorite_color".to_string(), "green".to_string());

        let filtered = filter_structural(&meta);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.get("dataset").map(String::as_str), Some("iris.csv"));
    }

    #[test]
    fn test_parent_document_id() {
        let mut meta = DocumentMeta::new();
        let parent = Uuid::new_v4();
        meta.insert("parent_document_id".to_string(), parent.to_string());

        let doc = Document::new(
            Uuid::new_v4(),
            DocumentRole::Summary,
            "s".into(),
            "s".into(),
            content_hash("s"),
            meta,
        );
        assert_eq!(doc.parent_document_id(), Some(parent));
    }
}
