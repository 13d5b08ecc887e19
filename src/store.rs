//! Durable document, embedding, edge, alias, session and message persistence
//! with the BM25 and vector search primitives used by hybrid retrieval.

use crate::config::StoreConfig;
use crate::document::{
    ChatMessage, Document, DocumentMeta, DocumentRole, EdgeType, EmbeddingWindow, SearchHit,
    Session, SessionMode,
};
use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// SQLite-backed store for all persisted entities
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    config: StoreConfig,
}

const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;

/// Bonus added when the whole query occurs as a contiguous phrase
const EXACT_MATCH_BONUS: f32 = 1.0;

impl Store {
    /// Connect and bootstrap the schema
    pub async fn connect(config: StoreConfig) -> Result<Self> {
        info!("Initializing store at: {}", config.database_url);

        let options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(|e| StoreError::StorageFailed(e.to_string()))?
            .create_if_missing(true)
            .foreign_keys(true);

        // a pooled in-memory database would give every connection its own
        // empty schema; pin it to one long-lived connection
        let in_memory = config.database_url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool, config };
        store.bootstrap().await?;

        info!("Store initialized");
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT,
                workspace_path TEXT NOT NULL,
                mode TEXT NOT NULL,
                title TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                stored_content TEXT NOT NULL,
                embedding_content TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_documents_session_role_hash \
             ON documents(session_id, role, content_hash)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS embeddings (
                document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                window_index INTEGER NOT NULL,
                window_start INTEGER NOT NULL,
                window_end INTEGER NOT NULL,
                window_text TEXT NOT NULL,
                vector BLOB NOT NULL,
                UNIQUE(document_id, window_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stat_edges (
                from_id TEXT NOT NULL,
                to_id TEXT NOT NULL,
                edge_type TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                session_id TEXT NOT NULL,
                dataset TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                UNIQUE(from_id, to_id, edge_type)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_stat_edges_to ON stat_edges(to_id, edge_type)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS variable_aliases (
                session_id TEXT NOT NULL,
                dataset TEXT NOT NULL,
                canonical_name TEXT NOT NULL,
                raw_aliases TEXT NOT NULL DEFAULT '[]',
                UNIQUE(session_id, dataset, canonical_name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS graph_metadata (
                session_id TEXT PRIMARY KEY,
                last_sync_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, created_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub fn embedding_dimension(&self) -> usize {
        self.config.embedding_dimension
    }

    /// Calculate cosine similarity between two vectors
    pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return 0.0;
        }

        let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }

        dot_product / (norm_a * norm_b)
    }

    /// Serialize vector for storage
    pub fn serialize_vector(vector: &[f32]) -> Vec<u8> {
        vector.iter().flat_map(|f| f.to_le_bytes().to_vec()).collect()
    }

    /// Deserialize vector from storage
    pub fn deserialize_vector(data: &[u8]) -> Vec<f32> {
        data.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
        let id: String = row.get("id");
        let session_id: String = row.get("session_id");
        let role: String = row.get("role");
        let metadata_json: String = row.get("metadata");
        let created_at: String = row.get("created_at");

        Ok(Document {
            id: Uuid::parse_str(&id).map_err(|e| StoreError::StorageFailed(e.to_string()))?,
            session_id: Uuid::parse_str(&session_id)
                .map_err(|e| StoreError::StorageFailed(e.to_string()))?,
            role: DocumentRole::parse(&role)
                .ok_or_else(|| StoreError::StorageFailed(format!("unknown role {role}")))?,
            stored_content: row.get("stored_content"),
            embedding_content: row.get("embedding_content"),
            content_hash: row.get("content_hash"),
            metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
            created_at: parse_timestamp(&created_at)?,
        })
    }

    // ---- documents ----

    /// Insert or overwrite one document by id
    pub async fn upsert_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents
                (id, session_id, role, stored_content, embedding_content,
                 content_hash, metadata, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                session_id = excluded.session_id,
                role = excluded.role,
                stored_content = excluded.stored_content,
                embedding_content = excluded.embedding_content,
                content_hash = excluded.content_hash,
                metadata = excluded.metadata,
                created_at = excluded.created_at
            "#,
        )
        .bind(doc.id.to_string())
        .bind(doc.session_id.to_string())
        .bind(doc.role.as_str())
        .bind(&doc.stored_content)
        .bind(&doc.embedding_content)
        .bind(&doc.content_hash)
        .bind(serde_json::to_string(&doc.metadata)?)
        .bind(doc.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!("Upserted document {}", doc.id);
        Ok(())
    }

    /// Upsert a batch of documents inside a single transaction
    pub async fn batch_upsert_documents(&self, docs: &[Document]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for doc in docs {
            sqlx::query(
                r#"
                INSERT INTO documents
                    (id, session_id, role, stored_content, embedding_content,
                     content_hash, metadata, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(id) DO UPDATE SET
                    session_id = excluded.session_id,
                    role = excluded.role,
                    stored_content = excluded.stored_content,
                    embedding_content = excluded.embedding_content,
                    content_hash = excluded.content_hash,
                    metadata = excluded.metadata,
                    created_at = excluded.created_at
                "#,
            )
            .bind(doc.id.to_string())
            .bind(doc.session_id.to_string())
            .bind(doc.role.as_str())
            .bind(&doc.stored_content)
            .bind(&doc.embedding_content)
            .bind(&doc.content_hash)
            .bind(serde_json::to_string(&doc.metadata)?)
            .bind(doc.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Batch upserted {} documents", docs.len());
        Ok(())
    }

    /// Find one document by `(session, role, content_hash)`
    pub async fn find_document_by_hash(
        &self,
        session_id: Uuid,
        role: DocumentRole,
        hash: &str,
    ) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT * FROM documents WHERE session_id = ?1 AND role = ?2 AND content_hash = ?3 \
             LIMIT 1",
        )
        .bind(session_id.to_string())
        .bind(role.as_str())
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_document).transpose()
    }

    /// Document ids in a session whose content hash is in `hashes`
    pub async fn find_document_ids_by_content_hash(
        &self,
        session_id: Uuid,
        hashes: &[String],
    ) -> Result<Vec<Uuid>> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (0..hashes.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT id FROM documents WHERE session_id = ?1 AND content_hash IN ({placeholders})"
        );

        let mut query = sqlx::query(&sql).bind(session_id.to_string());
        for hash in hashes {
            query = query.bind(hash);
        }

        let rows = query.fetch_all(&self.pool).await?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            ids.push(
                Uuid::parse_str(&id).map_err(|e| StoreError::StorageFailed(e.to_string()))?,
            );
        }
        Ok(ids)
    }

    /// Fetch one document; `StoreError::NotFound` when absent
    pub async fn get_document(&self, id: Uuid) -> Result<Document> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))?;

        Self::row_to_document(&row)
    }

    /// Authoritative content of one document; `StoreError::NotFound` when absent
    pub async fn get_document_content(&self, id: Uuid) -> Result<String> {
        let row = sqlx::query("SELECT stored_content FROM documents WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))?;

        Ok(row.get("stored_content"))
    }

    /// Fetch many documents at once; missing ids are skipped
    pub async fn get_documents_batch(&self, ids: &[Uuid]) -> Result<Vec<Document>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (0..ids.len())
            .map(|i| format!("?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT * FROM documents WHERE id IN ({placeholders})");

        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id.to_string());
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_document).collect()
    }

    /// All embedding windows of a document, ordered by window index
    pub async fn get_document_embeddings(&self, id: Uuid) -> Result<Vec<EmbeddingWindow>> {
        let rows = sqlx::query(
            "SELECT * FROM embeddings WHERE document_id = ?1 ORDER BY window_index",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut windows = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: Vec<u8> = row.get("vector");
            windows.push(EmbeddingWindow {
                document_id: id,
                window_index: row.get("window_index"),
                window_start: row.get("window_start"),
                window_end: row.get("window_end"),
                window_text: row.get("window_text"),
                vector: Self::deserialize_vector(&blob),
            });
        }
        Ok(windows)
    }

    /// Persist one embedding window
    pub async fn create_embedding(
        &self,
        document_id: Uuid,
        window_index: i64,
        window_start: i64,
        window_end: i64,
        window_text: &str,
        vector: &[f32],
    ) -> Result<()> {
        if vector.len() != self.config.embedding_dimension {
            return Err(StoreError::InvalidDimension {
                expected: self.config.embedding_dimension,
                actual: vector.len(),
            }
            .into());
        }

        sqlx::query(
            r#"
            INSERT INTO embeddings
                (document_id, window_index, window_start, window_end, window_text, vector)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(document_id, window_index) DO UPDATE SET
                window_start = excluded.window_start,
                window_end = excluded.window_end,
                window_text = excluded.window_text,
                vector = excluded.vector
            "#,
        )
        .bind(document_id.to_string())
        .bind(window_index)
        .bind(window_start)
        .bind(window_end)
        .bind(window_text)
        .bind(Self::serialize_vector(vector))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Drop all embedding windows of a document (re-embed path)
    pub async fn delete_document_embeddings(&self, document_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM embeddings WHERE document_id = ?1")
            .bind(document_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- state documents ----

    /// State cards of a session, newest first
    pub async fn list_state_documents(&self, session_id: Uuid) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT * FROM documents WHERE session_id = ?1 AND role = 'state' \
             ORDER BY created_at DESC, id",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_document).collect()
    }

    /// Find the current state card for `(session, dataset, stage)`
    pub async fn find_state_document(
        &self,
        session_id: Uuid,
        dataset: &str,
        stage: &str,
    ) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT * FROM documents WHERE session_id = ?1 AND role = 'state' \
             AND json_extract(metadata, '$.dataset') = ?2 \
             AND json_extract(metadata, '$.stage') = ?3 LIMIT 1",
        )
        .bind(session_id.to_string())
        .bind(dataset)
        .bind(stage)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_document).transpose()
    }

    /// Delete state cards beyond the `keep` newest in a session; returns how
    /// many were removed
    pub async fn prune_state_documents(&self, session_id: Uuid, keep: usize) -> Result<usize> {
        let stale = sqlx::query(
            "SELECT id FROM documents WHERE session_id = ?1 AND role = 'state' \
             ORDER BY created_at DESC, id LIMIT -1 OFFSET ?2",
        )
        .bind(session_id.to_string())
        .bind(keep as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut removed = 0;
        for row in stale {
            let id: String = row.get("id");
            sqlx::query("DELETE FROM documents WHERE id = ?1")
                .bind(&id)
                .execute(&self.pool)
                .await?;
            removed += 1;
        }

        if removed > 0 {
            debug!("Pruned {removed} state documents in session {session_id}");
        }
        Ok(removed)
    }

    // ---- search primitives ----

    /// Brute-force cosine top-k over the session's embedding windows,
    /// joined back to their documents
    pub async fn vector_search_documents(
        &self,
        query_vector: &[f32],
        limit: usize,
        session_id: Uuid,
        exclude_hashes: &[String],
    ) -> Result<Vec<SearchHit>> {
        if query_vector.len() != self.config.embedding_dimension {
            return Err(StoreError::InvalidDimension {
                expected: self.config.embedding_dimension,
                actual: query_vector.len(),
            }
            .into());
        }

        let rows = sqlx::query(
            "SELECT e.document_id, e.window_index, e.vector, \
                    d.metadata, d.stored_content, d.embedding_content \
             FROM embeddings e JOIN documents d ON d.id = e.document_id \
             WHERE d.session_id = ?1",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let excluded: HashSet<&str> = exclude_hashes.iter().map(String::as_str).collect();
        let excluded_ids = self
            .find_document_ids_by_content_hash(session_id, exclude_hashes)
            .await?
            .into_iter()
            .collect::<HashSet<_>>();

        let mut hits = Vec::new();
        for row in rows {
            let doc_id: String = row.get("document_id");
            let document_id =
                Uuid::parse_str(&doc_id).map_err(|e| StoreError::StorageFailed(e.to_string()))?;
            if excluded_ids.contains(&document_id) {
                continue;
            }

            let metadata_json: String = row.get("metadata");
            let metadata: DocumentMeta = serde_json::from_str(&metadata_json).unwrap_or_default();
            if metadata
                .get("content_hash")
                .is_some_and(|h| excluded.contains(h.as_str()))
            {
                continue;
            }

            let blob: Vec<u8> = row.get("vector");
            let vector = Self::deserialize_vector(&blob);
            let similarity = Self::cosine_similarity(query_vector, &vector);

            hits.push(SearchHit {
                document_id,
                window_index: row.get("window_index"),
                metadata,
                content: row.get("stored_content"),
                embedding_content: row.get("embedding_content"),
                score: similarity,
                exact_bonus: 0.0,
            });
        }

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);

        debug!("Vector search returned {} hits", hits.len());
        Ok(hits)
    }

    /// Okapi BM25 over the session's documents plus an exact-phrase bonus
    pub async fn search_documents_bm25(
        &self,
        query: &str,
        limit: usize,
        session_id: Uuid,
        exclude_hashes: &[String],
    ) -> Result<Vec<SearchHit>> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT id, stored_content, embedding_content, metadata \
             FROM documents WHERE session_id = ?1",
        );
        if !exclude_hashes.is_empty() {
            let placeholders = (0..exclude_hashes.len())
                .map(|i| format!("?{}", i + 2))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" AND content_hash NOT IN ({placeholders})"));
        }

        let mut q = sqlx::query(&sql).bind(session_id.to_string());
        for hash in exclude_hashes {
            q = q.bind(hash);
        }
        let rows = q.fetch_all(&self.pool).await?;

        struct Candidate {
            document_id: Uuid,
            content: String,
            embedding_content: String,
            metadata: DocumentMeta,
            terms: Vec<String>,
        }

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let content: String = row.get("stored_content");
            let metadata_json: String = row.get("metadata");
            candidates.push(Candidate {
                document_id: Uuid::parse_str(&id)
                    .map_err(|e| StoreError::StorageFailed(e.to_string()))?,
                terms: tokenize(&content),
                content,
                embedding_content: row.get("embedding_content"),
                metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
            });
        }

        let n_docs = candidates.len();
        if n_docs == 0 {
            return Ok(Vec::new());
        }

        let avg_len: f32 =
            candidates.iter().map(|c| c.terms.len() as f32).sum::<f32>() / n_docs as f32;

        // document frequency per query term
        let mut doc_freq: HashMap<&str, usize> = HashMap::new();
        for term in &query_terms {
            let df = candidates
                .iter()
                .filter(|c| c.terms.iter().any(|t| t == term))
                .count();
            doc_freq.insert(term.as_str(), df);
        }

        let query_lower = query.trim().to_lowercase();
        let mut hits = Vec::new();
        for cand in &candidates {
            let doc_len = cand.terms.len() as f32;
            let mut score = 0.0f32;

            for term in &query_terms {
                let df = doc_freq[term.as_str()];
                if df == 0 {
                    continue;
                }
                let tf = cand.terms.iter().filter(|t| *t == term).count() as f32;
                if tf == 0.0 {
                    continue;
                }
                let idf =
                    (((n_docs as f32 - df as f32 + 0.5) / (df as f32 + 0.5)) + 1.0).ln();
                let denom = tf + BM25_K1 * (1.0 - BM25_B + BM25_B * doc_len / avg_len.max(1.0));
                score += idf * tf * (BM25_K1 + 1.0) / denom;
            }

            let exact_bonus = if !query_lower.is_empty()
                && cand.content.to_lowercase().contains(&query_lower)
            {
                EXACT_MATCH_BONUS
            } else {
                0.0
            };

            if score > 0.0 || exact_bonus > 0.0 {
                hits.push(SearchHit {
                    document_id: cand.document_id,
                    window_index: 0,
                    metadata: cand.metadata.clone(),
                    content: cand.content.clone(),
                    embedding_content: cand.embedding_content.clone(),
                    score,
                    exact_bonus,
                });
            }
        }

        hits.sort_by(|a, b| {
            (b.score + b.exact_bonus)
                .partial_cmp(&(a.score + a.exact_bonus))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);

        debug!("BM25 search returned {} hits", hits.len());
        Ok(hits)
    }

    /// Pure metadata JSON-containment search bounded by session
    pub async fn metadata_search_documents(
        &self,
        session_id: Uuid,
        filters: &[(String, String)],
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        if filters.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = String::from("SELECT * FROM documents WHERE session_id = ?1");
        for (i, _) in filters.iter().enumerate() {
            sql.push_str(&format!(
                " AND json_extract(metadata, '$.' || ?{}) = ?{}",
                i * 2 + 2,
                i * 2 + 3
            ));
        }
        sql.push_str(&format!(" ORDER BY created_at DESC LIMIT ?{}", filters.len() * 2 + 2));

        let mut q = sqlx::query(&sql).bind(session_id.to_string());
        for (key, value) in filters {
            q = q.bind(key).bind(value);
        }
        q = q.bind(limit as i64);

        let rows = q.fetch_all(&self.pool).await?;
        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let doc = Self::row_to_document(row)?;
            hits.push(SearchHit {
                document_id: doc.id,
                window_index: 0,
                metadata: doc.metadata,
                content: doc.stored_content,
                embedding_content: doc.embedding_content,
                score: 1.0,
                exact_bonus: 0.0,
            });
        }
        Ok(hits)
    }

    /// True when the session has at least one embedded PDF chunk
    pub async fn has_session_pdf_embeddings(&self, session_id: Uuid) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM embeddings e \
             JOIN documents d ON d.id = e.document_id \
             WHERE d.session_id = ?1 AND json_extract(d.metadata, '$.type') = 'pdf'",
        )
        .bind(session_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        let n: i64 = row.get("n");
        Ok(n > 0)
    }

    /// Delete a session's documents (embeddings cascade)
    pub async fn delete_documents_by_session(&self, session_id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM documents WHERE session_id = ?1")
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await?;
        debug!(
            "Deleted {} documents for session {session_id}",
            result.rows_affected()
        );
        Ok(())
    }

    // ---- graph edges & aliases ----

    /// Insert a directed edge; duplicate `(from, to, type)` rows are ignored
    pub async fn create_edge(
        &self,
        from_id: Uuid,
        to_id: Uuid,
        edge_type: EdgeType,
        metadata: &DocumentMeta,
        session_id: Uuid,
        dataset: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stat_edges
                (from_id, to_id, edge_type, metadata, session_id, dataset, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(from_id, to_id, edge_type) DO NOTHING
            "#,
        )
        .bind(from_id.to_string())
        .bind(to_id.to_string())
        .bind(edge_type.as_str())
        .bind(serde_json::to_string(metadata)?)
        .bind(session_id.to_string())
        .bind(dataset)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// One-hop reachability: does `to_id` have any incoming edge of `edge_type`
    pub async fn has_incoming_edge_type(&self, to_id: Uuid, edge_type: EdgeType) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM stat_edges WHERE to_id = ?1 AND edge_type = ?2",
        )
        .bind(to_id.to_string())
        .bind(edge_type.as_str())
        .fetch_one(&self.pool)
        .await?;

        let n: i64 = row.get("n");
        Ok(n > 0)
    }

    /// Merge raw aliases set-wise into the canonical alias row
    pub async fn upsert_alias(
        &self,
        session_id: Uuid,
        dataset: &str,
        canonical_name: &str,
        raw_aliases: &[String],
    ) -> Result<()> {
        let existing = sqlx::query(
            "SELECT raw_aliases FROM variable_aliases \
             WHERE session_id = ?1 AND dataset = ?2 AND canonical_name = ?3",
        )
        .bind(session_id.to_string())
        .bind(dataset)
        .bind(canonical_name)
        .fetch_optional(&self.pool)
        .await?;

        let mut merged: Vec<String> = existing
            .map(|row| {
                let json: String = row.get("raw_aliases");
                serde_json::from_str(&json).unwrap_or_default()
            })
            .unwrap_or_default();
        for alias in raw_aliases {
            if !merged.contains(alias) {
                merged.push(alias.clone());
            }
        }

        sqlx::query(
            r#"
            INSERT INTO variable_aliases (session_id, dataset, canonical_name, raw_aliases)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(session_id, dataset, canonical_name) DO UPDATE SET
                raw_aliases = excluded.raw_aliases
            "#,
        )
        .bind(session_id.to_string())
        .bind(dataset)
        .bind(canonical_name)
        .bind(serde_json::to_string(&merged)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All alias rows for `(session, dataset)`
    pub async fn list_aliases(
        &self,
        session_id: Uuid,
        dataset: &str,
    ) -> Result<Vec<(String, Vec<String>)>> {
        let rows = sqlx::query(
            "SELECT canonical_name, raw_aliases FROM variable_aliases \
             WHERE session_id = ?1 AND dataset = ?2",
        )
        .bind(session_id.to_string())
        .bind(dataset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let canonical: String = row.get("canonical_name");
                let json: String = row.get("raw_aliases");
                (canonical, serde_json::from_str(&json).unwrap_or_default())
            })
            .collect())
    }

    /// Best-effort sync marker for graph consumers
    pub async fn touch_graph_sync(&self, session_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO graph_metadata (session_id, last_sync_at) VALUES (?1, ?2)
            ON CONFLICT(session_id) DO UPDATE SET last_sync_at = excluded.last_sync_at
            "#,
        )
        .bind(session_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- sessions ----

    pub async fn create_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, user_id, workspace_path, mode, title, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(session.id.to_string())
        .bind(session.user_id.map(|u| u.to_string()))
        .bind(&session.workspace_path)
        .bind(session.mode.as_str())
        .bind(&session.title)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        info!("Created session {}", session.id);
        Ok(())
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Session> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::SessionNotFound(id))?;

        let user_id: Option<String> = row.get("user_id");
        let mode: String = row.get("mode");
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");

        Ok(Session {
            id,
            user_id: user_id.and_then(|u| Uuid::parse_str(&u).ok()),
            workspace_path: row.get("workspace_path"),
            mode: SessionMode::parse(&mode)
                .ok_or_else(|| StoreError::StorageFailed(format!("unknown mode {mode}")))?,
            title: row.get("title"),
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
        })
    }

    pub async fn touch_session(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE sessions SET updated_at = ?1 WHERE id = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_session_mode(&self, id: Uuid, mode: SessionMode) -> Result<()> {
        sqlx::query("UPDATE sessions SET mode = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(mode.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_session_title(&self, id: Uuid, title: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET title = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(title)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a session and everything keyed on it
    pub async fn delete_session(&self, id: Uuid) -> Result<()> {
        let sid = id.to_string();

        self.delete_documents_by_session(id).await?;
        sqlx::query("DELETE FROM stat_edges WHERE session_id = ?1")
            .bind(&sid)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM variable_aliases WHERE session_id = ?1")
            .bind(&sid)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM graph_metadata WHERE session_id = ?1")
            .bind(&sid)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM messages WHERE session_id = ?1")
            .bind(&sid)
            .execute(&self.pool)
            .await?;

        let result = sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(&sid)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            warn!("No session found with id {id}");
        } else {
            info!("Deleted session {id}");
        }
        Ok(())
    }

    // ---- messages ----

    pub async fn create_message(&self, message: &ChatMessage) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (id, session_id, role, content, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(message.id.to_string())
        .bind(message.session_id.to_string())
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Session messages in arrival order
    pub async fn list_messages(&self, session_id: Uuid) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE session_id = ?1 ORDER BY created_at, rowid",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let role: String = row.get("role");
            let created_at: String = row.get("created_at");
            messages.push(ChatMessage {
                id: Uuid::parse_str(&id).map_err(|e| StoreError::StorageFailed(e.to_string()))?,
                session_id,
                role: DocumentRole::parse(&role)
                    .ok_or_else(|| StoreError::StorageFailed(format!("unknown role {role}")))?,
                content: row.get("content"),
                created_at: parse_timestamp(&created_at)?,
            });
        }
        Ok(messages)
    }

    pub async fn get_message(&self, id: Uuid) -> Result<ChatMessage> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| crate::error::EngineError::NotFound(format!("message {id}")))?;

        let session_id: String = row.get("session_id");
        let role: String = row.get("role");
        let created_at: String = row.get("created_at");
        Ok(ChatMessage {
            id,
            session_id: Uuid::parse_str(&session_id)
                .map_err(|e| StoreError::StorageFailed(e.to_string()))?,
            role: DocumentRole::parse(&role)
                .ok_or_else(|| StoreError::StorageFailed(format!("unknown role {role}")))?,
            content: row.get("content"),
            created_at: parse_timestamp(&created_at)?,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .map_err(|e| StoreError::StorageFailed(e.to_string()))?
        .with_timezone(&Utc))
}

/// Lowercase alphanumeric tokens
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::content_hash;

    async fn create_test_store() -> Store {
        let config = StoreConfig {
            database_url: "sqlite::memory:".to_string(),
            embedding_dimension: 8,
            ..Default::default()
        };
        Store::connect(config).await.unwrap()
    }

    fn test_session() -> Session {
        Session {
            id: Uuid::new_v4(),
            user_id: None,
            workspace_path: "/tmp/ws".to_string(),
            mode: SessionMode::Dataset,
            title: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn make_doc(session_id: Uuid, role: DocumentRole, content: &str) -> Document {
        Document::new(
            session_id,
            role,
            content.to_string(),
            content.to_string(),
            content_hash(content),
            DocumentMeta::new(),
        )
    }

    #[tokio::test]
    async fn test_document_lifecycle() {
        let store = create_test_store().await;
        let session = test_session();
        store.create_session(&session).await.unwrap();

        let doc = make_doc(session.id, DocumentRole::Fact, "shapiro result");
        store.upsert_document(&doc).await.unwrap();

        let fetched = store.get_document(doc.id).await.unwrap();
        assert_eq!(fetched.stored_content, "shapiro result");
        assert_eq!(fetched.role, DocumentRole::Fact);

        let by_hash = store
            .find_document_by_hash(session.id, DocumentRole::Fact, &doc.content_hash)
            .await
            .unwrap();
        assert_eq!(by_hash.unwrap().id, doc.id);

        let missing = store.get_document(Uuid::new_v4()).await;
        assert!(missing.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_upsert_overwrites_on_id_conflict() {
        let store = create_test_store().await;
        let session = test_session();
        store.create_session(&session).await.unwrap();

        let mut doc = make_doc(session.id, DocumentRole::Fact, "v1");
        store.upsert_document(&doc).await.unwrap();

        doc.stored_content = "v2".to_string();
        doc.content_hash = content_hash("v2");
        store.upsert_document(&doc).await.unwrap();

        let fetched = store.get_document(doc.id).await.unwrap();
        assert_eq!(fetched.stored_content, "v2");
    }

    #[tokio::test]
    async fn test_batch_upsert_and_batch_get() {
        let store = create_test_store().await;
        let session = test_session();
        store.create_session(&session).await.unwrap();

        let docs: Vec<Document> = (0..5)
            .map(|i| make_doc(session.id, DocumentRole::Tool, &format!("row {i}")))
            .collect();
        store.batch_upsert_documents(&docs).await.unwrap();

        let ids: Vec<Uuid> = docs.iter().map(|d| d.id).collect();
        let fetched = store.get_documents_batch(&ids).await.unwrap();
        assert_eq!(fetched.len(), 5);
    }

    #[tokio::test]
    async fn test_embedding_windows_cascade_with_document() {
        let store = create_test_store().await;
        let session = test_session();
        store.create_session(&session).await.unwrap();

        let doc = make_doc(session.id, DocumentRole::Fact, "windowed");
        store.upsert_document(&doc).await.unwrap();
        store
            .create_embedding(doc.id, 0, 0, 8, "windowed", &[0.5; 8])
            .await
            .unwrap();
        store
            .create_embedding(doc.id, 1, 9, 12, "tail", &[0.25; 8])
            .await
            .unwrap();

        let windows = store.get_document_embeddings(doc.id).await.unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].window_index, 0);
        assert_eq!(windows[1].window_text, "tail");

        store.delete_documents_by_session(session.id).await.unwrap();
        let windows = store.get_document_embeddings(doc.id).await.unwrap();
        assert!(windows.is_empty());
    }

    #[tokio::test]
    async fn test_embedding_dimension_checked() {
        let store = create_test_store().await;
        let session = test_session();
        store.create_session(&session).await.unwrap();
        let doc = make_doc(session.id, DocumentRole::Fact, "dim");
        store.upsert_document(&doc).await.unwrap();

        let err = store
            .create_embedding(doc.id, 0, 0, 3, "dim", &[0.1; 3])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::EngineError::Store(StoreError::InvalidDimension { expected: 8, actual: 3 })
        ));
    }

    #[tokio::test]
    async fn test_vector_search_ranks_by_similarity() {
        let store = create_test_store().await;
        let session = test_session();
        store.create_session(&session).await.unwrap();

        let close = make_doc(session.id, DocumentRole::Fact, "close");
        let far = make_doc(session.id, DocumentRole::Fact, "far");
        store.upsert_document(&close).await.unwrap();
        store.upsert_document(&far).await.unwrap();

        let mut close_vec = vec![0.0f32; 8];
        close_vec[0] = 1.0;
        let mut far_vec = vec![0.0f32; 8];
        far_vec[7] = 1.0;
        store
            .create_embedding(close.id, 0, 0, 5, "close", &close_vec)
            .await
            .unwrap();
        store
            .create_embedding(far.id, 0, 0, 3, "far", &far_vec)
            .await
            .unwrap();

        let mut query = vec![0.0f32; 8];
        query[0] = 1.0;
        let hits = store
            .vector_search_documents(&query, 10, session.id, &[])
            .await
            .unwrap();
        assert_eq!(hits[0].document_id, close.id);
        assert!(hits[0].score > 0.99);

        // excluded by hash
        let hits = store
            .vector_search_documents(&query, 10, session.id, &[close.content_hash.clone()])
            .await
            .unwrap();
        assert!(hits.iter().all(|h| h.document_id != close.id));
    }

    #[tokio::test]
    async fn test_bm25_scores_and_exact_bonus() {
        let store = create_test_store().await;
        let session = test_session();
        store.create_session(&session).await.unwrap();

        let exact = make_doc(
            session.id,
            DocumentRole::Fact,
            "Shapiro-Wilk on residuals resulted in W=0.923",
        );
        let partial = make_doc(session.id, DocumentRole::Fact, "Levene test on residuals");
        let unrelated = make_doc(session.id, DocumentRole::Fact, "histogram of income");
        for d in [&exact, &partial, &unrelated] {
            store.upsert_document(d).await.unwrap();
        }

        let hits = store
            .search_documents_bm25("shapiro-wilk on residuals", 10, session.id, &[])
            .await
            .unwrap();

        assert_eq!(hits[0].document_id, exact.id);
        assert!(hits[0].exact_bonus > 0.0);
        assert!(hits.iter().all(|h| h.document_id != unrelated.id));
    }

    #[tokio::test]
    async fn test_bm25_empty_query() {
        let store = create_test_store().await;
        let session = test_session();
        store.create_session(&session).await.unwrap();
        let hits = store
            .search_documents_bm25("   ", 10, session.id, &[])
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_state_document_pruning() {
        let store = create_test_store().await;
        let session = test_session();
        store.create_session(&session).await.unwrap();

        for i in 0..6 {
            let mut doc = make_doc(session.id, DocumentRole::State, &format!("card {i}"));
            doc.created_at = Utc::now() + chrono::Duration::seconds(i);
            store.upsert_document(&doc).await.unwrap();
        }

        let removed = store.prune_state_documents(session.id, 4).await.unwrap();
        assert_eq!(removed, 2);

        let remaining = store.list_state_documents(session.id).await.unwrap();
        assert_eq!(remaining.len(), 4);
        assert_eq!(remaining[0].stored_content, "card 5");
    }

    #[tokio::test]
    async fn test_find_state_document_by_dataset_stage() {
        let store = create_test_store().await;
        let session = test_session();
        store.create_session(&session).await.unwrap();

        let mut meta = DocumentMeta::new();
        meta.insert("dataset".to_string(), "iris.csv".to_string());
        meta.insert("stage".to_string(), "assumption_check".to_string());
        let mut doc = make_doc(session.id, DocumentRole::State, "[dataset:iris.csv | ...]");
        doc.metadata = meta;
        store.upsert_document(&doc).await.unwrap();

        let found = store
            .find_state_document(session.id, "iris.csv", "assumption_check")
            .await
            .unwrap();
        assert_eq!(found.unwrap().id, doc.id);

        let missing = store
            .find_state_document(session.id, "iris.csv", "modeling")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_edges_and_aliases() {
        let store = create_test_store().await;
        let session = test_session();
        store.create_session(&session).await.unwrap();

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store
            .create_edge(a, b, EdgeType::Supersedes, &DocumentMeta::new(), session.id, "d.csv")
            .await
            .unwrap();
        // duplicate ignored
        store
            .create_edge(a, b, EdgeType::Supersedes, &DocumentMeta::new(), session.id, "d.csv")
            .await
            .unwrap();

        assert!(store.has_incoming_edge_type(b, EdgeType::Supersedes).await.unwrap());
        assert!(!store.has_incoming_edge_type(a, EdgeType::Supersedes).await.unwrap());
        assert!(!store.has_incoming_edge_type(b, EdgeType::Supports).await.unwrap());

        store
            .upsert_alias(session.id, "d.csv", "income", &["Income".to_string()])
            .await
            .unwrap();
        store
            .upsert_alias(
                session.id,
                "d.csv",
                "income",
                &["Income".to_string(), "income_usd".to_string()],
            )
            .await
            .unwrap();

        let aliases = store.list_aliases(session.id, "d.csv").await.unwrap();
        assert_eq!(aliases.len(), 1);
        assert_eq!(aliases[0].1, vec!["Income".to_string(), "income_usd".to_string()]);
    }

    #[tokio::test]
    async fn test_session_cascade_delete() {
        let store = create_test_store().await;
        let session = test_session();
        store.create_session(&session).await.unwrap();

        let doc = make_doc(session.id, DocumentRole::Fact, "gone");
        store.upsert_document(&doc).await.unwrap();
        store
            .create_message(&ChatMessage {
                id: Uuid::new_v4(),
                session_id: session.id,
                role: DocumentRole::User,
                content: "hi".to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store.touch_graph_sync(session.id).await.unwrap();

        store.delete_session(session.id).await.unwrap();

        assert!(store.get_session(session.id).await.unwrap_err().is_not_found());
        assert!(store.get_document(doc.id).await.unwrap_err().is_not_found());
        assert!(store.list_messages(session.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_has_session_pdf_embeddings() {
        let store = create_test_store().await;
        let session = test_session();
        store.create_session(&session).await.unwrap();

        assert!(!store.has_session_pdf_embeddings(session.id).await.unwrap());

        let mut doc = make_doc(session.id, DocumentRole::Document, "page text");
        doc.metadata.insert("type".to_string(), "pdf".to_string());
        store.upsert_document(&doc).await.unwrap();
        store
            .create_embedding(doc.id, 0, 0, 9, "page text", &[0.1; 8])
            .await
            .unwrap();

        assert!(store.has_session_pdf_embeddings(session.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_message_ordering() {
        let store = create_test_store().await;
        let session = test_session();
        store.create_session(&session).await.unwrap();

        let base = Utc::now();
        for (i, content) in ["first", "second", "third"].iter().enumerate() {
            store
                .create_message(&ChatMessage {
                    id: Uuid::new_v4(),
                    session_id: session.id,
                    role: DocumentRole::User,
                    content: content.to_string(),
                    created_at: base + chrono::Duration::milliseconds(i as i64),
                })
                .await
                .unwrap();
        }

        let messages = store.list_messages(session.id).await.unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_metadata_search() {
        let store = create_test_store().await;
        let session = test_session();
        store.create_session(&session).await.unwrap();

        let mut doc = make_doc(session.id, DocumentRole::Fact, "anova table");
        doc.metadata.insert("dataset".to_string(), "cars.csv".to_string());
        doc.metadata.insert("role".to_string(), "fact".to_string());
        store.upsert_document(&doc).await.unwrap();

        let other = make_doc(session.id, DocumentRole::Fact, "no dataset");
        store.upsert_document(&other).await.unwrap();

        let hits = store
            .metadata_search_documents(
                session.id,
                &[("dataset".to_string(), "cars.csv".to_string())],
                10,
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, doc.id);
    }

    #[test]
    fn test_vector_serialization_round_trip() {
        let vector = vec![1.5f32, -2.3, 0.0, 42.1];
        let serialized = Store::serialize_vector(&vector);
        let deserialized = Store::deserialize_vector(&serialized);
        assert_eq!(vector.len(), deserialized.len());
        for (orig, deser) in vector.iter().zip(deserialized.iter()) {
            assert!((orig - deser).abs() < f32::EPSILON);
        }
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];
        assert_eq!(Store::cosine_similarity(&a, &b), 1.0);
        assert_eq!(Store::cosine_similarity(&a, &c), 0.0);
    }

    #[test]
    fn test_cosine_similarity_self_is_one() {
        use rand::Rng;
        let mut rng = rand::rng();
        let mut v: Vec<f32> = (0..32).map(|_| rng.random_range(-1.0f32..1.0)).collect();
        v[0] = 1.0;
        assert!((Store::cosine_similarity(&v, &v) - 1.0).abs() < 1e-5);
    }
}
