//! Lightweight relationship overlay on top of stored documents: directed
//! edges and variable aliases. Every operation is best-effort with respect
//! to ingestion; failures are logged and swallowed so the hot path never
//! blocks on graph state.

use crate::document::{DocumentMeta, EdgeType};
use crate::store::Store;
use tracing::warn;
use uuid::Uuid;

/// Graph overlay bound to a store
#[derive(Clone)]
pub struct Graph {
    store: Store,
}

impl Graph {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Record a directed edge; returns false (and logs) on failure
    pub async fn create_edge(
        &self,
        from_id: Uuid,
        to_id: Uuid,
        edge_type: EdgeType,
        metadata: &DocumentMeta,
        session_id: Uuid,
        dataset: &str,
    ) -> bool {
        match self
            .store
            .create_edge(from_id, to_id, edge_type, metadata, session_id, dataset)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Edge create failed ({} -> {}): {e}", from_id, to_id);
                false
            }
        }
    }

    /// Does the document have any incoming `supersedes` edge
    pub async fn is_superseded(&self, document_id: Uuid) -> bool {
        self.has_incoming(document_id, EdgeType::Supersedes).await
    }

    /// Does the document have any incoming `blocks` edge
    pub async fn is_blocked(&self, document_id: Uuid) -> bool {
        self.has_incoming(document_id, EdgeType::Blocks).await
    }

    /// One-hop check for any incoming edge of the given type; absent on error
    pub async fn has_incoming(&self, document_id: Uuid, edge_type: EdgeType) -> bool {
        match self.store.has_incoming_edge_type(document_id, edge_type).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Edge lookup failed for {document_id}: {e}");
                false
            }
        }
    }

    /// Merge raw aliases into the canonical name's alias set
    pub async fn create_or_update_alias(
        &self,
        session_id: Uuid,
        dataset: &str,
        canonical_name: &str,
        raw_aliases: &[String],
    ) -> bool {
        match self
            .store
            .upsert_alias(session_id, dataset, canonical_name, raw_aliases)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Alias upsert failed for {canonical_name}: {e}");
                false
            }
        }
    }

    /// Resolve a variable name to its canonical form: try the canonical
    /// names first, then each alias's raw spellings, otherwise return the
    /// input unchanged.
    pub async fn resolve_variable(&self, session_id: Uuid, dataset: &str, name: &str) -> String {
        let aliases = match self.store.list_aliases(session_id, dataset).await {
            Ok(aliases) => aliases,
            Err(e) => {
                warn!("Alias list failed for {dataset}: {e}");
                return name.to_string();
            }
        };

        let needle = normalize_variable(name);
        for (canonical, _) in &aliases {
            if normalize_variable(canonical) == needle {
                return canonical.clone();
            }
        }
        for (canonical, raws) in &aliases {
            if raws.iter().any(|raw| normalize_variable(raw) == needle) {
                return canonical.clone();
            }
        }

        name.to_string()
    }
}

/// Lowercase and strip underscores, hyphens and spaces
fn normalize_variable(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .collect()
}
