//! In-memory retrieval backends.
//!
//! Used by tests and by the CLI, which loads them from a JSON corpus. The
//! structured store is read-only once constructed; the vector store accepts
//! metadata updates and embedding backfill.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    lexical_similarity, metadata, Embedder, RetrievalResult, StructuredQuery, StructuredRow, StructuredStore,
    VectorHit, VectorSearch, VectorStore,
};

/// An already-embedded document chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorChunk {
    pub chunk_id: String,
    /// Document set the chunk was ingested under (see `StartupProfile::document_set`).
    pub document_set: String,
    pub text: String,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
}

/// Vector index held in memory.
///
/// Scores by cosine similarity when both query and chunk carry an
/// embedding, otherwise by lexical overlap with the query terms.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    chunks: RwLock<Vec<VectorChunk>>,
}

impl InMemoryVectorStore {
    pub fn new(chunks: Vec<VectorChunk>) -> Self {
        Self {
            chunks: RwLock::new(chunks),
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Copy of the current chunks, including metadata updates.
    pub fn chunks(&self) -> Vec<VectorChunk> {
        self.read().clone()
    }

    /// Embed every chunk that has no embedding yet. Returns how many were filled.
    pub async fn embed_missing(&self, embedder: &dyn Embedder) -> RetrievalResult<usize> {
        let pending: Vec<(String, String)> = self
            .read()
            .iter()
            .filter(|c| c.embedding.is_none())
            .map(|c| (c.chunk_id.clone(), c.text.clone()))
            .collect();

        let mut embedded = BTreeMap::new();
        for (chunk_id, text) in pending {
            embedded.insert(chunk_id, embedder.embed(&text).await?);
        }

        let mut chunks = self.write();
        let mut filled = 0;
        for chunk in chunks.iter_mut().filter(|c| c.embedding.is_none()) {
            if let Some(vector) = embedded.remove(&chunk.chunk_id) {
                chunk.embedding = Some(vector);
                filled += 1;
            }
        }
        Ok(filled)
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<VectorChunk>> {
        self.chunks.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<VectorChunk>> {
        self.chunks.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn matches(chunk: &VectorChunk, filters: &BTreeMap<String, String>) -> bool {
        filters.iter().all(|(key, want)| {
            let have = match key.as_str() {
                "document_set" => Some(chunk.document_set.as_str()),
                metadata::INVESTED => Some(
                    chunk
                        .metadata
                        .get(key)
                        .map(String::as_str)
                        .unwrap_or(metadata::invested_value(false)),
                ),
                _ => chunk.metadata.get(key).map(String::as_str),
            };
            have.is_some_and(|v| v.eq_ignore_ascii_case(want))
        })
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn search(&self, query: &VectorSearch) -> RetrievalResult<Vec<VectorHit>> {
        let mut hits: Vec<VectorHit> = self
            .read()
            .iter()
            .filter(|c| Self::matches(c, &query.filters))
            .map(|c| {
                let similarity = match (&query.vector, &c.embedding) {
                    (Some(q), Some(e)) => cosine(q, e),
                    _ => lexical_similarity(&query.terms, &c.text),
                };
                VectorHit {
                    chunk_id: c.chunk_id.clone(),
                    text: c.text.clone(),
                    similarity,
                    observed_at: c.observed_at,
                    metadata: c.metadata.clone(),
                }
            })
            .filter(|h| h.similarity > 0.0)
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(query.top_k);
        Ok(hits)
    }

    async fn update_metadata(
        &self,
        filters: &BTreeMap<String, String>,
        key: &str,
        value: &str,
    ) -> RetrievalResult<usize> {
        let mut chunks = self.write();
        let mut updated = 0;
        for chunk in chunks.iter_mut().filter(|c| Self::matches(c, filters)) {
            chunk.metadata.insert(key.to_string(), value.to_string());
            updated += 1;
        }
        Ok(updated)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum();
    let na: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let nb: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        (dot / (na * nb)).max(0.0)
    }
}

/// A curated structured record (competitor row, market datum, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredRecord {
    pub row_key: String,
    pub fields: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
}

/// Structured dataset held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStructuredStore {
    rows: Vec<StructuredRecord>,
}

impl InMemoryStructuredStore {
    pub fn new(rows: Vec<StructuredRecord>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[StructuredRecord] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn field_matches(have: &serde_json::Value, want: &serde_json::Value) -> bool {
    match (have, want) {
        (serde_json::Value::String(h), serde_json::Value::String(w)) => h.eq_ignore_ascii_case(w),
        (h, w) => h == w,
    }
}

fn row_text(fields: &BTreeMap<String, serde_json::Value>) -> String {
    fields
        .values()
        .map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl StructuredStore for InMemoryStructuredStore {
    async fn query(&self, query: &StructuredQuery) -> RetrievalResult<Vec<StructuredRow>> {
        let mut rows: Vec<StructuredRow> = self
            .rows
            .iter()
            .filter_map(|r| {
                let matched = query
                    .filters
                    .iter()
                    .filter(|(k, want)| r.fields.get(*k).is_some_and(|h| field_matches(h, want)))
                    .count();
                if !query.filters.is_empty() && matched == 0 {
                    return None;
                }
                let relevance = lexical_similarity(&query.terms, &row_text(&r.fields));
                if query.filters.is_empty() && relevance == 0.0 {
                    return None;
                }
                Some(StructuredRow {
                    row_key: r.row_key.clone(),
                    fields: r.fields.clone(),
                    relevance,
                    matched_filters: matched,
                    observed_at: r.observed_at,
                })
            })
            .collect();

        rows.sort_by(|a, b| {
            b.matched_filters
                .cmp(&a.matched_filters)
                .then_with(|| b.relevance.total_cmp(&a.relevance))
                .then_with(|| a.row_key.cmp(&b.row_key))
        });
        rows.truncate(query.limit);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunk(id: &str, set: &str, text: &str) -> VectorChunk {
        VectorChunk {
            chunk_id: id.to_string(),
            document_set: set.to_string(),
            text: text.to_string(),
            embedding: None,
            metadata: BTreeMap::new(),
            observed_at: None,
        }
    }

    fn record(key: &str, fields: serde_json::Value) -> StructuredRecord {
        StructuredRecord {
            row_key: key.to_string(),
            fields: serde_json::from_value(fields).unwrap(),
            observed_at: None,
        }
    }

    #[tokio::test]
    async fn test_vector_search_filters_by_document_set() {
        let store = InMemoryVectorStore::new(vec![
            chunk("a1", "acme", "Acme builds warehouse robots"),
            chunk("b1", "other", "Other builds warehouse robots"),
        ]);
        let mut filters = BTreeMap::new();
        filters.insert("document_set".to_string(), "acme".to_string());
        let hits = store
            .search(&VectorSearch {
                terms: "warehouse robots".to_string(),
                top_k: 5,
                filters,
                ..VectorSearch::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "a1");
    }

    #[tokio::test]
    async fn test_vector_search_prefers_embeddings() {
        let mut near = chunk("near", "acme", "unrelated words");
        near.embedding = Some(vec![1.0, 0.0]);
        let mut far = chunk("far", "acme", "unrelated words");
        far.embedding = Some(vec![0.0, 1.0]);
        let store = InMemoryVectorStore::new(vec![far, near]);
        let hits = store
            .search(&VectorSearch {
                vector: Some(vec![1.0, 0.1]),
                top_k: 5,
                ..VectorSearch::default()
            })
            .await
            .unwrap();
        assert_eq!(hits[0].chunk_id, "near");
    }

    fn startup_chunk(id: &str, name: &str, industry: &str, text: &str) -> VectorChunk {
        let mut c = chunk(id, "portfolio", text);
        c.metadata.insert(metadata::STARTUP_NAME.to_string(), name.to_string());
        c.metadata.insert(metadata::INDUSTRY.to_string(), industry.to_string());
        c
    }

    #[tokio::test]
    async fn test_update_metadata_marks_matching_chunks() {
        let store = InMemoryVectorStore::new(vec![
            startup_chunk("a1", "Acme", "robotics", "Acme picks pallets"),
            startup_chunk("a2", "Acme", "robotics", "Acme raised a seed round"),
            startup_chunk("b1", "Botly", "robotics", "Botly sorts parcels"),
        ]);
        let mut by_name = BTreeMap::new();
        by_name.insert(metadata::STARTUP_NAME.to_string(), "acme".to_string());
        let updated = store
            .update_metadata(&by_name, metadata::INVESTED, "yes")
            .await
            .unwrap();
        assert_eq!(updated, 2);

        // Chunks without the key count as not invested.
        let mut not_invested = BTreeMap::new();
        not_invested.insert(metadata::INVESTED.to_string(), "no".to_string());
        let hits = store
            .search(&VectorSearch {
                terms: "pallets parcels seed".to_string(),
                top_k: 10,
                filters: not_invested,
                ..VectorSearch::default()
            })
            .await
            .unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["b1"]);
        assert_eq!(hits[0].metadata.get(metadata::STARTUP_NAME).unwrap(), "Botly");
    }

    #[tokio::test]
    async fn test_embed_missing_fills_only_bare_chunks() {
        let mut pre = chunk("pre", "acme", "already embedded");
        pre.embedding = Some(vec![1.0; 16]);
        let store = InMemoryVectorStore::new(vec![pre, chunk("bare", "acme", "warehouse robots")]);
        let embedder = super::super::HashingEmbedder::new(16);
        assert_eq!(store.embed_missing(&embedder).await.unwrap(), 1);
        assert_eq!(store.embed_missing(&embedder).await.unwrap(), 0);
        let chunks = store.chunks();
        assert_eq!(chunks[0].embedding, Some(vec![1.0; 16]));
        assert_eq!(chunks[1].embedding, Some(embedder.embed_text("warehouse robots")));
    }

    #[tokio::test]
    async fn test_structured_query_counts_matched_filters() {
        let store = InMemoryStructuredStore::new(vec![
            record("c1", json!({"name": "Botly", "industry": "Robotics", "revenue": 12.5})),
            record("c2", json!({"name": "Farmly", "industry": "agtech"})),
        ]);
        let mut filters = BTreeMap::new();
        filters.insert("industry".to_string(), json!("robotics"));
        let rows = store
            .query(&StructuredQuery {
                terms: "competitor".to_string(),
                filters,
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row_key, "c1");
        assert_eq!(rows[0].matched_filters, 1);
    }
}
