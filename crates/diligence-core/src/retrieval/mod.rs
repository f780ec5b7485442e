//! Retrieval adapter: one query interface over a vector similarity index and
//! a structured data source.
//!
//! The adapter owns the store handles it is constructed with, enforces the
//! per-call retrieval timeout, and merges both result sets with a
//! configurable ranking function (see [`RankingConfig`]). Ties are broken by
//! source priority: structured rows before text chunks before derived
//! session claims.
//!
//! With an [`Embedder`] configured, query terms are embedded before the
//! vector index is searched. Startup-level documents carry
//! `startup_name`, `industry` and `invested` metadata, which backs the
//! similar-startup search and investment status updates.

pub mod embed;
pub mod memory;

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use diligence_state::{EvidenceContent, EvidenceId, EvidenceItem, EvidenceSource, StartupProfile};

use crate::config::{OrchestratorConfig, RankingConfig};
use crate::metrics::METRICS;

pub use embed::{Embedder, HashingEmbedder};
pub use memory::{InMemoryStructuredStore, InMemoryVectorStore, StructuredRecord, VectorChunk};

/// Errors produced by the retrieval layer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetrievalError {
    #[error("{backend} store did not respond within {timeout_ms}ms")]
    Timeout { backend: String, timeout_ms: u64 },

    #[error("{backend} store unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("invalid retrieval query: {0}")]
    InvalidQuery(String),

    #[error("{backend} store does not support {operation}")]
    Unsupported { backend: String, operation: String },
}

impl RetrievalError {
    /// Timeouts and unreachable stores are worth retrying; bad queries are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RetrievalError::Timeout { .. } | RetrievalError::Unavailable { .. }
        )
    }
}

/// Result type for retrieval operations.
pub type RetrievalResult<T> = std::result::Result<T, RetrievalError>;

/// Parameters of a vector similarity search.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VectorSearch {
    /// Query embedding, if the caller has one.
    pub vector: Option<Vec<f32>>,
    /// Query terms, used by stores that fall back to lexical similarity.
    pub terms: String,
    pub top_k: usize,
    /// Exact-match metadata filters.
    pub filters: BTreeMap<String, String>,
}

/// One hit from the vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorHit {
    pub chunk_id: String,
    pub text: String,
    /// Similarity in `[0, 1]`.
    pub similarity: f64,
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Parameters of a structured query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructuredQuery {
    pub terms: String,
    /// Attribute filters; rows matching none of them are not returned.
    pub filters: BTreeMap<String, serde_json::Value>,
    pub limit: usize,
}

/// One row from the structured store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredRow {
    pub row_key: String,
    pub fields: BTreeMap<String, serde_json::Value>,
    /// Term relevance in `[0, 1]`.
    pub relevance: f64,
    /// How many of the query's filters this row satisfied.
    pub matched_filters: usize,
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
}

/// Metadata keys of startup-level documents in the vector index.
pub mod metadata {
    pub const STARTUP_NAME: &str = "startup_name";
    pub const INDUSTRY: &str = "industry";
    /// `"yes"` or `"no"`; documents without the key count as `"no"`.
    pub const INVESTED: &str = "invested";
    /// LinkedIn URLs joined with `|`.
    pub const LINKEDIN_URLS: &str = "linkedin_urls";

    pub fn invested_value(invested: bool) -> &'static str {
        if invested {
            "yes"
        } else {
            "no"
        }
    }
}

/// Consumed interface of the vector similarity index.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn search(&self, query: &VectorSearch) -> RetrievalResult<Vec<VectorHit>>;

    /// Set `key` to `value` on every document matching `filters`.
    ///
    /// Returns how many documents matched. Read-only indexes keep the default.
    async fn update_metadata(
        &self,
        _filters: &BTreeMap<String, String>,
        _key: &str,
        _value: &str,
    ) -> RetrievalResult<usize> {
        Err(RetrievalError::Unsupported {
            backend: "vector".to_string(),
            operation: "metadata updates".to_string(),
        })
    }
}

/// Consumed interface of the structured dataset.
#[async_trait]
pub trait StructuredStore: Send + Sync {
    async fn query(&self, query: &StructuredQuery) -> RetrievalResult<Vec<StructuredRow>>;
}

/// A hybrid query against both backends.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RetrievalQuery {
    pub terms: String,
    pub vector: Option<Vec<f32>>,
    pub vector_filters: BTreeMap<String, String>,
    pub structured_filters: BTreeMap<String, serde_json::Value>,
    pub top_k: usize,
}

impl RetrievalQuery {
    pub fn terms(terms: impl Into<String>, top_k: usize) -> Self {
        Self {
            terms: terms.into(),
            top_k,
            ..Self::default()
        }
    }
}

/// Search for startups similar to a description.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SimilarStartupQuery {
    pub terms: String,
    pub industry: Option<String>,
    pub invested: Option<bool>,
    /// Restrict to one startup's documents.
    pub startup_name: Option<String>,
    /// Leave this startup out of the results.
    pub exclude: Option<String>,
    pub top_k: usize,
}

impl SimilarStartupQuery {
    pub fn new(terms: impl Into<String>, top_k: usize) -> Self {
        Self {
            terms: terms.into(),
            top_k,
            ..Self::default()
        }
    }

    /// Startups in the profile's industry, described like the profile,
    /// excluding the profile's own startup.
    pub fn for_profile(profile: &StartupProfile, top_k: usize) -> Self {
        let description = profile.short_description.clone().unwrap_or_default();
        Self {
            terms: format!("{} {description}", profile.industry),
            industry: Some(profile.industry.clone()),
            exclude: Some(profile.name.clone()),
            top_k,
            ..Self::default()
        }
    }

    pub fn with_invested(mut self, invested: bool) -> Self {
        self.invested = Some(invested);
        self
    }

    fn filters(&self) -> BTreeMap<String, String> {
        let mut filters = BTreeMap::new();
        if let Some(industry) = &self.industry {
            filters.insert(metadata::INDUSTRY.to_string(), industry.clone());
        }
        if let Some(invested) = self.invested {
            filters.insert(
                metadata::INVESTED.to_string(),
                metadata::invested_value(invested).to_string(),
            );
        }
        if let Some(name) = &self.startup_name {
            filters.insert(metadata::STARTUP_NAME.to_string(), name.clone());
        }
        filters
    }
}

/// One startup found by [`RetrievalAdapter::similar_startups`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarStartup {
    pub startup_name: String,
    pub industry: Option<String>,
    pub invested: bool,
    pub linkedin_urls: Vec<String>,
    /// Similarity of the best-matching document.
    pub score: f64,
    pub chunk_id: String,
    pub text: String,
}

impl SimilarStartup {
    fn from_hit(hit: VectorHit) -> Option<Self> {
        let startup_name = hit.metadata.get(metadata::STARTUP_NAME)?.clone();
        let linkedin_urls = hit
            .metadata
            .get(metadata::LINKEDIN_URLS)
            .map(|urls| {
                urls.split('|')
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            startup_name,
            industry: hit.metadata.get(metadata::INDUSTRY).cloned(),
            invested: hit
                .metadata
                .get(metadata::INVESTED)
                .is_some_and(|v| v.eq_ignore_ascii_case("yes")),
            linkedin_urls,
            score: hit.similarity,
            chunk_id: hit.chunk_id,
            text: hit.text,
        })
    }
}

/// Uniform query interface over the vector and structured stores.
#[derive(Clone)]
pub struct RetrievalAdapter {
    vector: Arc<dyn VectorStore>,
    structured: Arc<dyn StructuredStore>,
    embedder: Option<Arc<dyn Embedder>>,
    ranking: RankingConfig,
    timeout: Duration,
}

impl RetrievalAdapter {
    pub fn new(
        vector: Arc<dyn VectorStore>,
        structured: Arc<dyn StructuredStore>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            vector,
            structured,
            embedder: None,
            ranking: config.ranking.clone(),
            timeout: config.retrieval_timeout(),
        }
    }

    /// Embed query terms with `embedder` before searching the vector index.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Query both stores concurrently and return at most `top_k` ranked items.
    ///
    /// Either backend failing fails the whole query, so callers never act on
    /// a silently one-sided result.
    #[instrument(skip(self, query), fields(terms = %query.terms, top_k = query.top_k))]
    pub async fn query(&self, query: &RetrievalQuery) -> RetrievalResult<Vec<EvidenceItem>> {
        self.query_with(query, &[]).await
    }

    /// Like [`query`](Self::query), additionally ranking `local` items
    /// (already-held session evidence) by lexical similarity to the terms.
    pub async fn query_with(
        &self,
        query: &RetrievalQuery,
        local: &[EvidenceItem],
    ) -> RetrievalResult<Vec<EvidenceItem>> {
        if query.top_k == 0 {
            return Err(RetrievalError::InvalidQuery("top_k must be at least 1".to_string()));
        }

        let vector_query = VectorSearch {
            vector: self.query_vector(query.vector.as_ref(), &query.terms).await?,
            terms: query.terms.clone(),
            top_k: query.top_k,
            filters: query.vector_filters.clone(),
        };
        let structured_query = StructuredQuery {
            terms: query.terms.clone(),
            filters: query.structured_filters.clone(),
            limit: query.top_k,
        };

        let (hits, rows) = tokio::try_join!(
            self.bounded("vector", self.vector.search(&vector_query)),
            self.bounded("structured", self.structured.query(&structured_query)),
        )?;

        debug!(vector_hits = hits.len(), rows = rows.len(), "retrieval backends answered");

        let now = Utc::now();
        let mut items = Vec::with_capacity(hits.len() + rows.len() + local.len());
        items.extend(hits.into_iter().map(|hit| self.score_hit(hit, now)));
        items.extend(
            rows.into_iter()
                .map(|row| self.score_row(row, query.structured_filters.len())),
        );
        items.extend(local.iter().map(|item| self.score_local(item, &query.terms)));

        Ok(rank(items, query.top_k))
    }

    /// Startups similar to `query`, best first, one entry per startup.
    #[instrument(skip(self, query), fields(terms = %query.terms, top_k = query.top_k))]
    pub async fn similar_startups(
        &self,
        query: &SimilarStartupQuery,
    ) -> RetrievalResult<Vec<SimilarStartup>> {
        if query.top_k == 0 {
            return Err(RetrievalError::InvalidQuery("top_k must be at least 1".to_string()));
        }
        // Several documents may belong to one startup.
        let search = VectorSearch {
            vector: self.query_vector(None, &query.terms).await?,
            terms: query.terms.clone(),
            top_k: query.top_k.saturating_mul(4),
            filters: query.filters(),
        };
        let hits = self.bounded("vector", self.vector.search(&search)).await?;

        let mut found: Vec<SimilarStartup> = Vec::new();
        for startup in hits.into_iter().filter_map(SimilarStartup::from_hit) {
            let excluded = query
                .exclude
                .as_deref()
                .is_some_and(|name| name.eq_ignore_ascii_case(&startup.startup_name));
            let seen = found
                .iter()
                .any(|s| s.startup_name.eq_ignore_ascii_case(&startup.startup_name));
            if !excluded && !seen {
                found.push(startup);
            }
        }
        found.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.startup_name.cmp(&b.startup_name))
        });
        found.truncate(query.top_k);
        debug!(found = found.len(), "similar startups");
        Ok(found)
    }

    /// Mark every document of `startup_name` as invested or not.
    ///
    /// Returns how many documents were updated.
    #[instrument(skip(self))]
    pub async fn update_investment_status(
        &self,
        startup_name: &str,
        invested: bool,
    ) -> RetrievalResult<usize> {
        let mut filters = BTreeMap::new();
        filters.insert(metadata::STARTUP_NAME.to_string(), startup_name.to_string());
        self.bounded(
            "vector",
            self.vector.update_metadata(
                &filters,
                metadata::INVESTED,
                metadata::invested_value(invested),
            ),
        )
        .await
    }

    async fn query_vector(
        &self,
        given: Option<&Vec<f32>>,
        terms: &str,
    ) -> RetrievalResult<Option<Vec<f32>>> {
        match (given, &self.embedder) {
            (Some(vector), _) => Ok(Some(vector.clone())),
            (None, Some(embedder)) if !terms.trim().is_empty() => self
                .bounded("embedder", embedder.embed(terms))
                .await
                .map(Some),
            _ => Ok(None),
        }
    }

    async fn bounded<T>(
        &self,
        backend: &str,
        call: impl std::future::Future<Output = RetrievalResult<T>>,
    ) -> RetrievalResult<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                METRICS.inc_retrieval_timeouts();
                Err(RetrievalError::Timeout {
                    backend: backend.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    fn combine(&self, similarity: f64, boost: f64) -> f64 {
        self.ranking.similarity_weight * similarity.clamp(0.0, 1.0)
            + self.ranking.boost_weight * boost.clamp(0.0, 1.0)
    }

    fn score_hit(&self, hit: VectorHit, now: DateTime<Utc>) -> EvidenceItem {
        let boost = recency_boost(hit.observed_at, now, self.ranking.recency_half_life_days);
        EvidenceItem {
            id: evidence_id(EvidenceSource::Vector, &hit.chunk_id),
            score: self.combine(hit.similarity, boost),
            source_id: hit.chunk_id,
            source: EvidenceSource::Vector,
            content: EvidenceContent::Text { text: hit.text },
            observed_at: hit.observed_at,
        }
    }

    fn score_row(&self, row: StructuredRow, filter_count: usize) -> EvidenceItem {
        let boost = if filter_count == 0 {
            0.0
        } else {
            row.matched_filters as f64 / filter_count as f64
        };
        EvidenceItem {
            id: evidence_id(EvidenceSource::Structured, &row.row_key),
            score: self.combine(row.relevance, boost),
            source_id: row.row_key,
            source: EvidenceSource::Structured,
            content: EvidenceContent::Row { fields: row.fields },
            observed_at: row.observed_at,
        }
    }

    fn score_local(&self, item: &EvidenceItem, terms: &str) -> EvidenceItem {
        let mut scored = item.clone();
        scored.score = self.combine(lexical_similarity(terms, &item.text()), 0.0);
        scored
    }
}

/// Deterministic evidence id: the same record always gets the same id, so
/// retried attempts cite identical evidence.
pub fn evidence_id(source: EvidenceSource, source_id: &str) -> EvidenceId {
    EvidenceId::new(format!("{source}:{source_id}"))
}

/// Sort by descending score, then source priority, then source id; keep `top_k`.
pub fn rank(mut items: Vec<EvidenceItem>, top_k: usize) -> Vec<EvidenceItem> {
    items.sort_by(compare_ranked);
    let mut seen = BTreeSet::new();
    items.retain(|item| seen.insert(item.id.clone()));
    items.truncate(top_k);
    items
}

fn compare_ranked(a: &EvidenceItem, b: &EvidenceItem) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.source.priority().cmp(&b.source.priority()))
        .then_with(|| a.source_id.cmp(&b.source_id))
}

/// Exponential recency decay; zero when undated or disabled.
pub fn recency_boost(
    observed_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    half_life_days: Option<f64>,
) -> f64 {
    match (observed_at, half_life_days) {
        (Some(at), Some(half_life)) if half_life > 0.0 => {
            let age_days = (now - at).num_seconds().max(0) as f64 / 86_400.0;
            0.5f64.powf(age_days / half_life)
        }
        _ => 0.0,
    }
}

const STOPWORDS: &[&str] = &[
    "and", "are", "does", "for", "from", "has", "have", "how", "its", "our", "that", "the",
    "their", "this", "was", "were", "what", "when", "where", "which", "who", "why", "with",
];

/// Lower-cased alphanumeric words of at least three characters, minus stopwords.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(|w| w.to_lowercase())
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Fraction of query terms that occur in `text`.
pub fn lexical_similarity(query: &str, text: &str) -> f64 {
    let wanted = tokenize(query);
    if wanted.is_empty() {
        return 0.0;
    }
    let present = tokenize(text);
    let hits = wanted.iter().filter(|w| present.contains(*w)).count();
    hits as f64 / wanted.len() as f64
}
