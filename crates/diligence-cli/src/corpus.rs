//! JSON evidence corpus and profile files.
//!
//! A corpus holds the already-ingested material a session retrieves from:
//!
//! ```json
//! {
//!   "chunks": [{"chunk_id": "deck-1", "document_set": "acme-deck", "text": "...",
//!               "metadata": {"startup_name": "Acme", "industry": "robotics", "invested": "no"}}],
//!   "rows":   [{"row_key": "acme", "fields": {"industry": "robotics", "revenue": 1200000}}]
//! }
//! ```
//!
//! Chunk metadata drives similar-startup search; `invested` is rewritten in
//! place by `diligence invest`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use diligence_core::{
    InMemoryStructuredStore, InMemoryVectorStore, StartupProfile, StructuredRecord, VectorChunk,
};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Corpus {
    #[serde(default)]
    pub chunks: Vec<VectorChunk>,
    #[serde(default)]
    pub rows: Vec<StructuredRecord>,
}

impl Corpus {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read corpus {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse corpus {}", path.display()))
    }

    /// Snapshot both stores, e.g. after an investment status update.
    pub fn from_stores(vector: &InMemoryVectorStore, structured: &InMemoryStructuredStore) -> Self {
        Self {
            chunks: vector.chunks(),
            rows: structured.rows().to_vec(),
        }
    }

    /// Write the corpus through a temporary file so a failed write keeps the old one.
    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self).context("Failed to serialize corpus")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)
            .with_context(|| format!("Failed to write corpus {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace corpus {}", path.display()))
    }

    pub fn into_stores(self) -> (Arc<InMemoryVectorStore>, Arc<InMemoryStructuredStore>) {
        (
            Arc::new(InMemoryVectorStore::new(self.chunks)),
            Arc::new(InMemoryStructuredStore::new(self.rows)),
        )
    }
}

pub fn load_profile(path: &Path) -> Result<StartupProfile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read profile {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse profile {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_corpus_and_profile() {
        let dir = tempfile::tempdir().unwrap();
        let corpus_path = dir.path().join("corpus.json");
        let mut file = std::fs::File::create(&corpus_path).unwrap();
        write!(
            file,
            r#"{{"chunks": [{{"chunk_id": "c1", "document_set": "acme-deck", "text": "Acme builds robots."}}],
                "rows": [{{"row_key": "acme", "fields": {{"industry": "robotics"}}}}]}}"#
        )
        .unwrap();

        let corpus = Corpus::load(&corpus_path).unwrap();
        assert_eq!(corpus.chunks.len(), 1);
        assert_eq!(corpus.rows.len(), 1);
        let (vector, structured) = corpus.into_stores();
        assert_eq!(vector.len(), 1);
        assert_eq!(structured.len(), 1);

        let profile_path = dir.path().join("profile.json");
        std::fs::write(
            &profile_path,
            r#"{"name": "Acme", "industry": "robotics", "document_set": "acme-deck"}"#,
        )
        .unwrap();
        let profile = load_profile(&profile_path).unwrap();
        assert_eq!(profile.name, "Acme");
        assert!(!profile.invested);
    }

    #[tokio::test]
    async fn test_saved_corpus_keeps_investment_updates() {
        use diligence_core::{OrchestratorConfig, RetrievalAdapter};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.json");
        std::fs::write(
            &path,
            r#"{"chunks": [{"chunk_id": "c1", "document_set": "acme-deck", "text": "Acme builds robots.",
                            "metadata": {"startup_name": "Acme", "industry": "robotics"}}]}"#,
        )
        .unwrap();

        let (vector, structured) = Corpus::load(&path).unwrap().into_stores();
        let adapter = RetrievalAdapter::new(
            vector.clone(),
            structured.clone(),
            &OrchestratorConfig::default(),
        );
        assert_eq!(adapter.update_investment_status("Acme", true).await.unwrap(), 1);
        Corpus::from_stores(&vector, &structured).save(&path).unwrap();

        let reloaded = Corpus::load(&path).unwrap();
        assert_eq!(reloaded.chunks[0].metadata["invested"], "yes");
        assert!(!dir.path().join("corpus.json.tmp").exists());
    }

    #[test]
    fn test_missing_corpus_names_the_file() {
        let err = Corpus::load(Path::new("/nonexistent/corpus.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/corpus.json"));
    }

    #[test]
    fn test_empty_corpus_is_allowed() {
        let corpus: Corpus = serde_json::from_str("{}").unwrap();
        assert!(corpus.chunks.is_empty() && corpus.rows.is_empty());
    }
}
