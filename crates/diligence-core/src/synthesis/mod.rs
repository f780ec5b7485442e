//! Synthesis composer: merges a session's agent outputs into one briefing,
//! and answers follow-up questions from retrieved evidence.
//!
//! A section whose task failed or was cancelled is rendered with an explicit
//! insufficient-data marker. A task that succeeded without claims is a
//! distinct "no finding" section. Answers are extractive and never produced
//! without relevant evidence.
//!
//! A finished session's briefing closes with a market-size check and a
//! risk-scored recommendation (see [`assessment`]).

pub mod assessment;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use diligence_state::{
    AgentKind, Claim, EvidenceId, EvidenceItem, EvidenceSource, SessionId, SessionRecord,
    SessionStatus, TaskId, TaskState,
};

use crate::agents::extractive::lead_sentence;
use crate::obs::SessionSpan;
use crate::retrieval::{RetrievalAdapter, RetrievalError, RetrievalQuery};

pub use assessment::{MarketSizeCheck, Recommendation, RiskFactor, Verdict};

/// Errors produced by the composer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SynthesisError {
    /// No relevant evidence for the question; callers should say "cannot answer".
    #[error("insufficient context to answer: {question}")]
    InsufficientContext { question: String },

    #[error("claim in {section} cites missing evidence {evidence_id}")]
    DanglingCitation {
        section: String,
        evidence_id: String,
    },

    #[error("retrieval failed: {0}")]
    Retrieval(#[from] RetrievalError),
}

/// Result type for synthesis operations.
pub type ComposeResult<T> = std::result::Result<T, SynthesisError>;

/// Outcome of one briefing section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SectionStatus {
    /// Succeeded with at least one claim.
    Complete,
    /// Succeeded, but the analysis found nothing to report.
    NoFinding,
    /// The task failed or was cancelled.
    InsufficientData { reason: String },
    /// The task has not finished yet.
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub kind: AgentKind,
    pub title: String,
    pub status: SectionStatus,
    pub claims: Vec<Claim>,
    /// Optional inputs that were unavailable when the section was produced.
    pub gaps: Vec<TaskId>,
}

impl Section {
    pub fn is_insufficient(&self) -> bool {
        matches!(self.status, SectionStatus::InsufficientData { .. })
    }
}

/// A resolved reference to session evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub id: EvidenceId,
    pub source: EvidenceSource,
    pub source_id: String,
    pub excerpt: String,
}

impl Citation {
    fn from_item(item: &EvidenceItem) -> Self {
        Self {
            id: item.id.clone(),
            source: item.source,
            source_id: item.source_id.clone(),
            excerpt: lead_sentence(item),
        }
    }
}

/// The final briefing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisResult {
    pub session_id: SessionId,
    pub startup: String,
    pub status: SessionStatus,
    pub sections: Vec<Section>,
    /// Sections that could not be produced.
    pub missing: Vec<AgentKind>,
    /// Every cited evidence item, by id.
    pub citations: Vec<Citation>,
    /// Present once the session is terminal.
    #[serde(default)]
    pub recommendation: Option<Recommendation>,
    pub generated_at: DateTime<Utc>,
}

impl SynthesisResult {
    pub fn has_insufficient_data(&self) -> bool {
        self.sections.iter().any(Section::is_insufficient)
    }

    pub fn section(&self, kind: AgentKind) -> Option<&Section> {
        self.sections.iter().find(|s| s.kind == kind)
    }

    /// Render the briefing as markdown with inline citation markers.
    pub fn to_markdown(&self) -> String {
        let mut out = format!("# Diligence briefing: {} ({})\n", self.startup, self.status);
        for section in &self.sections {
            out.push_str(&format!("\n## {}\n", section.title));
            match &section.status {
                SectionStatus::Complete => {
                    for claim in &section.claims {
                        out.push_str(&format!("- {}{}\n", claim.text, markers(&claim.citations)));
                    }
                }
                SectionStatus::NoFinding => out.push_str("_No findings._\n"),
                SectionStatus::InsufficientData { reason } => {
                    out.push_str(&format!("**Insufficient data:** {reason}\n"))
                }
                SectionStatus::Pending => out.push_str("_Analysis in progress._\n"),
            }
            if !section.gaps.is_empty() {
                let gaps: Vec<_> = section.gaps.iter().map(|g| g.as_str()).collect();
                out.push_str(&format!("_Produced without: {}_\n", gaps.join(", ")));
            }
        }
        if let Some(rec) = &self.recommendation {
            out.push_str("\n## Market Size Validation & Commentary\n");
            out.push_str(&format!(
                "{}{}\n",
                rec.market.commentary,
                markers(rec.market.citation.as_slice())
            ));
            out.push_str("\n## Recommendation\n");
            out.push_str(&format!(
                "**{}** (risk score {}/10)\n",
                rec.verdict, rec.risk_score
            ));
            for factor in &rec.factors {
                out.push_str(&format!(
                    "- {} ({:+}){}\n",
                    factor.description,
                    factor.weight,
                    markers(&factor.citations)
                ));
            }
        }
        if !self.citations.is_empty() {
            out.push_str("\n## Sources\n");
            for c in &self.citations {
                out.push_str(&format!("- [{}] {} ({})\n", c.id, c.excerpt, c.source));
            }
        }
        out
    }
}

/// A grounded answer to a conversational question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub question: String,
    /// Answer prose with inline `[evidence-id]` markers.
    pub text: String,
    pub claims: Vec<Claim>,
    pub citations: Vec<Citation>,
}

fn markers(ids: &[EvidenceId]) -> String {
    ids.iter().map(|id| format!(" [{id}]")).collect()
}

#[derive(Clone)]
pub struct SynthesisComposer {
    adapter: RetrievalAdapter,
    top_k: usize,
    min_relevance: f64,
}

impl SynthesisComposer {
    pub fn new(adapter: RetrievalAdapter, top_k: usize, min_relevance: f64) -> Self {
        Self {
            adapter,
            top_k,
            min_relevance,
        }
    }

    /// Merge the session's outputs into a briefing.
    pub fn compose(&self, record: &SessionRecord) -> ComposeResult<SynthesisResult> {
        let _span = SessionSpan::enter(&record.session_id);
        let mut sections = Vec::new();
        let mut missing = Vec::new();
        let mut cited: BTreeMap<EvidenceId, Citation> = BTreeMap::new();

        for kind in AgentKind::ALL {
            let Some(task) = record.task_by_kind(kind) else {
                continue;
            };
            let (status, claims) = match task.state {
                TaskState::Succeeded => {
                    let claims = task
                        .output
                        .as_ref()
                        .map(|o| o.claims.clone())
                        .unwrap_or_default();
                    if claims.is_empty() {
                        (SectionStatus::NoFinding, claims)
                    } else {
                        (SectionStatus::Complete, claims)
                    }
                }
                TaskState::Failed | TaskState::Cancelled => {
                    missing.push(kind);
                    let reason = task
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("task {}", task.state));
                    (SectionStatus::InsufficientData { reason }, Vec::new())
                }
                _ => (SectionStatus::Pending, Vec::new()),
            };

            for claim in &claims {
                for id in &claim.citations {
                    let item = record.evidence.get(id).ok_or_else(|| {
                        SynthesisError::DanglingCitation {
                            section: kind.to_string(),
                            evidence_id: id.to_string(),
                        }
                    })?;
                    cited
                        .entry(id.clone())
                        .or_insert_with(|| Citation::from_item(item));
                }
            }

            sections.push(Section {
                kind,
                title: kind.title().to_string(),
                status,
                claims,
                gaps: task.gaps.clone(),
            });
        }

        let recommendation = record
            .status
            .is_terminal()
            .then(|| assessment::assess(record, &sections));
        for id in recommendation.iter().flat_map(|r| r.cited_ids()) {
            if let Some(item) = record.evidence.get(id) {
                cited
                    .entry(id.clone())
                    .or_insert_with(|| Citation::from_item(item));
            }
        }

        Ok(SynthesisResult {
            session_id: record.session_id.clone(),
            startup: record.profile.name.clone(),
            status: record.status,
            sections,
            missing,
            citations: cited.into_values().collect(),
            recommendation,
            generated_at: Utc::now(),
        })
    }

    /// Answer `question` from evidence relevant to it.
    ///
    /// Candidates are fresh retrieval results plus the session's own
    /// evidence (including indexed summary claims), ranked by the same
    /// adapter. Only candidates whose ranking score reaches `min_relevance`
    /// count, so evidence matched by embedding needs no shared words.
    #[instrument(skip(self, record), fields(session_id = %record.session_id))]
    pub async fn answer(&self, record: &SessionRecord, question: &str) -> ComposeResult<Answer> {
        let mut query = RetrievalQuery::terms(question, self.top_k);
        query.vector_filters.insert(
            "document_set".to_string(),
            record.profile.document_set.clone(),
        );
        let held: Vec<EvidenceItem> = record.evidence.values().cloned().collect();
        let ranked = self.adapter.query_with(&query, &held).await?;

        let relevant: Vec<EvidenceItem> = ranked
            .into_iter()
            .filter(|item| item.score >= self.min_relevance)
            .take(3)
            .collect();

        if relevant.is_empty() {
            return Err(SynthesisError::InsufficientContext {
                question: question.to_string(),
            });
        }

        let claims: Vec<Claim> = relevant
            .iter()
            .map(|item| Claim::new(lead_sentence(item), vec![item.id.clone()]))
            .collect();
        let text = claims
            .iter()
            .map(|c| format!("{}{}", c.text, markers(&c.citations)))
            .collect::<Vec<_>>()
            .join(" ");

        Ok(Answer {
            question: question.to_string(),
            text,
            claims,
            citations: relevant.iter().map(Citation::from_item).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use diligence_state::{AgentOutput, EvidenceContent, NewSession, StartupProfile, TaskRecord};

    use crate::config::OrchestratorConfig;
    use crate::retrieval::{evidence_id, InMemoryStructuredStore, InMemoryVectorStore};

    fn composer() -> SynthesisComposer {
        let config = OrchestratorConfig::default();
        let adapter = RetrievalAdapter::new(
            Arc::new(InMemoryVectorStore::default()),
            Arc::new(InMemoryStructuredStore::default()),
            &config,
        );
        SynthesisComposer::new(adapter, config.top_k, config.min_relevance)
    }

    fn evidence(id: &str, text: &str) -> EvidenceItem {
        EvidenceItem {
            id: evidence_id(EvidenceSource::Vector, id),
            source_id: id.to_string(),
            source: EvidenceSource::Vector,
            score: 0.5,
            content: EvidenceContent::Text {
                text: text.to_string(),
            },
            observed_at: None,
        }
    }

    fn task(kind: AgentKind, state: TaskState, claims: Vec<Claim>) -> TaskRecord {
        let mut t = TaskRecord::new(TaskId::from(kind), kind, vec![]);
        t.state = state;
        if state == TaskState::Succeeded {
            t.output = Some(AgentOutput::new(kind, claims));
        } else if state == TaskState::Failed {
            t.error = Some("model unavailable".to_string());
        }
        t
    }

    fn record(tasks: Vec<TaskRecord>, items: Vec<EvidenceItem>) -> SessionRecord {
        let mut rec = SessionRecord::from_new(
            SessionId::new(),
            NewSession {
                profile: StartupProfile::new("Acme", "robotics", "acme-deck"),
                questions: vec![],
                tasks,
                deadline_at: Utc::now(),
                max_concurrent: 2,
            },
        );
        for item in items {
            rec.evidence.insert(item.id.clone(), item);
        }
        rec
    }

    #[test]
    fn test_failed_section_is_marked_not_omitted() {
        let e = evidence("a", "Acme builds robots.");
        let rec = record(
            vec![
                task(
                    AgentKind::Summary,
                    TaskState::Succeeded,
                    vec![Claim::new("Acme builds robots.", vec![e.id.clone()])],
                ),
                task(AgentKind::Competitor, TaskState::Failed, vec![]),
                task(AgentKind::Industry, TaskState::Succeeded, vec![]),
            ],
            vec![e],
        );
        let result = composer().compose(&rec).unwrap();

        assert_eq!(result.sections.len(), 3);
        assert_eq!(result.section(AgentKind::Summary).unwrap().status, SectionStatus::Complete);
        assert_eq!(
            result.section(AgentKind::Competitor).unwrap().status,
            SectionStatus::InsufficientData {
                reason: "model unavailable".to_string()
            }
        );
        assert_eq!(result.section(AgentKind::Industry).unwrap().status, SectionStatus::NoFinding);
        assert_eq!(result.missing, vec![AgentKind::Competitor]);
        assert_eq!(result.citations.len(), 1);
        assert!(result.to_markdown().contains("Insufficient data"));
    }

    #[test]
    fn test_dangling_citation_is_an_error() {
        let rec = record(
            vec![task(
                AgentKind::Summary,
                TaskState::Succeeded,
                vec![Claim::new("made up", vec![EvidenceId::new("vector:ghost")])],
            )],
            vec![],
        );
        let err = composer().compose(&rec).unwrap_err();
        assert!(matches!(err, SynthesisError::DanglingCitation { .. }));
    }

    #[test]
    fn test_recommendation_only_for_finished_sessions() {
        let e = evidence("a", "Acme builds robots.");
        let mut rec = record(
            vec![task(
                AgentKind::Summary,
                TaskState::Succeeded,
                vec![Claim::new("Acme builds robots.", vec![e.id.clone()])],
            )],
            vec![e],
        );
        let running = composer().compose(&rec).unwrap();
        assert!(running.recommendation.is_none());
        assert!(!running.to_markdown().contains("## Recommendation"));

        rec.status = SessionStatus::Completed;
        let done = composer().compose(&rec).unwrap();
        let verdict = done.recommendation.as_ref().unwrap();
        assert!((1..=10).contains(&verdict.risk_score));
        let md = done.to_markdown();
        assert!(md.contains("## Market Size Validation & Commentary"));
        assert!(md.contains(&format!("risk score {}/10", verdict.risk_score)));
    }

    #[tokio::test]
    async fn test_answer_uses_session_evidence() {
        let rec = record(vec![], vec![evidence("burn", "Monthly burn is 200k dollars.")]);
        let answer = composer().answer(&rec, "What is the monthly burn?").await.unwrap();
        assert_eq!(answer.citations.len(), 1);
        assert!(answer.text.contains("[vector:burn]"));
    }

    #[tokio::test]
    async fn test_answer_without_evidence_is_insufficient() {
        let rec = record(vec![], vec![evidence("team", "The team met in college.")]);
        let err = composer()
            .answer(&rec, "What are the patent filings?")
            .await
            .unwrap_err();
        assert!(matches!(err, SynthesisError::InsufficientContext { .. }));
    }
}
