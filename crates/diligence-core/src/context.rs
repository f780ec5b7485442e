//! Token-budgeted context assembly for one agent invocation.
//!
//! The fixed part of a context (profile summary, completed upstream outputs)
//! is always included. Ranked evidence fills the remaining budget as a
//! prefix: packing stops at the first item that does not fit, so the kept
//! set is always the highest-ranked items in their original order. At least
//! one item is kept whenever any evidence exists.
//!
//! Web search first looks for coverage of the startup itself and falls back
//! to industry-wide coverage when none of the results mention it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use diligence_state::{
    AgentKind, AgentOutput, AttemptId, EvidenceItem, EvidenceSource, SessionId, SessionRecord,
    StartupProfile, TaskId, TaskRecord, TaskState,
};

use crate::config::{ConfigError, OrchestratorConfig};
use crate::retrieval::{RetrievalAdapter, RetrievalQuery, RetrievalResult};

/// Rough token estimate: one token per four bytes.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Budget constraints for context assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextBudget {
    pub max_tokens: usize,
    pub reserved_tokens: usize,
}

impl ContextBudget {
    pub fn new(max_tokens: usize, reserved_tokens: usize) -> Result<Self, ConfigError> {
        if reserved_tokens >= max_tokens {
            return Err(ConfigError::Invalid(format!(
                "reserved_tokens ({reserved_tokens}) must be less than max_tokens ({max_tokens})"
            )));
        }
        Ok(Self {
            max_tokens,
            reserved_tokens,
        })
    }

    /// Available tokens after reserving space for the agent's own output.
    pub fn available(&self) -> usize {
        self.max_tokens - self.reserved_tokens
    }
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            max_tokens: 8_000,
            reserved_tokens: 1_000,
        }
    }
}

/// Output of a completed upstream task, as seen by a dependent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamOutput {
    pub task_id: TaskId,
    pub output: AgentOutput,
}

/// Which coverage a web search ended up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchScope {
    StartupSpecific,
    /// Nothing mentioned the startup; results describe its industry.
    IndustryWide,
}

/// The bounded input bundle handed to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentContext {
    pub session_id: SessionId,
    pub attempt: AttemptId,
    pub kind: AgentKind,
    pub profile: StartupProfile,
    pub profile_summary: String,
    pub questions: Vec<String>,
    pub upstream: Vec<UpstreamOutput>,
    /// Optional upstream tasks that did not succeed.
    pub gaps: Vec<TaskId>,
    /// Ranked evidence that fit the budget, highest first.
    pub evidence: Vec<EvidenceItem>,
    pub total_tokens: usize,
    pub dropped_evidence: usize,
    /// Set for web search contexts.
    #[serde(default)]
    pub search_scope: Option<SearchScope>,
}

impl AgentContext {
    pub fn evidence_by_id(&self) -> BTreeMap<&str, &EvidenceItem> {
        self.evidence.iter().map(|e| (e.id.as_str(), e)).collect()
    }

    /// Render the bundle as one prompt-ready document.
    pub fn render(&self) -> String {
        let mut out = format!("# {}\n{}\n", self.kind.title(), self.profile_summary);
        if !self.profile.linkedin_urls.is_empty() {
            out.push_str(&format!("LinkedIn: {}\n", self.profile.linkedin_urls.join(", ")));
        }
        if self.search_scope == Some(SearchScope::IndustryWide) {
            out.push_str(&format!(
                "No coverage of {} was found; results describe the {} industry.\n",
                self.profile.name, self.profile.industry
            ));
        }
        for up in &self.upstream {
            out.push_str(&format!("\n## From {}\n", up.task_id));
            for claim in &up.output.claims {
                out.push_str(&format!("- {}\n", claim.text));
            }
        }
        if !self.gaps.is_empty() {
            let gaps: Vec<_> = self.gaps.iter().map(|g| g.as_str()).collect();
            out.push_str(&format!("\nMissing inputs: {}\n", gaps.join(", ")));
        }
        if !self.questions.is_empty() {
            out.push_str("\n## Questions\n");
            for q in &self.questions {
                out.push_str(&format!("- {q}\n"));
            }
        }
        out.push_str("\n## Evidence\n");
        for item in &self.evidence {
            out.push_str(&format!("[{}] {}\n", item.id, item.text()));
        }
        out
    }
}

/// Keep the longest ranked prefix of `ranked` that fits in `available`
/// tokens, but never fewer than one item. Returns `(kept, dropped_count)`.
pub fn pack_evidence(ranked: Vec<EvidenceItem>, available: usize) -> (Vec<EvidenceItem>, usize) {
    let total = ranked.len();
    let mut used = 0;
    let mut kept = Vec::new();
    for item in ranked {
        let cost = estimate_tokens(&item.text());
        if !kept.is_empty() && used + cost > available {
            break;
        }
        used += cost;
        kept.push(item);
    }
    let dropped = total - kept.len();
    (kept, dropped)
}

/// Retrieval query for a task kind, derived from the profile and questions.
pub fn query_for(
    kind: AgentKind,
    profile: &StartupProfile,
    questions: &[String],
    top_k: usize,
) -> RetrievalQuery {
    let description = profile.short_description.clone().unwrap_or_default();
    let mut query = RetrievalQuery::terms(String::new(), top_k);
    let own_documents = || {
        let mut filters = BTreeMap::new();
        filters.insert("document_set".to_string(), profile.document_set.clone());
        filters
    };
    let by_industry = || {
        let mut filters = BTreeMap::new();
        filters.insert(
            "industry".to_string(),
            serde_json::Value::String(profile.industry.clone()),
        );
        filters
    };

    match kind {
        AgentKind::Summary => {
            query.terms = format!(
                "{} {description} overview product business model team funding",
                profile.name
            );
            query.vector_filters = own_documents();
            let mut filters = BTreeMap::new();
            filters.insert(
                "name".to_string(),
                serde_json::Value::String(profile.name.clone()),
            );
            query.structured_filters = filters;
        }
        AgentKind::Competitor => {
            query.terms = format!(
                "{} {} competitor competitors revenue employee growth funding",
                profile.name, profile.industry
            );
            query.vector_filters = own_documents();
            query.structured_filters = by_industry();
        }
        AgentKind::Industry => {
            query.terms = format!(
                "{} industry market size growth trends outlook regulation",
                profile.industry
            );
            query.structured_filters = by_industry();
        }
        AgentKind::WebSearch => {
            query.terms = format!(
                "{} {} news trends recent launch innovations",
                profile.name, profile.industry
            );
        }
        AgentKind::Qa => {
            query.terms = format!("{} {}", profile.name, questions.join(" "));
            query.vector_filters = own_documents();
        }
    }
    query
}

/// Industry-wide query used when a web search finds nothing on the startup.
pub fn industry_fallback_query(profile: &StartupProfile, top_k: usize) -> RetrievalQuery {
    let mut query = RetrievalQuery::terms(
        format!("{} industry trends recent news market", profile.industry),
        top_k,
    );
    query.structured_filters.insert(
        "industry".to_string(),
        serde_json::Value::String(profile.industry.clone()),
    );
    query
}

/// Whether any result mentions the startup by name.
pub fn mentions_startup(items: &[EvidenceItem], startup_name: &str) -> bool {
    let name = startup_name.trim().to_lowercase();
    !name.is_empty()
        && items
            .iter()
            .any(|item| item.text().to_lowercase().contains(&name))
}

/// Builds agent contexts from session state and fresh retrieval.
#[derive(Clone)]
pub struct ContextAssembler {
    adapter: RetrievalAdapter,
    budget: ContextBudget,
    top_k: usize,
}

impl ContextAssembler {
    pub fn new(adapter: RetrievalAdapter, config: &OrchestratorConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            adapter,
            budget: ContextBudget::new(config.max_context_tokens, config.reserved_context_tokens)?,
            top_k: config.top_k,
        })
    }

    /// Assemble the context for `task` from the current session record.
    #[instrument(skip(self, record, task, attempt), fields(task_id = %task.task_id, attempt = attempt.number))]
    pub async fn assemble(
        &self,
        record: &SessionRecord,
        task: &TaskRecord,
        attempt: AttemptId,
    ) -> RetrievalResult<AgentContext> {
        let profile_summary = record.profile.summary_line();
        let upstream: Vec<UpstreamOutput> = task
            .depends_on
            .iter()
            .filter_map(|dep| record.task(&dep.task_id))
            .filter(|up| up.state == TaskState::Succeeded)
            .filter_map(|up| {
                up.output.as_ref().map(|output| UpstreamOutput {
                    task_id: up.task_id.clone(),
                    output: output.clone(),
                })
            })
            .collect();

        let fixed_tokens = estimate_tokens(&profile_summary)
            + upstream
                .iter()
                .flat_map(|u| u.output.claims.iter())
                .map(|c| estimate_tokens(&c.text))
                .sum::<usize>();

        let derived: Vec<EvidenceItem> = record
            .evidence
            .values()
            .filter(|e| e.source == EvidenceSource::Derived)
            .cloned()
            .collect();

        let query = query_for(task.kind, &record.profile, &record.questions, self.top_k);
        let mut ranked = self.adapter.query_with(&query, &derived).await?;
        let mut search_scope = None;
        if task.kind == AgentKind::WebSearch {
            let scope = if mentions_startup(&ranked, &record.profile.name) {
                SearchScope::StartupSpecific
            } else {
                info!(startup = %record.profile.name, "no startup coverage, searching the industry");
                let fallback = industry_fallback_query(&record.profile, self.top_k);
                ranked = self.adapter.query_with(&fallback, &derived).await?;
                SearchScope::IndustryWide
            };
            search_scope = Some(scope);
        }

        let available = self.budget.available().saturating_sub(fixed_tokens);
        let (evidence, dropped_evidence) = pack_evidence(ranked, available);
        let total_tokens = fixed_tokens
            + evidence
                .iter()
                .map(|e| estimate_tokens(&e.text()))
                .sum::<usize>();

        debug!(
            evidence = evidence.len(),
            dropped = dropped_evidence,
            total_tokens,
            "context assembled"
        );

        Ok(AgentContext {
            session_id: record.session_id.clone(),
            attempt,
            kind: task.kind,
            profile: record.profile.clone(),
            profile_summary,
            questions: record.questions.clone(),
            upstream,
            gaps: task.gaps.clone(),
            evidence,
            total_tokens,
            dropped_evidence,
            search_scope,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::evidence_id;
    use diligence_state::EvidenceContent;

    fn item(id: &str, text_len: usize) -> EvidenceItem {
        EvidenceItem {
            id: evidence_id(EvidenceSource::Vector, id),
            source_id: id.to_string(),
            source: EvidenceSource::Vector,
            score: 0.5,
            content: EvidenceContent::Text {
                text: "x".repeat(text_len),
            },
            observed_at: None,
        }
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_pack_keeps_ranked_prefix() {
        // 10 tokens each; budget for two.
        let ranked = vec![item("a", 40), item("b", 40), item("c", 40)];
        let (kept, dropped) = pack_evidence(ranked, 25);
        let ids: Vec<_> = kept.iter().map(|e| e.source_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(dropped, 1);
    }

    #[test]
    fn test_pack_stops_at_first_misfit() {
        // "b" does not fit; "c" would, but the kept set stays a prefix.
        let ranked = vec![item("a", 40), item("b", 400), item("c", 4)];
        let (kept, dropped) = pack_evidence(ranked, 20);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].source_id, "a");
        assert_eq!(dropped, 2);
    }

    #[test]
    fn test_pack_always_keeps_one() {
        let (kept, dropped) = pack_evidence(vec![item("huge", 4_000), item("b", 4)], 0);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].source_id, "huge");
        assert_eq!(dropped, 1);
        assert!(pack_evidence(vec![], 100).0.is_empty());
    }

    #[test]
    fn test_pack_is_deterministic() {
        let ranked = vec![item("a", 40), item("b", 40), item("c", 40)];
        assert_eq!(pack_evidence(ranked.clone(), 25), pack_evidence(ranked, 25));
    }

    #[test]
    fn test_budget_validation() {
        assert!(ContextBudget::new(100, 200).is_err());
        assert!(ContextBudget::new(100, 100).is_err());
        assert_eq!(ContextBudget::new(100, 40).unwrap().available(), 60);
    }

    #[test]
    fn test_mentions_startup_ignores_case() {
        let items = vec![item("a", 4), {
            let mut named = item("b", 0);
            named.content = EvidenceContent::Text {
                text: "ACME opens a second site".to_string(),
            };
            named
        }];
        assert!(mentions_startup(&items, "Acme"));
        assert!(!mentions_startup(&items[..1], "Acme"));
        assert!(!mentions_startup(&items, "  "));
    }

    #[test]
    fn test_industry_fallback_query_filters_by_industry() {
        let profile = StartupProfile::new("Acme", "robotics", "acme-deck");
        let query = industry_fallback_query(&profile, 4);
        assert!(query.terms.starts_with("robotics industry"));
        assert!(!query.terms.contains("Acme"));
        assert_eq!(query.structured_filters.get("industry").unwrap(), "robotics");
        assert!(query.vector_filters.is_empty());
    }

    #[test]
    fn test_render_notes_linkedin_and_scope() {
        let mut profile = StartupProfile::new("Acme", "robotics", "acme-deck");
        profile.linkedin_urls = vec!["https://linkedin.com/in/founder".to_string()];
        let ctx = AgentContext {
            session_id: SessionId::new(),
            attempt: AttemptId::new(TaskId::from(AgentKind::WebSearch), 1),
            kind: AgentKind::WebSearch,
            profile_summary: profile.summary_line(),
            profile,
            questions: vec![],
            upstream: vec![],
            gaps: vec![],
            evidence: vec![],
            total_tokens: 0,
            dropped_evidence: 0,
            search_scope: Some(SearchScope::IndustryWide),
        };
        let rendered = ctx.render();
        assert!(rendered.contains("LinkedIn: https://linkedin.com/in/founder"));
        assert!(rendered.contains("results describe the robotics industry"));
    }

    #[test]
    fn test_query_for_scopes_filters_by_kind() {
        let profile = StartupProfile::new("Acme", "robotics", "acme-deck");
        let summary = query_for(AgentKind::Summary, &profile, &[], 5);
        assert_eq!(summary.vector_filters.get("document_set").unwrap(), "acme-deck");
        let industry = query_for(AgentKind::Industry, &profile, &[], 5);
        assert!(industry.vector_filters.is_empty());
        assert_eq!(industry.structured_filters.get("industry").unwrap(), "robotics");
        let qa = query_for(AgentKind::Qa, &profile, &["burn rate?".to_string()], 5);
        assert!(qa.terms.contains("burn rate"));
    }
}
