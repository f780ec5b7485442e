//! Deterministic extractive agents.
//!
//! These agents do not call a model: each claim is the leading sentence of
//! one context evidence item, cited back to that item. Identical context
//! always yields an identical output.

use async_trait::async_trait;

use diligence_state::{AgentKind, AgentOutput, Claim, EvidenceContent, EvidenceItem};

use super::{Agent, AgentResult};
use crate::context::AgentContext;
use crate::retrieval::lexical_similarity;

const MAX_CLAIM_CHARS: usize = 280;
const MAX_CLAIMS: usize = 3;

#[derive(Debug, Clone)]
pub struct ExtractiveAgent {
    kind: AgentKind,
}

impl ExtractiveAgent {
    pub fn new(kind: AgentKind) -> Self {
        Self { kind }
    }

    fn answer_questions(&self, ctx: &AgentContext) -> Vec<Claim> {
        ctx.questions
            .iter()
            .filter_map(|question| {
                let best = ctx
                    .evidence
                    .iter()
                    .map(|e| (lexical_similarity(question, &e.text()), e))
                    .filter(|(sim, _)| *sim > 0.0)
                    .max_by(|a, b| a.0.total_cmp(&b.0).then_with(|| b.1.id.cmp(&a.1.id)))?
                    .1;
                Some(Claim::new(
                    format!("{question} {}", lead_sentence(best)),
                    vec![best.id.clone()],
                ))
            })
            .collect()
    }
}

/// First sentence of an item's text, capped in length. Rows render whole.
pub fn lead_sentence(item: &EvidenceItem) -> String {
    let text = item.text();
    let sentence = match &item.content {
        EvidenceContent::Row { .. } => text.as_str(),
        EvidenceContent::Text { .. } => text
            .split_inclusive(['.', '!', '?'])
            .next()
            .unwrap_or(text.as_str()),
    };
    let trimmed = sentence.trim();
    if trimmed.chars().count() <= MAX_CLAIM_CHARS {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(MAX_CLAIM_CHARS).collect();
        format!("{cut}...")
    }
}

#[async_trait]
impl Agent for ExtractiveAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    async fn run(&self, ctx: &AgentContext) -> AgentResult<AgentOutput> {
        let claims = if self.kind == AgentKind::Qa && !ctx.questions.is_empty() {
            self.answer_questions(ctx)
        } else {
            ctx.evidence
                .iter()
                .take(MAX_CLAIMS)
                .map(|item| Claim::new(lead_sentence(item), vec![item.id.clone()]))
                .collect()
        };
        Ok(AgentOutput::new(self.kind, claims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::evidence_id;
    use diligence_state::{AttemptId, EvidenceSource, SessionId, StartupProfile, TaskId};

    fn text_item(id: &str, text: &str) -> EvidenceItem {
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

    fn ctx(kind: AgentKind, evidence: Vec<EvidenceItem>, questions: Vec<String>) -> AgentContext {
        AgentContext {
            session_id: SessionId::new(),
            attempt: AttemptId::new(TaskId::from(kind), 1),
            kind,
            profile: StartupProfile::new("Acme", "robotics", "acme-deck"),
            profile_summary: "Acme (robotics)".to_string(),
            questions,
            upstream: vec![],
            gaps: vec![],
            evidence,
            total_tokens: 0,
            dropped_evidence: 0,
            search_scope: None,
        }
    }

    #[tokio::test]
    async fn test_claims_cite_their_source() {
        let agent = ExtractiveAgent::new(AgentKind::Summary);
        let out = agent
            .run(&ctx(
                AgentKind::Summary,
                vec![
                    text_item("a", "Acme builds robots. It was founded in 2021."),
                    text_item("b", "Second item."),
                    text_item("c", "Third item."),
                    text_item("d", "Fourth item."),
                ],
                vec![],
            ))
            .await
            .unwrap();
        assert_eq!(out.claims.len(), 3);
        assert_eq!(out.claims[0].text, "Acme builds robots.");
        assert_eq!(out.claims[0].citations, vec![evidence_id(EvidenceSource::Vector, "a")]);
    }

    #[tokio::test]
    async fn test_empty_context_is_no_finding() {
        let agent = ExtractiveAgent::new(AgentKind::Industry);
        let out = agent.run(&ctx(AgentKind::Industry, vec![], vec![])).await.unwrap();
        assert!(out.claims.is_empty());
    }

    #[tokio::test]
    async fn test_qa_answers_each_question_from_best_match() {
        let agent = ExtractiveAgent::new(AgentKind::Qa);
        let out = agent
            .run(&ctx(
                AgentKind::Qa,
                vec![
                    text_item("team", "The founding team previously built drones."),
                    text_item("burn", "Monthly burn is 200k with 18 months runway."),
                ],
                vec!["What is the monthly burn?".to_string(), "Who owns patents?".to_string()],
            ))
            .await
            .unwrap();
        assert_eq!(out.claims.len(), 1);
        assert_eq!(out.claims[0].citations, vec![evidence_id(EvidenceSource::Vector, "burn")]);
    }

    #[test]
    fn test_lead_sentence_caps_length() {
        let long = "x".repeat(MAX_CLAIM_CHARS + 20);
        let s = lead_sentence(&text_item("l", &long));
        assert!(s.ends_with("..."));
        assert_eq!(s.chars().count(), MAX_CLAIM_CHARS + 3);
    }
}
