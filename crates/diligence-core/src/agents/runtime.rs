//! Uniform execution wrapper around registered agents.
//!
//! One call to [`AgentRuntime::invoke`] is one attempt: assemble the
//! context, run the agent under its timeout, and check the output before it
//! is handed back to the scheduler. The runtime never writes to the session
//! store itself.

use std::sync::Arc;

use tracing::{debug, instrument};

use diligence_state::{
    AgentKind, AgentOutput, AttemptId, EvidenceContent, EvidenceItem, EvidenceSource,
    SessionRecord, TaskRecord,
};

use super::{AgentError, AgentRegistry, AgentResult};
use crate::config::OrchestratorConfig;
use crate::context::ContextAssembler;
use crate::retrieval::evidence_id;

/// A successful attempt: the output plus every evidence item to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub output: AgentOutput,
    /// Cited evidence, plus derived evidence for Summary outputs.
    pub evidence: Vec<EvidenceItem>,
}

#[derive(Clone)]
pub struct AgentRuntime {
    assembler: ContextAssembler,
    registry: Arc<AgentRegistry>,
    config: Arc<OrchestratorConfig>,
}

impl AgentRuntime {
    pub fn new(
        assembler: ContextAssembler,
        registry: Arc<AgentRegistry>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            assembler,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Run one attempt of `task` against the current session state.
    #[instrument(skip(self, record, task, attempt), fields(attempt = %attempt, kind = %task.kind))]
    pub async fn invoke(
        &self,
        record: &SessionRecord,
        task: &TaskRecord,
        attempt: AttemptId,
    ) -> AgentResult<Completion> {
        let agent = self.registry.get(task.kind).ok_or_else(|| {
            AgentError::Validation(format!("no agent registered for kind {}", task.kind))
        })?;

        let ctx = self.assembler.assemble(record, task, attempt).await?;

        let timeout = self.config.agent_timeout(task.kind);
        let output = match tokio::time::timeout(timeout, agent.run(&ctx)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(AgentError::Transient(format!(
                    "{} agent did not finish within {}ms",
                    task.kind,
                    timeout.as_millis()
                )))
            }
        };

        if output.kind != task.kind {
            return Err(AgentError::Permanent(format!(
                "{} agent returned a {} output",
                task.kind, output.kind
            )));
        }

        let offered = ctx.evidence_by_id();
        let mut evidence = Vec::new();
        for cited in output.cited_ids() {
            let item = offered.get(cited.as_str()).ok_or_else(|| {
                AgentError::Permanent(format!(
                    "claim cites evidence {cited} that was not in the context"
                ))
            })?;
            evidence.push((*item).clone());
        }

        if task.kind == AgentKind::Summary {
            evidence.extend(derived_evidence(&output));
        }

        debug!(
            claims = output.claims.len(),
            evidence = evidence.len(),
            "attempt produced output"
        );
        Ok(Completion { output, evidence })
    }
}

/// Index Summary claims as retrievable session evidence.
pub fn derived_evidence(output: &AgentOutput) -> Vec<EvidenceItem> {
    output
        .claims
        .iter()
        .enumerate()
        .map(|(i, claim)| {
            let source_id = format!("{}#{}", output.kind, i);
            EvidenceItem {
                id: evidence_id(EvidenceSource::Derived, &source_id),
                source_id,
                source: EvidenceSource::Derived,
                score: 0.0,
                content: EvidenceContent::Text {
                    text: claim.text.clone(),
                },
                observed_at: None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use diligence_state::{Claim, EvidenceId};

    #[test]
    fn test_derived_evidence_is_stable() {
        let output = AgentOutput::new(
            AgentKind::Summary,
            vec![
                Claim::new("Acme builds robots", vec![]),
                Claim::new("Acme sells to warehouses", vec![]),
            ],
        );
        let ids: Vec<EvidenceId> = derived_evidence(&output).into_iter().map(|e| e.id).collect();
        assert_eq!(
            ids,
            vec![
                EvidenceId::new("derived:summary#0"),
                EvidenceId::new("derived:summary#1")
            ]
        );
        assert_eq!(derived_evidence(&output)[1].text(), "Acme sells to warehouses");
    }
}
