//! Agent capability contract, registry and runtime.
//!
//! Agents register under their [`AgentKind`]. The registry is consulted when
//! a task graph is built (every requested kind must have an implementation)
//! and again by the runtime when a task is dispatched.

pub mod error;
pub mod extractive;
pub mod runtime;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use diligence_state::{AgentKind, AgentOutput};

use crate::context::AgentContext;

pub use error::{AgentError, AgentResult};
pub use extractive::ExtractiveAgent;
pub use runtime::{AgentRuntime, Completion};

/// One specialized analysis.
#[async_trait]
pub trait Agent: Send + Sync {
    fn kind(&self) -> AgentKind;

    /// Turn a context bundle into cited claims.
    ///
    /// Every citation must name an evidence item present in `ctx.evidence`.
    async fn run(&self, ctx: &AgentContext) -> AgentResult<AgentOutput>;
}

/// Maps agent kinds to implementations.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<AgentKind, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in extractive agent for every kind.
    pub fn extractive() -> Self {
        let mut registry = Self::new();
        for kind in AgentKind::ALL {
            registry.register(Arc::new(ExtractiveAgent::new(kind)));
        }
        registry
    }

    /// Register `agent` under its kind, replacing any previous registration.
    pub fn register(&mut self, agent: Arc<dyn Agent>) -> Option<Arc<dyn Agent>> {
        self.agents.insert(agent.kind(), agent)
    }

    pub fn get(&self, kind: AgentKind) -> Option<Arc<dyn Agent>> {
        self.agents.get(&kind).cloned()
    }

    pub fn contains(&self, kind: AgentKind) -> bool {
        self.agents.contains_key(&kind)
    }

    /// Registered kinds in canonical order.
    pub fn kinds(&self) -> Vec<AgentKind> {
        AgentKind::ALL
            .into_iter()
            .filter(|k| self.contains(*k))
            .collect()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
