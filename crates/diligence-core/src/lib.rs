//! Diligence Core: multi-agent orchestration and retrieval-augmented synthesis
//!
//! A request for analyses of one startup becomes a session with a task
//! graph. The scheduler dispatches ready tasks to registered agents, each fed
//! a token-budgeted context assembled from the retrieval adapter, records
//! results in the session store and finally hands the session to the
//! synthesis composer, which produces a cited briefing or answers questions.
//!
//! ## Key Components
//!
//! - [`DiligenceService`]: submission, status, streaming, cancel, resume, Q&A
//! - [`Scheduler`]: the per-session control loop (single writer)
//! - [`TaskGraphBuilder`]: analyses to an acyclic dependency graph
//! - [`AgentRegistry`] / [`AgentRuntime`]: agent contract and invocation
//! - [`ContextAssembler`]: budgeted agent input
//! - [`RetrievalAdapter`]: ranked evidence over vector and structured stores
//! - [`SynthesisComposer`]: briefing, recommendation and grounded answers
//! - [`Embedder`]: query vectors for the vector index

pub mod agents;
pub mod config;
pub mod context;
pub mod error;
pub mod graph;
pub mod metrics;
pub mod obs;
pub mod retrieval;
pub mod scheduler;
pub mod service;
pub mod synthesis;
pub mod telemetry;

pub use agents::{
    Agent, AgentError, AgentRegistry, AgentResult, AgentRuntime, Completion, ExtractiveAgent,
};
pub use config::{ConfigError, OrchestratorConfig, RankingConfig, RetryPolicy};
pub use context::{AgentContext, ContextAssembler, ContextBudget, SearchScope, UpstreamOutput};
pub use error::{DiligenceError, Result, SchedulerError, SchedulerResult};
pub use graph::{DependencyRule, DependencyRules, GraphConfigError, TaskGraph, TaskGraphBuilder};
pub use retrieval::{
    Embedder, HashingEmbedder, InMemoryStructuredStore, InMemoryVectorStore, RetrievalAdapter,
    RetrievalError, RetrievalQuery, SimilarStartup, SimilarStartupQuery, StructuredQuery,
    StructuredRecord, StructuredRow, StructuredStore, VectorChunk, VectorHit, VectorSearch,
    VectorStore,
};
pub use scheduler::{Scheduler, SessionControl, SessionEvent};
pub use service::{DiligenceService, SubmitOptions};
pub use synthesis::{
    Answer, Citation, MarketSizeCheck, Recommendation, RiskFactor, Section, SectionStatus,
    SynthesisComposer, SynthesisError, SynthesisResult, Verdict,
};

pub use diligence_state::{
    AgentKind, AgentOutput, Claim, EvidenceContent, EvidenceId, EvidenceItem, EvidenceSource,
    SessionId, SessionRecord, SessionStatus, SessionStore, StartupProfile, TaskId, TaskState,
};
