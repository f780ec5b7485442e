//! Error types for task graph construction.

/// A malformed analysis request. No session is created when this is returned.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphConfigError {
    #[error("unknown agent kind: {kind}")]
    UnknownAgentKind { kind: String },

    #[error("no agent registered for kind {kind}")]
    UnregisteredAgent { kind: String },

    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("no analyses requested")]
    EmptyRequest,
}

/// Result type for graph construction.
pub type GraphResult<T> = std::result::Result<T, GraphConfigError>;
