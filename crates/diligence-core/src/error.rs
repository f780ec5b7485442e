//! Crate-level error taxonomy.
//!
//! Each layer owns a focused error enum; [`DiligenceError`] is what the
//! service facade returns to callers.

use diligence_state::{SessionId, StorageError};

use crate::agents::AgentError;
use crate::config::ConfigError;
use crate::graph::GraphConfigError;
use crate::retrieval::RetrievalError;
use crate::synthesis::SynthesisError;

/// Errors produced while driving a session.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    #[error("session {session_id} is already terminal ({status})")]
    AlreadyFinished { session_id: String, status: String },

    #[error("task graph for session {session_id} references an unregistered agent: {kind}")]
    MissingAgent { session_id: String, kind: String },

    #[error("scheduler for session {session_id} stopped without reporting a status")]
    Aborted { session_id: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result type for scheduler operations.
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

/// Errors surfaced by [`crate::service::DiligenceService`].
#[derive(Debug, thiserror::Error)]
pub enum DiligenceError {
    #[error("graph configuration error: {0}")]
    GraphConfig(#[from] GraphConfigError),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session {0} is not being driven by this service")]
    NotActive(SessionId),

    #[error("no indexed documents for startup: {0}")]
    StartupNotFound(String),

    #[error("retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("synthesis error: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StorageError> for DiligenceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::SessionNotFound { session_id } => {
                DiligenceError::SessionNotFound(SessionId(session_id))
            }
            other => DiligenceError::Storage(other),
        }
    }
}

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, DiligenceError>;
