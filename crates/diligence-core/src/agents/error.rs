//! Error types for the agent runtime.

use crate::retrieval::RetrievalError;

/// Normalized failure of one agent invocation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AgentError {
    /// Bad or missing input; never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Model, network or backend fault; retried with backoff.
    #[error("transient error: {0}")]
    Transient(String),

    /// Retries exhausted or an unrecoverable fault.
    #[error("permanent error: {0}")]
    Permanent(String),
}

impl AgentError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::Transient(_))
    }
}

impl From<RetrievalError> for AgentError {
    fn from(err: RetrievalError) -> Self {
        if err.is_transient() {
            AgentError::Transient(err.to_string())
        } else {
            AgentError::Validation(err.to_string())
        }
    }
}

/// Result type for agent operations.
pub type AgentResult<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retrieval_timeout_is_transient() {
        let err: AgentError = RetrievalError::Timeout {
            backend: "vector".to_string(),
            timeout_ms: 50,
        }
        .into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_invalid_query_is_validation() {
        let err: AgentError = RetrievalError::InvalidQuery("top_k".to_string()).into();
        assert!(matches!(err, AgentError::Validation(_)));
        assert!(!err.is_retryable());
    }
}
