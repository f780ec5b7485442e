//! Error types for diligence-state

use thiserror::Error;

/// Errors that can occur in the session persistence layer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// No session exists under the given id
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// The session exists but has no task with the given id
    #[error("task {task_id} not found in session {session_id}")]
    TaskNotFound { session_id: String, task_id: String },

    /// The requested task state change is not an edge of the task state machine
    #[error("task {task_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    /// An agent output cites evidence that is not part of the session evidence set
    #[error("task {task_id} cites unknown evidence {evidence_id}")]
    DanglingCitation {
        task_id: String,
        evidence_id: String,
    },

    /// Another scheduler holds the writer lease for this session
    #[error("session {session_id} is owned by writer {holder}")]
    WriterConflict { session_id: String, holder: String },

    /// Backend (database / lock) failure
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Session document could not be encoded or decoded
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
