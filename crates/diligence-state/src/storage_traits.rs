//! Storage trait definitions for diligence sessions
//!
//! `SessionStore` is the only mutable shared resource of the orchestration
//! core. Implementations must guarantee:
//! - `update` is atomic per task and idempotent on the attempt identifier.
//! - Only the current writer-lease holder may mutate a session.
//! - A created session survives process restart (durable backends).
//!
//! An in-memory fake is provided for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::schema::{
    NewSession, SessionId, SessionRecord, SessionStatus, TaskUpdate, UpdateOutcome, WriterId,
    WriterLease,
};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Durable record of task statuses and outputs, keyed by session id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a new session graph and return its id.
    async fn create(&self, session: NewSession) -> StorageResult<SessionId>;

    /// Acquire (or renew) the writer lease for a session.
    ///
    /// Fails with `WriterConflict` while another writer holds an unexpired lease.
    async fn acquire_writer(
        &self,
        session_id: &SessionId,
        writer: &WriterId,
        expires_at: DateTime<Utc>,
    ) -> StorageResult<WriterLease>;

    /// Release the writer lease. No-op if `writer` does not hold it.
    async fn release_writer(&self, session_id: &SessionId, writer: &WriterId)
        -> StorageResult<()>;

    /// Apply one task update on behalf of the lease holder.
    async fn update(
        &self,
        session_id: &SessionId,
        writer: &WriterId,
        update: TaskUpdate,
    ) -> StorageResult<UpdateOutcome>;

    /// Set the overall session status.
    async fn set_status(
        &self,
        session_id: &SessionId,
        writer: &WriterId,
        status: SessionStatus,
    ) -> StorageResult<()>;

    /// Attach the composed briefing to a session.
    async fn store_report(
        &self,
        session_id: &SessionId,
        report: serde_json::Value,
    ) -> StorageResult<()>;

    /// Read the full session state.
    async fn read(&self, session_id: &SessionId) -> StorageResult<SessionRecord>;

    /// List session ids, optionally filtered by status.
    async fn list(&self, status: Option<SessionStatus>) -> StorageResult<Vec<SessionId>>;
}
