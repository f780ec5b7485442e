//! SurrealDB-backed SessionStore implementation
//!
//! Each session is one row in the `sessions` table holding the JSON-encoded
//! [`SessionRecord`]. Mutations are read-modify-write under a store-wide
//! lock, so an update is applied to the whole task or not at all.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::handle;
use crate::schema::{
    NewSession, SessionId, SessionRecord, SessionStatus, TaskUpdate, UpdateOutcome, WriterId,
    WriterLease,
};
use crate::storage_traits::{SessionStore, StorageResult};

/// Row layout of the `sessions` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbSession {
    session_id: String,
    status: String,
    document: String,
    created_at: String,
    updated_at: String,
}

impl DbSession {
    fn encode(record: &SessionRecord) -> StorageResult<Self> {
        Ok(Self {
            session_id: record.session_id.0.clone(),
            status: record.status.to_string(),
            document: serde_json::to_string(record)?,
            created_at: record.created_at.to_rfc3339(),
            updated_at: record.updated_at.to_rfc3339(),
        })
    }

    fn decode(self) -> StorageResult<SessionRecord> {
        Ok(serde_json::from_str(&self.document)?)
    }
}

/// SurrealDB-backed implementation of [`SessionStore`].
pub struct SurrealSessionStore {
    db: Surreal<Any>,
    write_lock: Mutex<()>,
}

impl SurrealSessionStore {
    /// Wrap an already-connected (and migrated) database handle.
    pub fn new(db: Surreal<Any>) -> Self {
        Self {
            db,
            write_lock: Mutex::new(()),
        }
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> StorageResult<Self> {
        let db = handle::connect_url("mem://").await?;
        info!("SurrealSessionStore connected (in-memory)");
        Ok(Self::new(db))
    }

    /// Open (or create) an on-disk store at `path`.
    pub async fn open_local(path: &std::path::Path) -> StorageResult<Self> {
        std::fs::create_dir_all(path).map_err(|e| {
            StorageError::Backend(format!(
                "Failed to create database directory {}: {}",
                path.display(),
                e
            ))
        })?;
        let url = format!("surrealkv://{}", path.display());
        let db = handle::connect_url(&url).await?;
        info!("SurrealSessionStore connected ({})", url);
        Ok(Self::new(db))
    }

    /// Create from environment variables.
    ///
    /// See [`handle::connect_from_env`] for the resolution order.
    pub async fn from_env() -> StorageResult<Self> {
        Ok(Self::new(handle::connect_from_env().await?))
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch(&self, session_id: &SessionId) -> StorageResult<SessionRecord> {
        let sid = session_id.0.clone();
        let mut res = self
            .db
            .query("SELECT * FROM sessions WHERE session_id = $sid")
            .bind(("sid", sid))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<DbSession> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::SessionNotFound {
                session_id: session_id.0.clone(),
            })?
            .decode()
    }

    async fn save(&self, record: &SessionRecord) -> StorageResult<()> {
        let row = DbSession::encode(record)?;
        let sid = record.session_id.0.clone();

        self.db
            .query("UPDATE sessions CONTENT $row WHERE session_id = $sid")
            .bind(("row", row))
            .bind(("sid", sid))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .check()
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(())
    }

    /// Read-modify-write one session. The record is saved only if `f` succeeds.
    async fn mutate<T>(
        &self,
        session_id: &SessionId,
        f: impl FnOnce(&mut SessionRecord) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.fetch(session_id).await?;
        let out = f(&mut record)?;
        self.save(&record).await?;
        Ok(out)
    }
}

#[async_trait]
impl SessionStore for SurrealSessionStore {
    async fn create(&self, session: NewSession) -> StorageResult<SessionId> {
        let session_id = SessionId::new();
        let record = SessionRecord::from_new(session_id.clone(), session);
        let row = DbSession::encode(&record)?;

        debug!(session_id = %session_id, tasks = record.tasks.len(), "creating session");

        let _created: Option<DbSession> = self
            .db
            .create("sessions")
            .content(row)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(session_id)
    }

    async fn acquire_writer(
        &self,
        session_id: &SessionId,
        writer: &WriterId,
        expires_at: DateTime<Utc>,
    ) -> StorageResult<WriterLease> {
        self.mutate(session_id, |rec| {
            rec.grant_lease(writer, expires_at, Utc::now())
        })
        .await
    }

    async fn release_writer(
        &self,
        session_id: &SessionId,
        writer: &WriterId,
    ) -> StorageResult<()> {
        self.mutate(session_id, |rec| {
            if rec.lease.as_ref().map(|l| &l.writer) == Some(writer) {
                rec.lease = None;
            }
            Ok(())
        })
        .await
    }

    async fn update(
        &self,
        session_id: &SessionId,
        writer: &WriterId,
        update: TaskUpdate,
    ) -> StorageResult<UpdateOutcome> {
        self.mutate(session_id, |rec| {
            rec.check_writer(writer)?;
            rec.apply(&update, Utc::now())
        })
        .await
    }

    async fn set_status(
        &self,
        session_id: &SessionId,
        writer: &WriterId,
        status: SessionStatus,
    ) -> StorageResult<()> {
        self.mutate(session_id, |rec| {
            rec.check_writer(writer)?;
            rec.status = status;
            rec.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn store_report(
        &self,
        session_id: &SessionId,
        report: serde_json::Value,
    ) -> StorageResult<()> {
        self.mutate(session_id, |rec| {
            rec.report = Some(report);
            rec.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn read(&self, session_id: &SessionId) -> StorageResult<SessionRecord> {
        self.fetch(session_id).await
    }

    async fn list(&self, status: Option<SessionStatus>) -> StorageResult<Vec<SessionId>> {
        let rows: Vec<DbSession> = if let Some(status) = status {
            let st = status.to_string();
            let mut res = self
                .db
                .query("SELECT * FROM sessions WHERE status = $st ORDER BY created_at DESC")
                .bind(("st", st))
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            res.take(0)
                .map_err(|e| StorageError::Backend(e.to_string()))?
        } else {
            let mut res = self
                .db
                .query("SELECT * FROM sessions ORDER BY created_at DESC")
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            res.take(0)
                .map_err(|e| StorageError::Backend(e.to_string()))?
        };

        Ok(rows
            .into_iter()
            .map(|r| SessionId(r.session_id))
            .collect())
    }
}
