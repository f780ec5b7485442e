//! In-memory fake for the session store (testing only)
//!
//! `MemorySessionStore` satisfies the `SessionStore` contract without any
//! external dependencies. It is not durable across process restarts.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::schema::*;
use crate::storage_traits::*;

/// In-memory session store backed by a `HashMap<SessionId, SessionRecord>`.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, HashMap<String, SessionRecord>>> {
        self.sessions
            .lock()
            .map_err(|_| StorageError::Backend("session map lock poisoned".to_string()))
    }

    fn with_session<T>(
        &self,
        session_id: &SessionId,
        f: impl FnOnce(&mut SessionRecord) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut sessions = self.lock()?;
        let record = sessions
            .get_mut(&session_id.0)
            .ok_or_else(|| StorageError::SessionNotFound {
                session_id: session_id.0.clone(),
            })?;
        // Work on a copy so a rejected update leaves the record untouched.
        let mut draft = record.clone();
        let out = f(&mut draft)?;
        *record = draft;
        Ok(out)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: NewSession) -> StorageResult<SessionId> {
        let session_id = SessionId::new();
        let record = SessionRecord::from_new(session_id.clone(), session);
        self.lock()?.insert(session_id.0.clone(), record);
        Ok(session_id)
    }

    async fn acquire_writer(
        &self,
        session_id: &SessionId,
        writer: &WriterId,
        expires_at: DateTime<Utc>,
    ) -> StorageResult<WriterLease> {
        self.with_session(session_id, |rec| {
            rec.grant_lease(writer, expires_at, Utc::now())
        })
    }

    async fn release_writer(
        &self,
        session_id: &SessionId,
        writer: &WriterId,
    ) -> StorageResult<()> {
        self.with_session(session_id, |rec| {
            if rec.lease.as_ref().map(|l| &l.writer) == Some(writer) {
                rec.lease = None;
            }
            Ok(())
        })
    }

    async fn update(
        &self,
        session_id: &SessionId,
        writer: &WriterId,
        update: TaskUpdate,
    ) -> StorageResult<UpdateOutcome> {
        self.with_session(session_id, |rec| {
            rec.check_writer(writer)?;
            rec.apply(&update, Utc::now())
        })
    }

    async fn set_status(
        &self,
        session_id: &SessionId,
        writer: &WriterId,
        status: SessionStatus,
    ) -> StorageResult<()> {
        self.with_session(session_id, |rec| {
            rec.check_writer(writer)?;
            rec.status = status;
            rec.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn store_report(
        &self,
        session_id: &SessionId,
        report: serde_json::Value,
    ) -> StorageResult<()> {
        self.with_session(session_id, |rec| {
            rec.report = Some(report);
            rec.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn read(&self, session_id: &SessionId) -> StorageResult<SessionRecord> {
        self.lock()?
            .get(&session_id.0)
            .cloned()
            .ok_or_else(|| StorageError::SessionNotFound {
                session_id: session_id.0.clone(),
            })
    }

    async fn list(&self, status: Option<SessionStatus>) -> StorageResult<Vec<SessionId>> {
        let sessions = self.lock()?;
        let mut records: Vec<&SessionRecord> = sessions
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records.into_iter().map(|r| r.session_id.clone()).collect())
    }
}
