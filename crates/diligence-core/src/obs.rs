//! Structured observability hooks for session lifecycle events.
//!
//! Events are emitted at `info!` level with an `event` field so they can be
//! filtered out of JSON logs (`event = "task.finished"` and so on).

use diligence_state::{AgentKind, AttemptId, SessionId, SessionStatus, TaskState};
use tracing::{info, warn};

/// RAII guard that enters a session-scoped span.
///
/// ```ignore
/// let _span = SessionSpan::enter(&session_id);
/// // every event logged here carries session_id
/// ```
pub struct SessionSpan {
    _span: tracing::span::EnteredSpan,
}

impl SessionSpan {
    pub fn enter(session_id: &SessionId) -> Self {
        Self {
            _span: session_span(session_id).entered(),
        }
    }
}

/// Session span for instrumenting futures that cross `.await` points.
pub fn session_span(session_id: &SessionId) -> tracing::Span {
    tracing::info_span!("diligence.session", session_id = %session_id)
}

pub fn emit_session_submitted(session_id: &SessionId, startup: &str, tasks: usize) {
    info!(
        event = "session.submitted",
        session_id = %session_id,
        startup = %startup,
        tasks = tasks,
    );
}

pub fn emit_task_dispatched(session_id: &SessionId, attempt: &AttemptId, kind: AgentKind) {
    info!(
        event = "task.dispatched",
        session_id = %session_id,
        attempt = %attempt,
        kind = %kind,
    );
}

/// Emit event: transient failure, another attempt is scheduled.
pub fn emit_task_retrying(
    session_id: &SessionId,
    attempt: &AttemptId,
    backoff_ms: u64,
    error: &dyn std::fmt::Display,
) {
    warn!(
        event = "task.retrying",
        session_id = %session_id,
        attempt = %attempt,
        backoff_ms = backoff_ms,
        error = %error,
    );
}

pub fn emit_task_finished(session_id: &SessionId, attempt: &AttemptId, state: TaskState) {
    info!(
        event = "task.finished",
        session_id = %session_id,
        attempt = %attempt,
        state = %state,
    );
}

pub fn emit_session_finished(session_id: &SessionId, status: SessionStatus, duration_ms: u64) {
    info!(
        event = "session.finished",
        session_id = %session_id,
        status = %status,
        duration_ms = duration_ms,
    );
}

pub fn emit_qa_answered(session_id: &SessionId, citations: usize, answered: bool) {
    info!(
        event = "qa.answered",
        session_id = %session_id,
        citations = citations,
        answered = answered,
    );
}

/// Emit event: a store write failed after the session was already decided.
pub fn emit_store_error(session_id: &SessionId, error: &dyn std::fmt::Display) {
    warn!(event = "session.store_error", session_id = %session_id, error = %error);
}
