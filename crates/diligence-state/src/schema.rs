//! Persisted data model for diligence sessions.
//!
//! A [`SessionRecord`] is the unit of durability: it carries the startup
//! profile, the task graph (as [`TaskRecord`]s with dependency edges), the
//! accumulated agent outputs and the session evidence set. All mutation goes
//! through [`SessionRecord::apply`], which enforces the task state machine,
//! citation integrity and attempt-level idempotency for every store backend.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StorageError;
use crate::storage_traits::StorageResult;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Unique identifier for a diligence session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new random SessionId
    pub fn new() -> Self {
        SessionId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a task inside one session's graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        TaskId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<AgentKind> for TaskId {
    fn from(kind: AgentKind) -> Self {
        TaskId(kind.to_string())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an evidence item within a session evidence set
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EvidenceId(pub String);

impl EvidenceId {
    pub fn new(id: impl Into<String>) -> Self {
        EvidenceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EvidenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one execution attempt of a task.
///
/// Updates carrying the same attempt id and change kind are applied at most
/// once, which makes retried store writes safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId {
    pub task_id: TaskId,
    pub number: u32,
}

impl AttemptId {
    pub fn new(task_id: TaskId, number: u32) -> Self {
        Self { task_id, number }
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.task_id, self.number)
    }
}

/// Identity of a scheduler instance holding (or requesting) a writer lease
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WriterId(pub String);

impl WriterId {
    pub fn new() -> Self {
        WriterId(format!("scheduler-{}", uuid::Uuid::new_v4()))
    }
}

impl Default for WriterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WriterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Agent kinds and profile
// ---------------------------------------------------------------------------

/// The specialized analyses a session can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Summary,
    Competitor,
    Industry,
    WebSearch,
    Qa,
}

impl AgentKind {
    /// Canonical section order of a briefing.
    pub const ALL: [AgentKind; 5] = [
        AgentKind::Summary,
        AgentKind::Competitor,
        AgentKind::Industry,
        AgentKind::WebSearch,
        AgentKind::Qa,
    ];

    /// Section heading used in briefings.
    pub fn title(&self) -> &'static str {
        match self {
            AgentKind::Summary => "Startup Summary",
            AgentKind::Competitor => "Competitor Landscape",
            AgentKind::Industry => "Industry Outlook",
            AgentKind::WebSearch => "Web Trends",
            AgentKind::Qa => "Diligence Q&A",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentKind::Summary => "summary",
            AgentKind::Competitor => "competitor",
            AgentKind::Industry => "industry",
            AgentKind::WebSearch => "web_search",
            AgentKind::Qa => "qa",
        };
        write!(f, "{s}")
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "summary" => Ok(AgentKind::Summary),
            "competitor" | "competitors" => Ok(AgentKind::Competitor),
            "industry" => Ok(AgentKind::Industry),
            "web_search" | "websearch" | "web_trend" | "web_trends" => Ok(AgentKind::WebSearch),
            "qa" | "q&a" => Ok(AgentKind::Qa),
            other => Err(other.to_string()),
        }
    }
}

/// Identifying attributes of the startup under review.
///
/// Immutable once a session starts; `document_set` references the ingested,
/// already-embedded document chunks in the vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartupProfile {
    pub name: String,
    pub industry: String,
    #[serde(default)]
    pub short_description: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub linkedin_urls: Vec<String>,
    pub document_set: String,
    #[serde(default)]
    pub invested: bool,
}

impl StartupProfile {
    pub fn new(
        name: impl Into<String>,
        industry: impl Into<String>,
        document_set: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            industry: industry.into(),
            short_description: None,
            website: None,
            linkedin_urls: Vec::new(),
            document_set: document_set.into(),
            invested: false,
        }
    }

    /// One-paragraph profile summary placed at the head of every agent context.
    pub fn summary_line(&self) -> String {
        let mut line = format!("{} ({})", self.name, self.industry);
        if let Some(desc) = &self.short_description {
            line.push_str(": ");
            line.push_str(desc);
        }
        if let Some(site) = &self.website {
            line.push_str(&format!(" [{site}]"));
        }
        if self.invested {
            line.push_str(" (portfolio company)");
        }
        line
    }
}

// ---------------------------------------------------------------------------
// Evidence and outputs
// ---------------------------------------------------------------------------

/// Where an evidence item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceSource {
    /// Curated structured dataset (highest trust)
    Structured,
    /// Vector similarity index over unstructured text
    Vector,
    /// Claims of a succeeded Summary task, indexed for later retrieval
    Derived,
}

impl EvidenceSource {
    /// Tie-break priority: lower sorts first.
    pub fn priority(&self) -> u8 {
        match self {
            EvidenceSource::Structured => 0,
            EvidenceSource::Vector => 1,
            EvidenceSource::Derived => 2,
        }
    }
}

impl fmt::Display for EvidenceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EvidenceSource::Structured => "structured",
            EvidenceSource::Vector => "vector",
            EvidenceSource::Derived => "derived",
        };
        write!(f, "{s}")
    }
}

/// Payload of an evidence item: a text span or a structured row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvidenceContent {
    Text { text: String },
    Row { fields: BTreeMap<String, serde_json::Value> },
}

/// A retrieved unit of supporting data, usable as a citation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub id: EvidenceId,
    /// Identifier of the record in its backing store (chunk id, row key).
    pub source_id: String,
    pub source: EvidenceSource,
    /// Ranking score assigned by the retrieval adapter.
    pub score: f64,
    pub content: EvidenceContent,
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
}

impl EvidenceItem {
    /// Flatten the payload into prose; rows render as `key: value` pairs.
    pub fn text(&self) -> String {
        match &self.content {
            EvidenceContent::Text { text } => text.clone(),
            EvidenceContent::Row { fields } => fields
                .iter()
                .map(|(k, v)| match v {
                    serde_json::Value::String(s) => format!("{k}: {s}"),
                    other => format!("{k}: {other}"),
                })
                .collect::<Vec<_>>()
                .join("; "),
        }
    }
}

/// One statement of an agent output together with its supporting evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub text: String,
    pub citations: Vec<EvidenceId>,
}

impl Claim {
    pub fn new(text: impl Into<String>, citations: Vec<EvidenceId>) -> Self {
        Self {
            text: text.into(),
            citations,
        }
    }
}

/// Typed result of a succeeded task: claims mapped to evidence ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub kind: AgentKind,
    pub claims: Vec<Claim>,
}

impl AgentOutput {
    pub fn new(kind: AgentKind, claims: Vec<Claim>) -> Self {
        Self { kind, claims }
    }

    /// Every evidence id cited by any claim.
    pub fn cited_ids(&self) -> BTreeSet<&EvidenceId> {
        self.claims.iter().flat_map(|c| c.citations.iter()).collect()
    }

    /// SHA-256 hex digest of the canonical JSON encoding.
    pub fn digest(&self) -> StorageResult<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Lifecycle state of one agent task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Edges of the task state machine.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Cancelled)
                | (Ready, Running)
                | (Ready, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Retrying)
                | (Running, Cancelled)
                | (Retrying, Running)
                | (Retrying, Cancelled)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Retrying => "retrying",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A dependency edge from the owning task to an upstream task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub task_id: TaskId,
    /// Required: upstream failure cancels this task.
    /// Optional: upstream failure is recorded as a gap and this task proceeds.
    pub required: bool,
}

/// Persisted state of one task in a session graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub kind: AgentKind,
    pub depends_on: Vec<Dependency>,
    pub state: TaskState,
    /// Highest attempt number started so far.
    pub attempts: u32,
    pub output: Option<AgentOutput>,
    pub error: Option<String>,
    /// Optional upstream tasks that did not succeed.
    pub gaps: Vec<TaskId>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(task_id: TaskId, kind: AgentKind, depends_on: Vec<Dependency>) -> Self {
        Self {
            task_id,
            kind,
            depends_on,
            state: TaskState::Pending,
            attempts: 0,
            output: None,
            error: None,
            gaps: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Overall status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    /// Every task succeeded.
    Completed,
    /// Finished with at least one failed or cancelled task, or hit the deadline.
    Partial,
    /// No task succeeded.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Partial => "partial",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SessionStatus::Running),
            "completed" => Ok(SessionStatus::Completed),
            "partial" => Ok(SessionStatus::Partial),
            "failed" => Ok(SessionStatus::Failed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Exclusive right of one scheduler to mutate a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterLease {
    pub writer: WriterId,
    pub expires_at: DateTime<Utc>,
}

/// Input to [`crate::SessionStore::create`].
#[derive(Debug, Clone)]
pub struct NewSession {
    pub profile: StartupProfile,
    pub questions: Vec<String>,
    pub tasks: Vec<TaskRecord>,
    pub deadline_at: DateTime<Utc>,
    pub max_concurrent: usize,
}

/// Aggregate state of one session: graph, task states, outputs, evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub profile: StartupProfile,
    pub questions: Vec<String>,
    /// Tasks in graph (topological) order.
    pub tasks: Vec<TaskRecord>,
    pub evidence: BTreeMap<EvidenceId, EvidenceItem>,
    pub status: SessionStatus,
    pub deadline_at: DateTime<Utc>,
    pub max_concurrent: usize,
    pub lease: Option<WriterLease>,
    /// Idempotency keys of every update applied so far.
    pub applied: BTreeSet<String>,
    /// Final briefing, once composed.
    pub report: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn from_new(session_id: SessionId, new: NewSession) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            profile: new.profile,
            questions: new.questions,
            tasks: new.tasks,
            evidence: BTreeMap::new(),
            status: SessionStatus::Running,
            deadline_at: new.deadline_at,
            max_concurrent: new.max_concurrent,
            lease: None,
            applied: BTreeSet::new(),
            report: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn task(&self, task_id: &TaskId) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| &t.task_id == task_id)
    }

    pub fn task_by_kind(&self, kind: AgentKind) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.kind == kind)
    }

    /// True once every task has reached a terminal state.
    pub fn all_terminal(&self) -> bool {
        self.tasks.iter().all(|t| t.state.is_terminal())
    }

    /// Verify that `writer` currently holds the lease.
    pub fn check_writer(&self, writer: &WriterId) -> StorageResult<()> {
        match &self.lease {
            Some(lease) if &lease.writer == writer => Ok(()),
            Some(lease) => Err(StorageError::WriterConflict {
                session_id: self.session_id.0.clone(),
                holder: lease.writer.0.clone(),
            }),
            None => Err(StorageError::WriterConflict {
                session_id: self.session_id.0.clone(),
                holder: "<none>".to_string(),
            }),
        }
    }

    /// Grant the lease to `writer` if it is free, expired or already theirs.
    pub fn grant_lease(
        &mut self,
        writer: &WriterId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageResult<WriterLease> {
        if let Some(lease) = &self.lease {
            if &lease.writer != writer && lease.expires_at > now {
                return Err(StorageError::WriterConflict {
                    session_id: self.session_id.0.clone(),
                    holder: lease.writer.0.clone(),
                });
            }
        }
        let lease = WriterLease {
            writer: writer.clone(),
            expires_at,
        };
        self.lease = Some(lease.clone());
        self.updated_at = now;
        Ok(lease)
    }

    /// Apply one task update.
    ///
    /// Returns [`UpdateOutcome::Duplicate`] without touching the record when
    /// an update with the same idempotency key was applied before.
    pub fn apply(&mut self, update: &TaskUpdate, now: DateTime<Utc>) -> StorageResult<UpdateOutcome> {
        let key = update.idempotency_key();
        if self.applied.contains(&key) {
            return Ok(UpdateOutcome::Duplicate);
        }

        let session_id = self.session_id.0.clone();
        let idx = self
            .tasks
            .iter()
            .position(|t| t.task_id == update.task_id)
            .ok_or_else(|| StorageError::TaskNotFound {
                session_id: session_id.clone(),
                task_id: update.task_id.0.clone(),
            })?;

        match &update.change {
            TaskChange::Transition { to, reason } => {
                let task = &mut self.tasks[idx];
                ensure_transition(task, *to)?;
                task.state = *to;
                if *to == TaskState::Running {
                    task.attempts = task.attempts.max(update.attempt.number);
                }
                if let Some(reason) = reason {
                    task.error = Some(reason.clone());
                }
                task.updated_at = now;
            }
            TaskChange::Succeeded { output, evidence } => {
                ensure_transition(&self.tasks[idx], TaskState::Succeeded)?;
                let offered: BTreeSet<&EvidenceId> = evidence.iter().map(|e| &e.id).collect();
                for cited in output.cited_ids() {
                    if !self.evidence.contains_key(cited) && !offered.contains(cited) {
                        return Err(StorageError::DanglingCitation {
                            task_id: update.task_id.0.clone(),
                            evidence_id: cited.0.clone(),
                        });
                    }
                }
                for item in evidence {
                    self.evidence
                        .entry(item.id.clone())
                        .or_insert_with(|| item.clone());
                }
                let task = &mut self.tasks[idx];
                task.state = TaskState::Succeeded;
                task.output = Some(output.clone());
                task.error = None;
                task.updated_at = now;
            }
            TaskChange::Failed { error } => {
                let task = &mut self.tasks[idx];
                ensure_transition(task, TaskState::Failed)?;
                task.state = TaskState::Failed;
                task.error = Some(error.clone());
                task.updated_at = now;
            }
            TaskChange::Gap { missing } => {
                let task = &mut self.tasks[idx];
                if !task.gaps.contains(missing) {
                    task.gaps.push(missing.clone());
                }
                task.updated_at = now;
            }
        }

        self.applied.insert(key);
        self.updated_at = now;
        Ok(UpdateOutcome::Applied)
    }
}

fn ensure_transition(task: &TaskRecord, to: TaskState) -> StorageResult<()> {
    if task.state.can_transition_to(to) {
        Ok(())
    } else {
        Err(StorageError::InvalidTransition {
            task_id: task.task_id.0.clone(),
            from: task.state.to_string(),
            to: to.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Updates
// ---------------------------------------------------------------------------

/// A single change to one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum TaskChange {
    /// Move along the state machine (Ready, Running, Retrying, Cancelled).
    Transition {
        to: TaskState,
        reason: Option<String>,
    },
    /// Record the output of a successful attempt and the evidence it cites.
    Succeeded {
        output: AgentOutput,
        evidence: Vec<EvidenceItem>,
    },
    /// Terminal failure.
    Failed { error: String },
    /// An optional upstream task did not succeed.
    Gap { missing: TaskId },
}

impl TaskChange {
    fn tag(&self) -> String {
        match self {
            TaskChange::Transition { to, .. } => format!("transition:{to}"),
            TaskChange::Succeeded { .. } => "succeeded".to_string(),
            TaskChange::Failed { .. } => "failed".to_string(),
            TaskChange::Gap { missing } => format!("gap:{missing}"),
        }
    }
}

/// An update addressed to one task, stamped with the attempt that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub task_id: TaskId,
    pub attempt: AttemptId,
    pub change: TaskChange,
}

impl TaskUpdate {
    pub fn new(attempt: AttemptId, change: TaskChange) -> Self {
        Self {
            task_id: attempt.task_id.clone(),
            attempt,
            change,
        }
    }

    pub fn transition(attempt: AttemptId, to: TaskState) -> Self {
        Self::new(attempt, TaskChange::Transition { to, reason: None })
    }

    /// Key under which the store deduplicates this update.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.attempt, self.change.tag())
    }
}

/// Whether an update changed the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    Duplicate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_line_notes_portfolio_companies() {
        let mut profile = StartupProfile::new("Acme", "robotics", "acme-deck");
        profile.short_description = Some("warehouse robots".to_string());
        assert_eq!(profile.summary_line(), "Acme (robotics): warehouse robots");
        profile.invested = true;
        assert!(profile.summary_line().ends_with("(portfolio company)"));
    }

    fn record() -> SessionRecord {
        let summary = TaskRecord::new(TaskId::from(AgentKind::Summary), AgentKind::Summary, vec![]);
        let qa = TaskRecord::new(
            TaskId::from(AgentKind::Qa),
            AgentKind::Qa,
            vec![Dependency {
                task_id: TaskId::from(AgentKind::Summary),
                required: true,
            }],
        );
        SessionRecord::from_new(
            SessionId::new(),
            NewSession {
                profile: StartupProfile::new("Acme", "fintech", "acme-deck"),
                questions: vec![],
                tasks: vec![summary, qa],
                deadline_at: Utc::now(),
                max_concurrent: 2,
            },
        )
    }

    fn evidence(id: &str) -> EvidenceItem {
        EvidenceItem {
            id: EvidenceId::new(id),
            source_id: format!("chunk-{id}"),
            source: EvidenceSource::Vector,
            score: 0.5,
            content: EvidenceContent::Text {
                text: "text".to_string(),
            },
            observed_at: None,
        }
    }

    fn attempt(n: u32) -> AttemptId {
        AttemptId::new(TaskId::from(AgentKind::Summary), n)
    }

    fn drive_to_running(rec: &mut SessionRecord) {
        let now = Utc::now();
        rec.apply(&TaskUpdate::transition(attempt(1), TaskState::Ready), now)
            .unwrap();
        rec.apply(&TaskUpdate::transition(attempt(1), TaskState::Running), now)
            .unwrap();
    }

    #[test]
    fn test_state_machine_edges() {
        assert!(TaskState::Pending.can_transition_to(TaskState::Ready));
        assert!(TaskState::Running.can_transition_to(TaskState::Retrying));
        assert!(TaskState::Retrying.can_transition_to(TaskState::Running));
        assert!(!TaskState::Pending.can_transition_to(TaskState::Running));
        assert!(!TaskState::Succeeded.can_transition_to(TaskState::Running));
        assert!(!TaskState::Cancelled.can_transition_to(TaskState::Ready));
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let mut rec = record();
        let err = rec
            .apply(
                &TaskUpdate::transition(attempt(1), TaskState::Running),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidTransition { .. }));
    }

    #[test]
    fn test_duplicate_update_is_idempotent() {
        let mut rec = record();
        drive_to_running(&mut rec);
        let update = TaskUpdate::new(
            attempt(1),
            TaskChange::Succeeded {
                output: AgentOutput::new(
                    AgentKind::Summary,
                    vec![Claim::new("claim", vec![EvidenceId::new("e1")])],
                ),
                evidence: vec![evidence("e1")],
            },
        );
        assert_eq!(rec.apply(&update, Utc::now()).unwrap(), UpdateOutcome::Applied);
        assert_eq!(
            rec.apply(&update, Utc::now()).unwrap(),
            UpdateOutcome::Duplicate
        );
        assert_eq!(rec.evidence.len(), 1);
    }

    #[test]
    fn test_dangling_citation_is_rejected() {
        let mut rec = record();
        drive_to_running(&mut rec);
        let update = TaskUpdate::new(
            attempt(1),
            TaskChange::Succeeded {
                output: AgentOutput::new(
                    AgentKind::Summary,
                    vec![Claim::new("claim", vec![EvidenceId::new("missing")])],
                ),
                evidence: vec![evidence("e1")],
            },
        );
        let err = rec.apply(&update, Utc::now()).unwrap_err();
        assert!(matches!(err, StorageError::DanglingCitation { .. }));
        assert_eq!(rec.task_by_kind(AgentKind::Summary).unwrap().state, TaskState::Running);
    }

    #[test]
    fn test_running_records_attempt_number() {
        let mut rec = record();
        drive_to_running(&mut rec);
        rec.apply(&TaskUpdate::transition(attempt(1), TaskState::Retrying), Utc::now())
            .unwrap();
        rec.apply(&TaskUpdate::transition(attempt(2), TaskState::Running), Utc::now())
            .unwrap();
        assert_eq!(rec.task_by_kind(AgentKind::Summary).unwrap().attempts, 2);
    }

    #[test]
    fn test_agent_kind_parses_aliases_and_rejects_unknown() {
        assert_eq!("web-search".parse::<AgentKind>(), Ok(AgentKind::WebSearch));
        assert_eq!("Q&A".parse::<AgentKind>(), Ok(AgentKind::Qa));
        assert_eq!("Competitors".parse::<AgentKind>(), Ok(AgentKind::Competitor));
        assert!("astrology".parse::<AgentKind>().is_err());
    }

    #[test]
    fn test_lease_conflict_until_expiry() {
        let mut rec = record();
        let a = WriterId::new();
        let b = WriterId::new();
        let now = Utc::now();
        rec.grant_lease(&a, now + chrono::Duration::seconds(30), now)
            .unwrap();
        assert!(rec.grant_lease(&b, now + chrono::Duration::seconds(30), now).is_err());
        assert!(rec.check_writer(&b).is_err());
        let later = now + chrono::Duration::seconds(60);
        assert!(rec.grant_lease(&b, later + chrono::Duration::seconds(30), later).is_ok());
        assert!(rec.check_writer(&b).is_ok());
    }

    #[test]
    fn test_row_evidence_renders_fields() {
        let mut fields = BTreeMap::new();
        fields.insert("company".to_string(), serde_json::json!("Rival"));
        fields.insert("revenue_usd".to_string(), serde_json::json!(1200000));
        let item = EvidenceItem {
            id: EvidenceId::new("r1"),
            source_id: "row-1".to_string(),
            source: EvidenceSource::Structured,
            score: 1.0,
            content: EvidenceContent::Row { fields },
            observed_at: None,
        };
        assert_eq!(item.text(), "company: Rival; revenue_usd: 1200000");
    }
}
