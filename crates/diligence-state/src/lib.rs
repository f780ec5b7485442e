//! Diligence-State: durable session state for the orchestration core
//!
//! This crate is the persistence layer of the due-diligence co-pilot. It
//! owns the persisted data model and the only mutable shared resource of
//! the core: the per-session record of task states, outputs and evidence.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: task-level atomicity, idempotent updates, single-writer leases
//! and durability across restarts.
//!
//! ## Key Components
//!
//! - `SessionStore`: the storage contract (create / update / read)
//! - `SessionRecord`: aggregate of task graph, task states, outputs, evidence
//! - `MemorySessionStore`: in-memory fake for tests
//! - `SurrealSessionStore`: SurrealDB-backed durable store

mod error;
pub mod fakes;
pub mod handle;
mod migrations;
pub mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::StorageError;
pub use handle::CloudConfig;
pub use schema::{
    AgentKind, AgentOutput, AttemptId, Claim, Dependency, EvidenceContent, EvidenceId,
    EvidenceItem, EvidenceSource, NewSession, SessionId, SessionRecord, SessionStatus,
    StartupProfile, TaskChange, TaskId, TaskRecord, TaskState, TaskUpdate, UpdateOutcome,
    WriterId, WriterLease,
};
pub use storage_traits::{SessionStore, StorageResult};
pub use surreal_store::SurrealSessionStore;
