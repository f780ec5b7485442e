//! Shared fixtures for the orchestration integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use diligence_core::retrieval::{RetrievalResult, VectorHit, VectorSearch};
use diligence_core::{
    Agent, AgentContext, AgentError, AgentKind, AgentOutput, AgentRegistry, AgentResult,
    DiligenceService, ExtractiveAgent, InMemoryStructuredStore, InMemoryVectorStore,
    OrchestratorConfig, StartupProfile, StructuredRecord, VectorChunk, VectorStore,
};
use diligence_state::fakes::MemorySessionStore;
use diligence_state::SessionStore;

pub const ALL_ANALYSES: [&str; 5] = ["summary", "competitor", "industry", "web_search", "qa"];

pub fn profile() -> StartupProfile {
    let mut profile = StartupProfile::new("Acme", "robotics", "acme-deck");
    profile.short_description = Some("warehouse robots for mid-size logistics operators".into());
    profile
}

fn chunk(id: &str, set: &str, text: &str) -> VectorChunk {
    VectorChunk {
        chunk_id: id.to_string(),
        document_set: set.to_string(),
        text: text.to_string(),
        embedding: None,
        metadata: BTreeMap::new(),
        observed_at: None,
    }
}

pub fn chunks() -> Vec<VectorChunk> {
    vec![
        chunk(
            "acme-overview",
            "acme-deck",
            "Acme builds warehouse robots for mid-size logistics operators. The product automates pallet picking.",
        ),
        chunk(
            "acme-team",
            "acme-deck",
            "The founding team previously built drones at a large aerospace company.",
        ),
        chunk(
            "acme-funding",
            "acme-deck",
            "Acme reports monthly burn of 200k with 18 months of runway. It raised a seed round in 2023.",
        ),
        chunk(
            "acme-competition",
            "acme-deck",
            "Main competitor Locus Robotics has raised over 400M and grows revenue quickly.",
        ),
        chunk(
            "robotics-news",
            "news",
            "Robotics industry news: warehouse automation trends show a recent launch wave across Europe.",
        ),
    ]
}

fn row(key: &str, fields: serde_json::Value) -> StructuredRecord {
    let fields = match fields {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => BTreeMap::new(),
    };
    StructuredRecord {
        row_key: key.to_string(),
        fields,
        observed_at: None,
    }
}

pub fn rows() -> Vec<StructuredRecord> {
    vec![
        row(
            "acme",
            json!({"name": "Acme", "industry": "robotics", "revenue": 1_200_000, "employee_growth": 0.4}),
        ),
        row(
            "locus",
            json!({"name": "Locus Robotics", "industry": "robotics", "revenue": 100_000_000}),
        ),
        row(
            "market-robotics",
            json!({"industry": "robotics", "market_size": "45B", "growth": "14% CAGR"}),
        ),
    ]
}

pub fn store() -> Arc<dyn SessionStore> {
    Arc::new(MemorySessionStore::new())
}

pub fn service_with(
    store: Arc<dyn SessionStore>,
    vector: Arc<dyn VectorStore>,
    registry: AgentRegistry,
    config: OrchestratorConfig,
) -> DiligenceService {
    DiligenceService::new(
        store,
        vector,
        Arc::new(InMemoryStructuredStore::new(rows())),
        registry,
        config,
    )
    .unwrap()
}

pub fn service(registry: AgentRegistry) -> DiligenceService {
    service_with(
        store(),
        Arc::new(InMemoryVectorStore::new(chunks())),
        registry,
        OrchestratorConfig::default(),
    )
}

/// Extractive registry with one kind replaced.
pub fn registry_with(agent: Arc<dyn Agent>) -> AgentRegistry {
    let mut registry = AgentRegistry::extractive();
    registry.register(agent);
    registry
}

/// Always fails permanently.
pub struct FailingAgent(pub AgentKind);

#[async_trait]
impl Agent for FailingAgent {
    fn kind(&self) -> AgentKind {
        self.0
    }

    async fn run(&self, _ctx: &AgentContext) -> AgentResult<AgentOutput> {
        Err(AgentError::Permanent(format!("{} provider rejected the request", self.0)))
    }
}

/// Sleeps, then answers like the extractive agent.
pub struct SlowAgent {
    pub inner: ExtractiveAgent,
    pub kind: AgentKind,
    pub delay: Duration,
}

impl SlowAgent {
    pub fn new(kind: AgentKind, delay: Duration) -> Self {
        Self {
            inner: ExtractiveAgent::new(kind),
            kind,
            delay,
        }
    }
}

#[async_trait]
impl Agent for SlowAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    async fn run(&self, ctx: &AgentContext) -> AgentResult<AgentOutput> {
        tokio::time::sleep(self.delay).await;
        self.inner.run(ctx).await
    }
}

/// Fails transiently for the first `flaky` runs, then delegates.
pub struct FlakyAgent {
    pub inner: ExtractiveAgent,
    pub kind: AgentKind,
    pub flaky: u32,
    pub runs: AtomicU32,
}

impl FlakyAgent {
    pub fn new(kind: AgentKind, flaky: u32) -> Self {
        Self {
            inner: ExtractiveAgent::new(kind),
            kind,
            flaky,
            runs: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Agent for FlakyAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    async fn run(&self, ctx: &AgentContext) -> AgentResult<AgentOutput> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if run <= self.flaky {
            return Err(AgentError::Transient(format!("rate limited on run {run}")));
        }
        self.inner.run(ctx).await
    }
}

/// Vector store whose first `stalls` searches hang past any timeout.
pub struct StallingVectorStore {
    pub inner: InMemoryVectorStore,
    pub stalls: u32,
    pub calls: AtomicU32,
}

impl StallingVectorStore {
    pub fn new(stalls: u32) -> Self {
        Self {
            inner: InMemoryVectorStore::new(chunks()),
            stalls,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl VectorStore for StallingVectorStore {
    async fn search(&self, query: &VectorSearch) -> RetrievalResult<Vec<VectorHit>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.stalls {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
        }
        self.inner.search(query).await
    }
}

/// One observed agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    Start(AgentKind),
    End(AgentKind),
}

/// Wraps an agent and logs every start and end, tracking overlap per kind
/// and across all kinds.
pub struct RecordingAgent {
    pub inner: Arc<dyn Agent>,
    pub log: Arc<Mutex<Vec<Mark>>>,
    pub running: Arc<Mutex<HashMap<AgentKind, u32>>>,
    pub max_overlap: Arc<Mutex<HashMap<AgentKind, u32>>>,
    pub running_total: Arc<AtomicU32>,
    pub peak_total: Arc<AtomicU32>,
}

#[async_trait]
impl Agent for RecordingAgent {
    fn kind(&self) -> AgentKind {
        self.inner.kind()
    }

    async fn run(&self, ctx: &AgentContext) -> AgentResult<AgentOutput> {
        let kind = self.kind();
        {
            let mut running = self.running.lock().unwrap();
            let now = running.entry(kind).or_insert(0);
            *now += 1;
            let mut max = self.max_overlap.lock().unwrap();
            let seen = max.entry(kind).or_insert(0);
            *seen = (*seen).max(*now);
            let total = self.running_total.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_total.fetch_max(total, Ordering::SeqCst);
            self.log.lock().unwrap().push(Mark::Start(kind));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        let result = self.inner.run(ctx).await;
        {
            *self.running.lock().unwrap().entry(kind).or_insert(1) -= 1;
            self.running_total.fetch_sub(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(Mark::End(kind));
        }
        result
    }
}

/// Registry where every agent is wrapped in a [`RecordingAgent`].
pub struct Recorder {
    pub log: Arc<Mutex<Vec<Mark>>>,
    pub max_overlap: Arc<Mutex<HashMap<AgentKind, u32>>>,
    /// Most agent runs in flight at once, over every session.
    pub peak_total: Arc<AtomicU32>,
}

pub fn recording_registry(agents: Vec<Arc<dyn Agent>>) -> (AgentRegistry, Recorder) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let running = Arc::new(Mutex::new(HashMap::new()));
    let max_overlap = Arc::new(Mutex::new(HashMap::new()));
    let running_total = Arc::new(AtomicU32::new(0));
    let peak_total = Arc::new(AtomicU32::new(0));
    let mut registry = AgentRegistry::new();
    for agent in agents {
        registry.register(Arc::new(RecordingAgent {
            inner: agent,
            log: Arc::clone(&log),
            running: Arc::clone(&running),
            max_overlap: Arc::clone(&max_overlap),
            running_total: Arc::clone(&running_total),
            peak_total: Arc::clone(&peak_total),
        }));
    }
    (
        registry,
        Recorder {
            log,
            max_overlap,
            peak_total,
        },
    )
}

pub fn extractive_agents() -> Vec<Arc<dyn Agent>> {
    AgentKind::ALL
        .iter()
        .map(|kind| Arc::new(ExtractiveAgent::new(*kind)) as Arc<dyn Agent>)
        .collect()
}
