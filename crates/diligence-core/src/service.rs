//! Service facade: submission, status, streaming, cancellation, resume and
//! conversational Q&A over one shared scheduler.
//!
//! Each driven session runs on its own spawned task. The service keeps the
//! caller-side handles (cancel sender, event broadcaster, completion watch)
//! while a session is driven here and drops them once it finishes. Status
//! reads always go to the store, so they work for sessions driven by another
//! process too.
//!
//! The service also fronts the startup corpus: similar-startup search and
//! portfolio (investment status) updates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tracing::{info, instrument, Instrument};

use diligence_state::{
    NewSession, SessionId, SessionRecord, SessionStatus, SessionStore, StartupProfile,
};

use crate::agents::{AgentRegistry, AgentRuntime};
use crate::config::{check_concurrency, deadline_after, OrchestratorConfig};
use crate::context::ContextAssembler;
use crate::error::{DiligenceError, Result, SchedulerError, SchedulerResult};
use crate::graph::{DependencyRules, TaskGraphBuilder};
use crate::obs;
use crate::retrieval::{
    RetrievalAdapter, SimilarStartup, SimilarStartupQuery, StructuredStore, VectorStore,
};
use crate::scheduler::{Scheduler, SessionControl, SessionEvent};
use crate::synthesis::{Answer, SynthesisComposer, SynthesisResult};

const EVENT_BUFFER: usize = 256;

/// Per-submission overrides. Unset fields fall back to [`OrchestratorConfig`].
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Questions for the Q&A task.
    pub questions: Vec<String>,
    pub session_deadline_ms: Option<u64>,
    pub max_concurrent: Option<usize>,
}

impl SubmitOptions {
    pub fn with_questions<S: Into<String>>(mut self, questions: impl IntoIterator<Item = S>) -> Self {
        self.questions = questions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.session_deadline_ms = Some(deadline_ms);
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = Some(max_concurrent);
        self
    }
}

type Outcome = Option<SchedulerResult<SessionStatus>>;

struct Driven {
    /// Distinguishes a resumed drive from the one it replaced.
    generation: u64,
    cancel: watch::Sender<bool>,
    events: broadcast::Sender<SessionEvent>,
    done: watch::Receiver<Outcome>,
}

type DrivenMap = Arc<Mutex<HashMap<SessionId, Driven>>>;

/// Entry point for callers of the orchestration core.
pub struct DiligenceService {
    store: Arc<dyn SessionStore>,
    registry: Arc<AgentRegistry>,
    rules: DependencyRules,
    scheduler: Scheduler,
    composer: SynthesisComposer,
    adapter: RetrievalAdapter,
    config: Arc<OrchestratorConfig>,
    driven: DrivenMap,
    generations: AtomicU64,
}

impl DiligenceService {
    pub fn new(
        store: Arc<dyn SessionStore>,
        vector: Arc<dyn VectorStore>,
        structured: Arc<dyn StructuredStore>,
        registry: AgentRegistry,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        let adapter = RetrievalAdapter::new(vector, structured, &config);
        Self::from_adapter(store, adapter, registry, config)
    }

    /// Build over a preconfigured adapter, e.g. one with a query embedder.
    pub fn from_adapter(
        store: Arc<dyn SessionStore>,
        adapter: RetrievalAdapter,
        registry: AgentRegistry,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let registry = Arc::new(registry);
        let assembler = ContextAssembler::new(adapter.clone(), &config)?;
        let runtime = AgentRuntime::new(assembler, Arc::clone(&registry), Arc::clone(&config));
        let scheduler = Scheduler::new(Arc::clone(&store), runtime, Arc::clone(&config));
        let composer = SynthesisComposer::new(adapter.clone(), config.top_k, config.min_relevance);

        Ok(Self {
            store,
            registry,
            rules: DependencyRules::default(),
            scheduler,
            composer,
            adapter,
            config,
            driven: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
        })
    }

    /// Replace the default dependency rules used for new submissions.
    pub fn with_rules(mut self, rules: DependencyRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Validate the requested analyses, create the session and start driving it.
    ///
    /// A malformed request fails with [`DiligenceError::GraphConfig`], and an
    /// out-of-range override with [`DiligenceError::Config`], before anything
    /// is written to the store.
    #[instrument(skip(self, profile, analyses, options), fields(startup = %profile.name))]
    pub async fn submit<S: AsRef<str>>(
        &self,
        profile: StartupProfile,
        analyses: &[S],
        options: SubmitOptions,
    ) -> Result<SessionId> {
        let graph = TaskGraphBuilder::new(&self.registry)
            .with_rules(self.rules.clone())
            .build(analyses)?;

        let deadline_at = deadline_after(
            Utc::now(),
            options
                .session_deadline_ms
                .unwrap_or(self.config.session_deadline_ms),
        )?;
        let max_concurrent = check_concurrency(
            "max_concurrent",
            options
                .max_concurrent
                .unwrap_or(self.config.session_max_concurrent),
        )?;

        let startup = profile.name.clone();
        let tasks = graph.len();
        let session_id = self
            .store
            .create(NewSession {
                profile,
                questions: options.questions,
                tasks: graph.into_tasks(),
                deadline_at,
                max_concurrent,
            })
            .await?;

        obs::emit_session_submitted(&session_id, &startup, tasks);
        self.drive(&session_id);
        Ok(session_id)
    }

    /// Current persisted state of a session.
    pub async fn status(&self, session_id: &SessionId) -> Result<SessionRecord> {
        Ok(self.store.read(session_id).await?)
    }

    /// Subscribe to task-completion events of a session driven here.
    ///
    /// Events emitted before subscribing are not replayed; use
    /// [`Self::status`] for a snapshot. A finished session is no longer
    /// driven, so subscribing to it fails with `NotActive`.
    pub fn subscribe(&self, session_id: &SessionId) -> Result<broadcast::Receiver<SessionEvent>> {
        let driven = lock(&self.driven);
        let entry = driven
            .get(session_id)
            .ok_or_else(|| DiligenceError::NotActive(session_id.clone()))?;
        Ok(entry.events.subscribe())
    }

    /// Request cancellation. Open tasks are cancelled and dispatch stops.
    pub fn cancel(&self, session_id: &SessionId) -> Result<()> {
        let driven = lock(&self.driven);
        let entry = driven
            .get(session_id)
            .ok_or_else(|| DiligenceError::NotActive(session_id.clone()))?;
        let _ = entry.cancel.send(true);
        info!(session_id = %session_id, "cancellation requested");
        Ok(())
    }

    /// Wait for a session to finish, then compose and persist its briefing.
    ///
    /// Works for sessions this service drives and for sessions already
    /// terminal in the store.
    pub async fn wait(&self, session_id: &SessionId) -> Result<SynthesisResult> {
        let done = lock(&self.driven).get(session_id).map(|d| d.done.clone());
        if let Some(mut done) = done {
            let outcome = done
                .wait_for(Option::is_some)
                .await
                .map(|o| o.clone())
                .unwrap_or(None);
            match outcome {
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(SchedulerError::Aborted {
                        session_id: session_id.to_string(),
                    }
                    .into())
                }
            }
        }

        let record = self.store.read(session_id).await?;
        if !record.status.is_terminal() {
            return Err(DiligenceError::NotActive(session_id.clone()));
        }
        let report = self.composer.compose(&record)?;
        self.store
            .store_report(session_id, serde_json::to_value(&report)?)
            .await?;
        Ok(report)
    }

    /// The stored briefing if one exists, else a fresh view of current state.
    ///
    /// For a running session the view marks unfinished sections as pending.
    pub async fn report(&self, session_id: &SessionId) -> Result<SynthesisResult> {
        let record = self.store.read(session_id).await?;
        if let Some(stored) = record.report.clone() {
            return Ok(serde_json::from_value(stored)?);
        }
        Ok(self.composer.compose(&record)?)
    }

    /// Answer a question grounded in the session's evidence and the corpus.
    ///
    /// Fails with `InsufficientContext` instead of guessing when nothing
    /// relevant is found.
    pub async fn ask(&self, session_id: &SessionId, question: &str) -> Result<Answer> {
        let record = self.store.read(session_id).await?;
        match self.composer.answer(&record, question).await {
            Ok(answer) => {
                obs::emit_qa_answered(session_id, answer.citations.len(), true);
                Ok(answer)
            }
            Err(e) => {
                obs::emit_qa_answered(session_id, 0, false);
                Err(e.into())
            }
        }
    }

    /// Continue a session left unfinished by a previous process.
    ///
    /// The remaining deadline is whatever is left of the stored absolute
    /// deadline; an already elapsed deadline settles the session at once.
    pub async fn resume(&self, session_id: &SessionId) -> Result<()> {
        let in_progress = lock(&self.driven)
            .get(session_id)
            .map(|d| d.done.borrow().is_none())
            .unwrap_or(false);
        if in_progress {
            return Ok(());
        }
        let record = self.store.read(session_id).await?;
        if record.status.is_terminal() {
            return Err(SchedulerError::AlreadyFinished {
                session_id: session_id.to_string(),
                status: record.status.to_string(),
            }
            .into());
        }
        info!(session_id = %session_id, "resuming session");
        self.drive(session_id);
        Ok(())
    }

    /// Ids of sessions in the store, optionally filtered by status.
    pub async fn list(&self, status: Option<SessionStatus>) -> Result<Vec<SessionId>> {
        Ok(self.store.list(status).await?)
    }

    /// Startups in the corpus resembling the query, one entry per startup.
    pub async fn similar_startups(&self, query: &SimilarStartupQuery) -> Result<Vec<SimilarStartup>> {
        let found = self.adapter.similar_startups(query).await?;
        info!(found = found.len(), industry = ?query.industry, "similar startups");
        Ok(found)
    }

    /// Mark every indexed chunk of `startup_name` as invested in or not.
    ///
    /// Fails with `StartupNotFound` when the corpus holds nothing for it.
    pub async fn update_investment_status(&self, startup_name: &str, invested: bool) -> Result<usize> {
        let updated = self
            .adapter
            .update_investment_status(startup_name, invested)
            .await?;
        if updated == 0 {
            return Err(DiligenceError::StartupNotFound(startup_name.to_string()));
        }
        info!(startup = startup_name, invested, updated, "investment status updated");
        Ok(updated)
    }

    fn drive(&self, session_id: &SessionId) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (done_tx, done_rx) = watch::channel(None);

        let control = SessionControl {
            cancel: cancel_rx,
            events: events.clone(),
        };
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        lock(&self.driven).insert(
            session_id.clone(),
            Driven {
                generation,
                cancel: cancel_tx,
                events,
                done: done_rx,
            },
        );

        let scheduler = self.scheduler.clone();
        let driven = Arc::clone(&self.driven);
        let id = session_id.clone();
        tokio::spawn(
            async move {
                let outcome = scheduler.run(&id, control).await;
                if let Err(e) = &outcome {
                    tracing::error!(error = %e, "scheduler stopped");
                }
                // Waiters holding a receiver still see the outcome.
                let _ = done_tx.send(Some(outcome));
                let mut driven = lock(&driven);
                if driven.get(&id).map(|d| d.generation) == Some(generation) {
                    driven.remove(&id);
                }
            }
            .instrument(obs::session_span(session_id)),
        );
    }
}

fn lock(driven: &Mutex<HashMap<SessionId, Driven>>) -> MutexGuard<'_, HashMap<SessionId, Driven>> {
    driven.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl std::fmt::Debug for DiligenceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiligenceService")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
