//! Session scheduler: the control loop that drives one task graph to
//! completion.
//!
//! The scheduler is the only writer of a session. It holds the store's
//! writer lease for as long as it runs, dispatches ready tasks to the agent
//! runtime on spawned workers, and consumes their results from a channel.
//! A task is in flight at most once at any time.
//!
//! A session ends when every task is terminal, when its deadline elapses, or
//! when it is cancelled, whichever comes first.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use diligence_state::{
    AgentKind, AttemptId, SessionId, SessionRecord, SessionStatus, SessionStore, StorageError,
    TaskChange, TaskId, TaskState, TaskUpdate, UpdateOutcome, WriterId,
};

use crate::agents::{AgentError, AgentResult, AgentRuntime, Completion};
use crate::config::OrchestratorConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::graph::dependents_of;
use crate::metrics::METRICS;
use crate::obs;

/// Progress notification pushed to subscribers in completion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    TaskChanged {
        session_id: SessionId,
        task_id: TaskId,
        kind: AgentKind,
        state: TaskState,
        attempt: u32,
    },
    SessionFinished {
        session_id: SessionId,
        status: SessionStatus,
    },
}

/// Caller-side controls for one driven session.
pub struct SessionControl {
    pub cancel: watch::Receiver<bool>,
    pub events: broadcast::Sender<SessionEvent>,
}

impl SessionControl {
    /// Controls with no cancellation source and no subscribers.
    pub fn detached() -> Self {
        let (_tx, cancel) = watch::channel(false);
        let (events, _) = broadcast::channel(16);
        Self { cancel, events }
    }
}

/// Why a session stopped before all tasks were terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Deadline,
    Cancelled,
}

enum Message {
    Finished {
        attempt: AttemptId,
        result: AgentResult<Completion>,
    },
    RetryDue {
        task_id: TaskId,
    },
}

/// Drives sessions. Cheap to clone; clones share the global concurrency limit.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn SessionStore>,
    runtime: AgentRuntime,
    config: Arc<OrchestratorConfig>,
    global: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn SessionStore>,
        runtime: AgentRuntime,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        let global = Arc::new(Semaphore::new(config.global_max_concurrent));
        Self {
            store,
            runtime,
            config,
            global,
        }
    }

    /// Run `session_id` until it reaches a terminal status.
    ///
    /// Also used to resume a session after a restart: tasks left `Running`
    /// by a previous scheduler are moved to `Retrying` and dispatched again.
    #[instrument(skip(self, session_id, control), fields(session_id = %session_id))]
    pub async fn run(
        &self,
        session_id: &SessionId,
        control: SessionControl,
    ) -> SchedulerResult<SessionStatus> {
        let record = self.store.read(session_id).await?;
        if record.status.is_terminal() {
            return Err(SchedulerError::AlreadyFinished {
                session_id: session_id.to_string(),
                status: record.status.to_string(),
            });
        }
        if let Some(task) = record
            .tasks
            .iter()
            .find(|t| !t.state.is_terminal() && !self.runtime.registry().contains(t.kind))
        {
            return Err(SchedulerError::MissingAgent {
                session_id: session_id.to_string(),
                kind: task.kind.to_string(),
            });
        }

        let writer = WriterId::new();
        self.store
            .acquire_writer(session_id, &writer, self.lease_expiry())
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut drive = Drive {
            scheduler: self,
            session_id: session_id.clone(),
            writer: writer.clone(),
            record,
            in_flight: HashMap::new(),
            timers: HashMap::new(),
            due: HashSet::new(),
            tx,
            rx,
            events: control.events,
            started: Instant::now(),
        };

        let outcome = drive.run(control.cancel).await;
        drive.abort_all();

        if let Err(e) = self.store.release_writer(session_id, &writer).await {
            obs::emit_store_error(session_id, &e);
        }
        outcome
    }

    fn lease_expiry(&self) -> chrono::DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.config.lease_ttl())
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        Utc::now() + ttl
    }
}

struct Drive<'a> {
    scheduler: &'a Scheduler,
    session_id: SessionId,
    writer: WriterId,
    /// Mirror of the stored record, refreshed after every write.
    record: SessionRecord,
    in_flight: HashMap<TaskId, JoinHandle<()>>,
    timers: HashMap<TaskId, JoinHandle<()>>,
    /// Retrying tasks whose backoff has elapsed.
    due: HashSet<TaskId>,
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
    events: broadcast::Sender<SessionEvent>,
    started: Instant,
}

impl Drive<'_> {
    async fn run(&mut self, mut cancel: watch::Receiver<bool>) -> SchedulerResult<SessionStatus> {
        let remaining = (self.record.deadline_at - Utc::now())
            .to_std()
            .unwrap_or_default();
        let deadline = tokio::time::sleep_until(Instant::now() + remaining);
        tokio::pin!(deadline);

        let renew_every = self.scheduler.config.lease_ttl() / 3;
        let mut renew = tokio::time::interval_at(Instant::now() + renew_every, renew_every);

        self.recover_orphans().await?;

        loop {
            if deadline.is_elapsed() {
                return self.finish(Some(Interrupt::Deadline)).await;
            }
            self.advance().await?;
            self.dispatch().await?;

            if self.record.all_terminal() {
                return self.finish(None).await;
            }

            tokio::select! {
                biased;
                _ = cancel_requested(&mut cancel) => {
                    return self.finish(Some(Interrupt::Cancelled)).await;
                }
                _ = &mut deadline => {
                    return self.finish(Some(Interrupt::Deadline)).await;
                }
                Some(message) = self.rx.recv() => {
                    self.handle(message).await?;
                }
                _ = renew.tick() => {
                    self.scheduler
                        .store
                        .acquire_writer(&self.session_id, &self.writer, self.scheduler.lease_expiry())
                        .await?;
                }
            }
        }
    }

    /// Tasks recorded as `Running` have no live worker in this process.
    async fn recover_orphans(&mut self) -> SchedulerResult<()> {
        let orphans: Vec<(TaskId, u32)> = self
            .record
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::Running)
            .map(|t| (t.task_id.clone(), t.attempts))
            .collect();
        for (task_id, attempts) in orphans {
            warn!(task_id = %task_id, attempts, "recovering orphaned running task");
            let attempt = AttemptId::new(task_id, attempts);
            self.write(TaskUpdate::new(
                attempt,
                TaskChange::Transition {
                    to: TaskState::Retrying,
                    reason: Some("scheduler restarted while task was running".to_string()),
                },
            ))
            .await?;
        }

        // A previous scheduler may have stopped between a failure and its cascade.
        let settled: Vec<TaskId> = self
            .record
            .tasks
            .iter()
            .filter(|t| t.state.is_terminal() && t.state != TaskState::Succeeded)
            .map(|t| t.task_id.clone())
            .collect();
        for task_id in settled {
            self.cascade(task_id).await?;
        }

        // Nothing is waiting on a backoff timer after a restart.
        self.due.extend(
            self.record
                .tasks
                .iter()
                .filter(|t| t.state == TaskState::Retrying)
                .map(|t| t.task_id.clone()),
        );
        Ok(())
    }

    /// Promote pending tasks whose dependencies have all settled, recording a
    /// gap for every optional upstream that did not succeed.
    async fn advance(&mut self) -> SchedulerResult<()> {
        let pending: Vec<TaskId> = self
            .record
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::Pending)
            .map(|t| t.task_id.clone())
            .collect();

        for task_id in pending {
            let Some(task) = self.record.task(&task_id) else {
                continue;
            };
            let deps: Vec<(TaskId, bool, TaskState)> = task
                .depends_on
                .iter()
                .filter_map(|d| {
                    self.record
                        .task(&d.task_id)
                        .map(|up| (d.task_id.clone(), d.required, up.state))
                })
                .collect();

            if !deps.iter().all(|(_, _, state)| state.is_terminal()) {
                continue;
            }

            for (upstream, _, state) in &deps {
                if *state != TaskState::Succeeded {
                    self.write(TaskUpdate::new(
                        AttemptId::new(task_id.clone(), 0),
                        TaskChange::Gap {
                            missing: upstream.clone(),
                        },
                    ))
                    .await?;
                }
            }
            self.write(TaskUpdate::transition(
                AttemptId::new(task_id, 0),
                TaskState::Ready,
            ))
            .await?;
        }
        Ok(())
    }

    /// Start ready and due-for-retry tasks up to the session ceiling.
    async fn dispatch(&mut self) -> SchedulerResult<()> {
        let limit = self.record.max_concurrent.max(1);
        let candidates: Vec<TaskId> = self
            .record
            .tasks
            .iter()
            .filter(|t| !self.in_flight.contains_key(&t.task_id))
            .filter(|t| {
                t.state == TaskState::Ready
                    || (t.state == TaskState::Retrying && self.due.contains(&t.task_id))
            })
            .map(|t| t.task_id.clone())
            .collect();

        for task_id in candidates {
            if self.in_flight.len() >= limit {
                break;
            }
            self.start(task_id).await?;
        }
        Ok(())
    }

    async fn start(&mut self, task_id: TaskId) -> SchedulerResult<()> {
        let Some(task) = self.record.task(&task_id) else {
            return Ok(());
        };
        let attempt = AttemptId::new(task_id.clone(), task.attempts + 1);
        let kind = task.kind;

        self.due.remove(&task_id);
        self.write(TaskUpdate::transition(attempt.clone(), TaskState::Running))
            .await?;

        let Some(task) = self.record.task(&task_id).cloned() else {
            return Ok(());
        };
        let snapshot = self.record.clone();
        let runtime = self.scheduler.runtime.clone();
        let global = Arc::clone(&self.scheduler.global);
        let tx = self.tx.clone();

        obs::emit_task_dispatched(&self.session_id, &attempt, kind);
        METRICS.inc_tasks_dispatched();

        let handle = tokio::spawn(async move {
            let result = match global.acquire_owned().await {
                Ok(_permit) => runtime.invoke(&snapshot, &task, attempt.clone()).await,
                Err(_) => Err(AgentError::Permanent("worker pool closed".to_string())),
            };
            let _ = tx.send(Message::Finished { attempt, result });
        });
        self.in_flight.insert(task_id, handle);
        Ok(())
    }

    async fn handle(&mut self, message: Message) -> SchedulerResult<()> {
        match message {
            Message::RetryDue { task_id } => {
                self.timers.remove(&task_id);
                self.due.insert(task_id);
                Ok(())
            }
            Message::Finished { attempt, result } => {
                self.in_flight.remove(&attempt.task_id);
                let current = self
                    .record
                    .task(&attempt.task_id)
                    .map(|t| (t.state, t.attempts));
                if current != Some((TaskState::Running, attempt.number)) {
                    debug!(attempt = %attempt, "dropping stale worker result");
                    return Ok(());
                }
                match result {
                    Ok(completion) => self.succeed(attempt, completion).await,
                    Err(err) => self.fail(attempt, err).await,
                }
            }
        }
    }

    async fn succeed(&mut self, attempt: AttemptId, completion: Completion) -> SchedulerResult<()> {
        let update = TaskUpdate::new(
            attempt.clone(),
            TaskChange::Succeeded {
                output: completion.output,
                evidence: completion.evidence,
            },
        );
        match self.write(update).await {
            Ok(()) => {
                obs::emit_task_finished(&self.session_id, &attempt, TaskState::Succeeded);
                Ok(())
            }
            Err(SchedulerError::Storage(StorageError::DanglingCitation { evidence_id, .. })) => {
                self.fail(
                    attempt,
                    AgentError::Permanent(format!("output cites unknown evidence {evidence_id}")),
                )
                .await
            }
            Err(e) => Err(e),
        }
    }

    async fn fail(&mut self, attempt: AttemptId, err: AgentError) -> SchedulerResult<()> {
        let scheduler = self.scheduler;
        let policy = &scheduler.config.retry;
        if err.is_retryable() && attempt.number < policy.max_attempts {
            let backoff = policy.backoff_for(attempt.number + 1);
            obs::emit_task_retrying(&self.session_id, &attempt, backoff.as_millis() as u64, &err);
            METRICS.inc_task_retries();
            self.write(TaskUpdate::new(
                attempt.clone(),
                TaskChange::Transition {
                    to: TaskState::Retrying,
                    reason: Some(err.to_string()),
                },
            ))
            .await?;

            let tx = self.tx.clone();
            let task_id = attempt.task_id.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                let _ = tx.send(Message::RetryDue { task_id });
            });
            self.timers.insert(attempt.task_id, timer);
            return Ok(());
        }

        let error = if err.is_retryable() {
            format!("retries exhausted after {} attempts: {err}", attempt.number)
        } else {
            err.to_string()
        };
        METRICS.inc_task_failures();
        self.write(TaskUpdate::new(attempt.clone(), TaskChange::Failed { error }))
            .await?;
        obs::emit_task_finished(&self.session_id, &attempt, TaskState::Failed);
        self.cascade(attempt.task_id).await
    }

    /// Cancel every pending task that requires `failed`, transitively.
    async fn cascade(&mut self, failed: TaskId) -> SchedulerResult<()> {
        let mut queue = VecDeque::from([failed]);
        while let Some(upstream) = queue.pop_front() {
            let Some(state) = self.record.task(&upstream).map(|t| t.state) else {
                continue;
            };
            let blocked: Vec<TaskId> = dependents_of(&self.record.tasks, &upstream)
                .into_iter()
                .filter(|(task, required)| *required && task.state == TaskState::Pending)
                .map(|(task, _)| task.task_id.clone())
                .collect();
            for task_id in blocked {
                self.write(TaskUpdate::new(
                    AttemptId::new(task_id.clone(), 0),
                    TaskChange::Transition {
                        to: TaskState::Cancelled,
                        reason: Some(format!("required dependency {upstream} {state}")),
                    },
                ))
                .await?;
                queue.push_back(task_id);
            }
        }
        Ok(())
    }

    /// Settle the session: cancel leftovers on interrupt, persist the status.
    async fn finish(&mut self, interrupt: Option<Interrupt>) -> SchedulerResult<SessionStatus> {
        let status = match interrupt {
            Some(reason) => {
                self.abort_all();
                let note = match reason {
                    Interrupt::Deadline => "session deadline elapsed",
                    Interrupt::Cancelled => "session cancelled",
                };
                let open: Vec<(TaskId, u32)> = self
                    .record
                    .tasks
                    .iter()
                    .filter(|t| !t.state.is_terminal())
                    .map(|t| (t.task_id.clone(), t.attempts))
                    .collect();
                for (task_id, attempts) in open {
                    self.write(TaskUpdate::new(
                        AttemptId::new(task_id, attempts),
                        TaskChange::Transition {
                            to: TaskState::Cancelled,
                            reason: Some(note.to_string()),
                        },
                    ))
                    .await?;
                }
                match reason {
                    Interrupt::Deadline => SessionStatus::Partial,
                    Interrupt::Cancelled => SessionStatus::Cancelled,
                }
            }
            None => settled_status(&self.record),
        };

        self.scheduler
            .store
            .set_status(&self.session_id, &self.writer, status)
            .await?;

        let _ = self.events.send(SessionEvent::SessionFinished {
            session_id: self.session_id.clone(),
            status,
        });
        obs::emit_session_finished(
            &self.session_id,
            status,
            self.started.elapsed().as_millis() as u64,
        );
        METRICS.inc_sessions_finished();
        METRICS.flush();
        info!(status = %status, "session finished");
        Ok(status)
    }

    fn abort_all(&mut self) {
        for (_, handle) in self.in_flight.drain() {
            handle.abort();
        }
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
        self.due.clear();
    }

    /// Persist one update, refresh the mirror and notify subscribers.
    async fn write(&mut self, update: TaskUpdate) -> SchedulerResult<()> {
        let store = Arc::clone(&self.scheduler.store);
        let outcome = store.update(&self.session_id, &self.writer, update.clone()).await?;
        if outcome == UpdateOutcome::Duplicate {
            return Ok(());
        }
        self.record = store.read(&self.session_id).await?;

        if let Some(task) = self.record.task(&update.task_id) {
            if !matches!(update.change, TaskChange::Gap { .. }) {
                let _ = self.events.send(SessionEvent::TaskChanged {
                    session_id: self.session_id.clone(),
                    task_id: task.task_id.clone(),
                    kind: task.kind,
                    state: task.state,
                    attempt: task.attempts,
                });
            }
        }
        Ok(())
    }
}

/// Resolve when cancellation is requested; never resolves once the sender is gone.
async fn cancel_requested(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Final status of a session whose tasks are all terminal.
pub fn settled_status(record: &SessionRecord) -> SessionStatus {
    let succeeded = record
        .tasks
        .iter()
        .filter(|t| t.state == TaskState::Succeeded)
        .count();
    if succeeded == record.tasks.len() {
        SessionStatus::Completed
    } else if succeeded == 0 {
        SessionStatus::Failed
    } else {
        SessionStatus::Partial
    }
}
