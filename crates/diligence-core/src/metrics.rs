//! Global atomic counters for the orchestration core.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single `info!` event,
//! e.g. when a session finishes.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    tasks_dispatched: AtomicU64,
    task_retries: AtomicU64,
    task_failures: AtomicU64,
    sessions_finished: AtomicU64,
    retrieval_timeouts: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            tasks_dispatched: AtomicU64::new(0),
            task_retries: AtomicU64::new(0),
            task_failures: AtomicU64::new(0),
            sessions_finished: AtomicU64::new(0),
            retrieval_timeouts: AtomicU64::new(0),
        }
    }

    pub fn inc_tasks_dispatched(&self) {
        self.tasks_dispatched.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "tasks_dispatched", "counter incremented");
    }

    pub fn inc_task_retries(&self) {
        self.task_retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "task_retries", "counter incremented");
    }

    pub fn inc_task_failures(&self) {
        self.task_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "task_failures", "counter incremented");
    }

    pub fn inc_sessions_finished(&self) {
        self.sessions_finished.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sessions_finished", "counter incremented");
    }

    pub fn inc_retrieval_timeouts(&self) {
        self.retrieval_timeouts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "retrieval_timeouts", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            tasks_dispatched = self.tasks_dispatched(),
            task_retries = self.task_retries(),
            task_failures = self.task_failures(),
            sessions_finished = self.sessions_finished(),
            retrieval_timeouts = self.retrieval_timeouts(),
        );
    }

    pub fn tasks_dispatched(&self) -> u64 {
        self.tasks_dispatched.load(Ordering::Relaxed)
    }

    pub fn task_retries(&self) -> u64 {
        self.task_retries.load(Ordering::Relaxed)
    }

    pub fn task_failures(&self) -> u64 {
        self.task_failures.load(Ordering::Relaxed)
    }

    pub fn sessions_finished(&self) -> u64 {
        self.sessions_finished.load(Ordering::Relaxed)
    }

    pub fn retrieval_timeouts(&self) -> u64 {
        self.retrieval_timeouts.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let m = Metrics::new();
        m.inc_tasks_dispatched();
        m.inc_tasks_dispatched();
        m.inc_task_retries();
        m.inc_retrieval_timeouts();
        assert_eq!(m.tasks_dispatched(), 2);
        assert_eq!(m.task_retries(), 1);
        assert_eq!(m.task_failures(), 0);
        assert_eq!(m.retrieval_timeouts(), 1);
        m.flush();
    }
}
