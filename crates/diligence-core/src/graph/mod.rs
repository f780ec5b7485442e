//! Task graph construction.
//!
//! A requested set of analyses is compiled into one task per agent kind,
//! with dependency edges taken from [`DependencyRules`]. An edge `A -> B`
//! means B waits for A. Required upstream kinds that were not requested are
//! added to the graph; optional upstream kinds are only wired when present.
//!
//! Tasks are emitted in topological order (Kahn's algorithm, ties broken by
//! canonical kind order), so the result is deterministic.

pub mod error;

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use diligence_state::{AgentKind, Dependency, TaskId, TaskRecord};

use crate::agents::AgentRegistry;

pub use error::{GraphConfigError, GraphResult};

/// One upstream edge of an agent kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyRule {
    pub upstream: AgentKind,
    pub required: bool,
}

/// Fixed dependency rules between agent kinds.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyRules {
    rules: BTreeMap<AgentKind, Vec<DependencyRule>>,
}

impl Default for DependencyRules {
    /// Summary and WebSearch stand alone. Competitor and Industry read the
    /// summary when it exists. Q&A needs the summary indexed as evidence and
    /// uses the other analyses when they succeed.
    fn default() -> Self {
        Self::empty()
            .with(AgentKind::Competitor, AgentKind::Summary, false)
            .with(AgentKind::Industry, AgentKind::Summary, false)
            .with(AgentKind::Qa, AgentKind::Summary, true)
            .with(AgentKind::Qa, AgentKind::Competitor, false)
            .with(AgentKind::Qa, AgentKind::Industry, false)
            .with(AgentKind::Qa, AgentKind::WebSearch, false)
    }
}

impl DependencyRules {
    pub fn empty() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }

    /// Add (or replace) the edge `upstream -> kind`.
    pub fn with(mut self, kind: AgentKind, upstream: AgentKind, required: bool) -> Self {
        let edges = self.rules.entry(kind).or_default();
        edges.retain(|r| r.upstream != upstream);
        edges.push(DependencyRule { upstream, required });
        self
    }

    pub fn for_kind(&self, kind: AgentKind) -> &[DependencyRule] {
        self.rules.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Tasks of one session in topological order.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskGraph {
    tasks: Vec<TaskRecord>,
}

impl TaskGraph {
    pub fn tasks(&self) -> &[TaskRecord] {
        &self.tasks
    }

    pub fn into_tasks(self) -> Vec<TaskRecord> {
        self.tasks
    }

    pub fn kinds(&self) -> Vec<AgentKind> {
        self.tasks.iter().map(|t| t.kind).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Compiles analysis requests into task graphs.
pub struct TaskGraphBuilder<'a> {
    rules: DependencyRules,
    registry: &'a AgentRegistry,
}

impl<'a> TaskGraphBuilder<'a> {
    pub fn new(registry: &'a AgentRegistry) -> Self {
        Self {
            rules: DependencyRules::default(),
            registry,
        }
    }

    pub fn with_rules(mut self, rules: DependencyRules) -> Self {
        self.rules = rules;
        self
    }

    /// Parse analysis names (aliases accepted) and build the graph.
    pub fn build<S: AsRef<str>>(&self, requested: &[S]) -> GraphResult<TaskGraph> {
        let kinds = requested
            .iter()
            .map(|name| {
                name.as_ref()
                    .parse::<AgentKind>()
                    .map_err(|_| GraphConfigError::UnknownAgentKind {
                        kind: name.as_ref().to_string(),
                    })
            })
            .collect::<GraphResult<Vec<_>>>()?;
        self.build_kinds(&kinds)
    }

    pub fn build_kinds(&self, requested: &[AgentKind]) -> GraphResult<TaskGraph> {
        if requested.is_empty() {
            return Err(GraphConfigError::EmptyRequest);
        }

        // Close over required upstream kinds.
        let mut selected: BTreeSet<AgentKind> = BTreeSet::new();
        let mut pending: VecDeque<AgentKind> = requested.iter().copied().collect();
        while let Some(kind) = pending.pop_front() {
            if !selected.insert(kind) {
                continue;
            }
            for rule in self.rules.for_kind(kind) {
                if rule.required && !selected.contains(&rule.upstream) {
                    pending.push_back(rule.upstream);
                }
            }
        }

        if let Some(missing) = selected.iter().find(|k| !self.registry.contains(**k)) {
            return Err(GraphConfigError::UnregisteredAgent {
                kind: missing.to_string(),
            });
        }

        // kind -> upstream kinds present in the graph
        let upstream: BTreeMap<AgentKind, Vec<DependencyRule>> = selected
            .iter()
            .map(|kind| {
                let edges = self
                    .rules
                    .for_kind(*kind)
                    .iter()
                    .copied()
                    .filter(|r| selected.contains(&r.upstream))
                    .collect();
                (*kind, edges)
            })
            .collect();

        let order = topological_order(&upstream)?;

        let tasks = order
            .into_iter()
            .map(|kind| {
                let deps = upstream
                    .get(&kind)
                    .map(|edges| {
                        edges
                            .iter()
                            .map(|r| Dependency {
                                task_id: TaskId::from(r.upstream),
                                required: r.required,
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                TaskRecord::new(TaskId::from(kind), kind, deps)
            })
            .collect();

        Ok(TaskGraph { tasks })
    }
}

/// Kahn's algorithm over `kind -> upstream` edges.
fn topological_order(
    upstream: &BTreeMap<AgentKind, Vec<DependencyRule>>,
) -> GraphResult<Vec<AgentKind>> {
    let mut in_degree: BTreeMap<AgentKind, usize> =
        upstream.iter().map(|(k, edges)| (*k, edges.len())).collect();
    let mut downstream: BTreeMap<AgentKind, Vec<AgentKind>> = BTreeMap::new();
    for (kind, edges) in upstream {
        for rule in edges {
            downstream.entry(rule.upstream).or_default().push(*kind);
        }
    }

    let mut ready: BTreeSet<AgentKind> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(k, _)| *k)
        .collect();
    let mut sorted = Vec::with_capacity(upstream.len());

    while let Some(kind) = ready.pop_first() {
        sorted.push(kind);
        for dependent in downstream.get(&kind).into_iter().flatten() {
            if let Some(deg) = in_degree.get_mut(dependent) {
                *deg -= 1;
                if *deg == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }

    if sorted.len() < upstream.len() {
        return Err(GraphConfigError::Cycle {
            path: find_cycle(upstream).unwrap_or_default(),
        });
    }
    Ok(sorted)
}

/// DFS for one cycle, reported as kind names with the start repeated at the end.
fn find_cycle(upstream: &BTreeMap<AgentKind, Vec<DependencyRule>>) -> Option<Vec<String>> {
    fn visit(
        kind: AgentKind,
        upstream: &BTreeMap<AgentKind, Vec<DependencyRule>>,
        done: &mut BTreeSet<AgentKind>,
        stack: &mut Vec<AgentKind>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = stack.iter().position(|k| *k == kind) {
            let mut path: Vec<String> = stack[pos..].iter().map(|k| k.to_string()).collect();
            path.push(kind.to_string());
            return Some(path);
        }
        if done.contains(&kind) {
            return None;
        }
        stack.push(kind);
        for rule in upstream.get(&kind).into_iter().flatten() {
            if let Some(path) = visit(rule.upstream, upstream, done, stack) {
                return Some(path);
            }
        }
        stack.pop();
        done.insert(kind);
        None
    }

    let mut done = BTreeSet::new();
    upstream
        .keys()
        .find_map(|kind| visit(*kind, upstream, &mut done, &mut Vec::new()))
}

/// Tasks that depend on `task_id`, with whether the edge is required.
pub fn dependents_of<'t>(tasks: &'t [TaskRecord], task_id: &TaskId) -> Vec<(&'t TaskRecord, bool)> {
    tasks
        .iter()
        .filter_map(|t| {
            t.depends_on
                .iter()
                .find(|d| &d.task_id == task_id)
                .map(|d| (t, d.required))
        })
        .collect()
}
