use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::error::ErrorKind;
use crate::graph::{Graph, TaskId};
use crate::store::ResultStore;

/// Lifecycle of a node within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Running,
    Succeeded,
    Failed,
    UpstreamFailed,
    Skipped,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Succeeded | Status::Failed | Status::UpstreamFailed | Status::Skipped
        )
    }
}

/// Why a node was skipped instead of run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The search selected no scene, so there was nothing to process.
    NoScenes,
    /// The run deadline expired first.
    Timeout,
}

#[derive(Debug, Clone)]
pub(crate) struct NodeState {
    pub status: Status,
    pub skip_reason: Option<SkipReason>,
    pub attempts: u32,
    pub error: Option<(ErrorKind, String)>,
    /// Summed over all attempts.
    pub elapsed: Duration,
}

impl NodeState {
    fn new() -> Self {
        Self {
            status: Status::Pending,
            skip_reason: None,
            attempts: 0,
            error: None,
            elapsed: Duration::ZERO,
        }
    }
}

/// Everything that changes while a graph runs.
///
/// Owned by the scheduling loop. Every status change goes through one of the
/// transition methods below, which only accept legal transitions.
pub(crate) struct RunState<'g> {
    graph: &'g Graph,
    store: ResultStore,
    nodes: HashMap<TaskId, NodeState>,
}

impl<'g> RunState<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        Self {
            graph,
            store: ResultStore::for_graph(graph),
            nodes: graph.nodes().map(|node| (node.id(), NodeState::new())).collect(),
        }
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn node(&self, id: TaskId) -> Option<&NodeState> {
        self.nodes.get(&id)
    }

    pub fn status(&self, id: TaskId) -> Status {
        self.nodes.get(&id).map_or(Status::Pending, |node| node.status)
    }

    pub fn attempts(&self, id: TaskId) -> u32 {
        self.nodes.get(&id).map_or(0, |node| node.attempts)
    }

    fn transition(&mut self, id: TaskId, from: &[Status], to: Status) -> Option<&mut NodeState> {
        let node = self.nodes.get_mut(&id)?;
        if !from.contains(&node.status) {
            tracing::error!(task = %id, from = ?node.status, to = ?to, "illegal status transition");
            return None;
        }
        node.status = to;
        Some(node)
    }

    /// `Pending → Running`, returns the 1-based attempt number.
    pub fn start(&mut self, id: TaskId) -> u32 {
        match self.transition(id, &[Status::Pending], Status::Running) {
            Some(node) => {
                node.attempts += 1;
                node.attempts
            }
            None => 0,
        }
    }

    pub fn succeed(&mut self, id: TaskId, elapsed: Duration) {
        if let Some(node) = self.transition(id, &[Status::Running], Status::Succeeded) {
            node.elapsed += elapsed;
        }
    }

    pub fn fail(&mut self, id: TaskId, kind: ErrorKind, message: String, elapsed: Duration) {
        if let Some(node) = self.transition(id, &[Status::Running], Status::Failed) {
            node.elapsed += elapsed;
            node.error = Some((kind, message));
        }
    }

    /// `Running → Pending` after a transient failure; the error is kept in
    /// case the next attempt never happens.
    pub fn retry(&mut self, id: TaskId, kind: ErrorKind, message: String, elapsed: Duration) {
        if let Some(node) = self.transition(id, &[Status::Running], Status::Pending) {
            node.elapsed += elapsed;
            node.error = Some((kind, message));
        }
    }

    pub fn upstream_failed(&mut self, id: TaskId, cause: TaskId) {
        let name = self
            .graph
            .node(cause)
            .map_or_else(|| cause.to_string(), |node| node.name().to_string());

        if let Some(node) = self.transition(id, &[Status::Pending], Status::UpstreamFailed) {
            node.error = Some((ErrorKind::UpstreamFailure, format!("upstream task '{name}' did not succeed")));
        }
    }

    /// Marks every node that has not reached a terminal status as skipped,
    /// returning how many were.
    pub fn skip_unfinished(&mut self, reason: SkipReason) -> usize {
        let mut skipped = 0;

        for node in self.nodes.values_mut() {
            if node.status.is_terminal() {
                continue;
            }

            node.status = Status::Skipped;
            node.skip_reason = Some(reason);
            if reason == SkipReason::Timeout {
                node.error = Some((ErrorKind::Timeout, "run deadline expired".into()));
            }
            skipped += 1;
        }

        skipped
    }

    pub fn is_done(&self) -> bool {
        self.nodes.values().all(|node| node.status.is_terminal())
    }
}
