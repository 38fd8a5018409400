use std::fmt::Write;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::state::{RunState, SkipReason, Status};
use crate::error::ErrorKind;
use crate::graph::{Graph, Role, TaskId};

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

/// Terminal state of one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub id: TaskId,
    pub name: String,
    pub role: Role,
    pub band: Option<u8>,
    pub status: Status,
    pub skip_reason: Option<SkipReason>,
    pub attempts: u32,
    pub error: Option<ErrorKind>,
    pub message: Option<String>,
    pub duration: Duration,
}

/// What is left of a run once it is over.
///
/// Serializable, so callers can archive it or hand it to monitoring. Mapping
/// the outcome to a process exit code is left to the caller, see
/// [`RunReport::is_success`].
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub area: String,
    pub status: RunStatus,
    pub error: Option<ErrorKind>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    /// One entry per node, in graph build order.
    pub nodes: Vec<NodeReport>,
}

impl RunReport {
    pub(crate) fn new(
        graph: &Graph,
        state: &RunState<'_>,
        started_at: DateTime<Utc>,
        duration: Duration,
        timed_out: bool,
    ) -> Self {
        let nodes: Vec<NodeReport> = graph
            .nodes()
            .filter_map(|node| {
                let run = state.node(node.id())?;
                let (error, message) = match &run.error {
                    Some((kind, message)) => (Some(*kind), Some(message.clone())),
                    None => (None, None),
                };

                Some(NodeReport {
                    id: node.id(),
                    name: node.name().to_string(),
                    role: node.role(),
                    band: node.band(),
                    status: run.status,
                    skip_reason: run.skip_reason,
                    attempts: run.attempts,
                    // a node that eventually succeeded keeps no error
                    error: error.filter(|_| run.status != Status::Succeeded),
                    message: message.filter(|_| run.status != Status::Succeeded),
                    duration: run.elapsed,
                })
            })
            .collect();

        let clean = nodes.iter().all(|node| {
            node.status == Status::Succeeded
                || (node.status == Status::Skipped && node.skip_reason == Some(SkipReason::NoScenes))
        });

        let (status, error) = if timed_out {
            (RunStatus::Failed, Some(ErrorKind::Timeout))
        } else if clean {
            (RunStatus::Succeeded, None)
        } else {
            let cause = nodes
                .iter()
                .find(|node| node.status == Status::Failed)
                .and_then(|node| node.error)
                .unwrap_or(ErrorKind::UpstreamFailure);
            (RunStatus::Failed, Some(cause))
        };

        Self {
            area: graph.area().name.clone(),
            status,
            error,
            started_at,
            duration,
            nodes,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn node(&self, id: TaskId) -> Option<&NodeReport> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn find(&self, role: Role, band: Option<u8>) -> Option<&NodeReport> {
        self.nodes
            .iter()
            .find(|node| node.role == role && node.band == band)
    }

    pub fn count(&self, status: Status) -> usize {
        self.nodes.iter().filter(|node| node.status == status).count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Renders the graph as a Mermaid diagram, each node labelled with its
    /// duration and coloured by terminal status.
    ///
    /// * **Green**: Succeeded
    /// * **Red**: Failed
    /// * **Orange**: Upstream failed
    /// * **Grey**: Skipped
    pub fn render_mermaid(&self, graph: &Graph) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        for node in &self.nodes {
            let name = node.name.replace('"', "\\\"");
            let (label, fill) = match node.status {
                Status::Succeeded => (format!("{:.2?}", node.duration), "#90EE90"),
                Status::Failed => ("failed".to_string(), "#FF7F7F"),
                Status::UpstreamFailed => ("upstream failed".to_string(), "#FFB347"),
                Status::Skipped => ("skipped".to_string(), "#D3D3D3"),
                Status::Pending | Status::Running => ("unfinished".to_string(), "#FFFFFF"),
            };

            let _ = writeln!(f, "    {}[\"{}\\n{}\"]", node.id, name, label);
            let _ = writeln!(f, "    style {} fill:{}", node.id, fill);
        }

        for (source, target) in graph.edges() {
            let _ = writeln!(f, "    {source} --> {target}");
        }

        f
    }
}
