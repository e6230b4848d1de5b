use crate::{ErrorKind, Graph, TaskGraphError, timestamp_now};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const RUN_STATE_SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeError {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub status: NodeStatus,
    pub attempt_count: u32,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub ended_at: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub last_error: Option<NodeError>,
    /// Failed, but the retry controller already scheduled another attempt.
    #[serde(default)]
    pub retry_pending: bool,
    #[serde(default)]
    pub skipped_because: Option<String>,
}

impl NodeState {
    pub fn pending() -> Self {
        Self {
            status: NodeStatus::Pending,
            attempt_count: 0,
            started_at: None,
            ended_at: None,
            artifacts: Vec::new(),
            last_error: None,
            retry_pending: false,
            skipped_because: None,
        }
    }

    /// Terminal statuses never transition again within a run.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            NodeStatus::Success | NodeStatus::Skipped => true,
            NodeStatus::Failed => !self.retry_pending,
            NodeStatus::Pending | NodeStatus::Running => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    PartiallyFailed,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub schema_version: u32,
    pub run_id: String,
    pub graph_id: String,
    pub graph_digest: String,
    pub status: RunStatus,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub resume_count: u32,
    pub nodes: BTreeMap<String, NodeState>,
    /// resource name -> holding node id
    #[serde(default)]
    pub locks: BTreeMap<String, String>,
}

impl RunState {
    pub fn new(run_id: impl Into<String>, graph: &Graph) -> Self {
        let now = timestamp_now();
        Self {
            schema_version: RUN_STATE_SCHEMA_VERSION,
            run_id: run_id.into(),
            graph_id: graph.project_id().to_string(),
            graph_digest: graph.digest().to_string(),
            status: RunStatus::Running,
            created_at: now.clone(),
            updated_at: now,
            resume_count: 0,
            nodes: graph
                .node_ids()
                .map(|id| (id.clone(), NodeState::pending()))
                .collect(),
            locks: BTreeMap::new(),
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeState> {
        self.nodes.get(node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Result<&mut NodeState, TaskGraphError> {
        self.nodes.get_mut(node_id).ok_or_else(|| {
            TaskGraphError::State(format!(
                "run '{}' has no state for node '{}'",
                self.run_id, node_id
            ))
        })
    }

    pub fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.nodes.get(node_id).map(|node| node.status)
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes
            .values()
            .filter(|node| node.status == status)
            .count()
    }

    /// No node is pending or running.
    pub fn is_settled(&self) -> bool {
        self.nodes
            .values()
            .all(|node| !matches!(node.status, NodeStatus::Pending | NodeStatus::Running))
    }

    pub fn touch(&mut self) {
        self.updated_at = timestamp_now();
    }

    /// Ensures the loaded state belongs to `graph`.
    pub fn check_matches(&self, graph: &Graph) -> Result<(), TaskGraphError> {
        if self.schema_version != RUN_STATE_SCHEMA_VERSION {
            return Err(TaskGraphError::ResumeMismatch {
                run_id: self.run_id.clone(),
                reason: format!("unsupported state schema version {}", self.schema_version),
            });
        }
        if self.graph_digest != graph.digest() {
            return Err(TaskGraphError::ResumeMismatch {
                run_id: self.run_id.clone(),
                reason: format!(
                    "graph changed since the run started (digest {} != {})",
                    self.graph_digest,
                    graph.digest()
                ),
            });
        }
        for node_id in graph.node_ids() {
            if !self.nodes.contains_key(node_id) {
                return Err(TaskGraphError::ResumeMismatch {
                    run_id: self.run_id.clone(),
                    reason: format!("state is missing node '{node_id}'"),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_graph_str;

    fn graph(project: &str) -> Graph {
        parse_graph_str(
            &format!("project_id: {project}\nnodes:\n  - {{ id: a, kind: packaging }}\n"),
            None,
        )
        .expect("graph should load")
    }

    #[test]
    fn run_state_new_expected_all_nodes_pending() {
        let state = RunState::new("run-1", &graph("p"));
        assert_eq!(state.graph_id, "p");
        assert_eq!(state.status_of("a"), Some(NodeStatus::Pending));
        assert!(!state.is_settled());
    }

    #[test]
    fn node_state_failed_with_retry_pending_expected_not_terminal() {
        let mut node = NodeState::pending();
        node.status = NodeStatus::Failed;
        node.retry_pending = true;
        assert!(!node.is_terminal());
        node.retry_pending = false;
        assert!(node.is_terminal());
    }

    #[test]
    fn check_matches_other_graph_expected_mismatch() {
        let state = RunState::new("run-1", &graph("p"));
        let error = state
            .check_matches(&graph("q"))
            .expect_err("different graph should not match");
        assert!(matches!(error, TaskGraphError::ResumeMismatch { .. }));
        state
            .check_matches(&graph("p"))
            .expect("same graph should match");
    }

    #[test]
    fn run_state_json_expected_snake_case_statuses() {
        let state = RunState::new("run-1", &graph("p"));
        let json = serde_json::to_value(&state).expect("state should serialize");
        assert_eq!(json["nodes"]["a"]["status"], "pending");
        assert_eq!(json["status"], "running");
    }
}
