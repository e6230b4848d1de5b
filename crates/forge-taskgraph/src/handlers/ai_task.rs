use crate::handlers::NodeHandler;
use crate::handlers::collaborator::{Collaborator, CollaboratorRequest, CommandCollaborator};
use crate::{ErrorKind, ExecutionContext, Node, Outcome, TaskGraphError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// How a single AI-assisted node is carried out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiStrategy {
    Deterministic,
    Delegated,
}

impl AiStrategy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "deterministic" => Some(Self::Deterministic),
            "delegated" => Some(Self::Delegated),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deterministic => "deterministic",
            Self::Delegated => "delegated",
        }
    }
}

/// Run-wide AI dispatch mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiRunMode {
    Deterministic,
    Delegated,
    /// Per-node decision from the role policy.
    #[default]
    Auto,
}

impl AiRunMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "deterministic" => Some(Self::Deterministic),
            "delegated" => Some(Self::Delegated),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deterministic => "deterministic",
            Self::Delegated => "delegated",
            Self::Auto => "auto",
        }
    }
}

impl fmt::Display for AiRunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AiDispatchPolicy {
    pub run_mode: AiRunMode,
    pub include_roles: BTreeSet<String>,
    pub exclude_roles: BTreeSet<String>,
}

impl AiDispatchPolicy {
    pub fn with_run_mode(mut self, run_mode: AiRunMode) -> Self {
        self.run_mode = run_mode;
        self
    }

    /// Node override first, then the run mode, then the role lists.
    pub fn resolve(&self, node: &Node) -> AiStrategy {
        if let Some(strategy) = node.ai_mode {
            return strategy;
        }
        match self.run_mode {
            AiRunMode::Deterministic => AiStrategy::Deterministic,
            AiRunMode::Delegated => AiStrategy::Delegated,
            AiRunMode::Auto => match node.role.as_deref() {
                Some(role)
                    if self.include_roles.contains(role) && !self.exclude_roles.contains(role) =>
                {
                    AiStrategy::Delegated
                }
                _ => AiStrategy::Deterministic,
            },
        }
    }
}

#[async_trait]
pub trait DeterministicTask: Send + Sync {
    async fn run(&self, node: &Node, context: &ExecutionContext)
    -> Result<Outcome, TaskGraphError>;
}

/// Runs `params.command` when present, otherwise reports `params.artifacts`.
#[derive(Clone, Debug, Default)]
pub struct CommandTask;

#[async_trait]
impl DeterministicTask for CommandTask {
    async fn run(
        &self,
        node: &Node,
        context: &ExecutionContext,
    ) -> Result<Outcome, TaskGraphError> {
        let response = CommandCollaborator
            .execute(CollaboratorRequest::from_node(node, context))
            .await?;
        Ok(response.into_outcome())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyContext {
    pub project_id: String,
    pub role: Option<String>,
    pub run_mode: AiRunMode,
    pub attempt: u32,
    #[serde(default)]
    pub upstream_artifacts: BTreeMap<String, Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DelegationRequest {
    pub run_id: String,
    pub node_id: String,
    pub capability_request: Value,
    pub policy_context: PolicyContext,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationError {
    pub kind: String,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DelegationReply {
    pub ok: bool,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub tool_results: Vec<Value>,
    #[serde(default)]
    pub error: Option<DelegationError>,
}

/// Planning agent that turns a capability request into tool calls.
/// One request, one reply.
#[async_trait]
pub trait PlanningCollaborator: Send + Sync {
    async fn delegate(&self, request: DelegationRequest) -> Result<DelegationReply, TaskGraphError>;
}

pub type SharedPlanningCollaborator = Arc<dyn PlanningCollaborator>;

pub struct AiTaskHandler {
    deterministic: Arc<dyn DeterministicTask>,
    planner: Option<SharedPlanningCollaborator>,
}

impl Default for AiTaskHandler {
    fn default() -> Self {
        Self::new(Arc::new(CommandTask), None)
    }
}

impl AiTaskHandler {
    pub fn new(
        deterministic: Arc<dyn DeterministicTask>,
        planner: Option<SharedPlanningCollaborator>,
    ) -> Self {
        Self {
            deterministic,
            planner,
        }
    }

    pub fn with_planner(mut self, planner: SharedPlanningCollaborator) -> Self {
        self.planner = Some(planner);
        self
    }

    async fn delegate(&self, node: &Node, context: &ExecutionContext) -> Outcome {
        let Some(planner) = self.planner.as_ref() else {
            return Outcome::failure(
                ErrorKind::CollaboratorUnavailable,
                format!("node '{}' is delegated but no planning collaborator is configured", node.id),
            );
        };
        let request = DelegationRequest {
            run_id: context.run_id.clone(),
            node_id: node.id.clone(),
            capability_request: node
                .params
                .get("capability")
                .cloned()
                .unwrap_or_else(|| node.params.clone()),
            policy_context: PolicyContext {
                project_id: context.project_id.clone(),
                role: node.role.clone(),
                run_mode: context.ai_policy.run_mode,
                attempt: context.attempt,
                upstream_artifacts: context.upstream_artifacts.clone(),
            },
        };
        match planner.delegate(request).await {
            Ok(reply) if reply.ok => Outcome::success()
                .with_artifacts(reply.artifacts)
                .with_metadata("tool_results", Value::Array(reply.tool_results)),
            Ok(reply) => {
                let (kind, message) = match reply.error {
                    Some(error) => (ErrorKind::parse(&error.kind), error.message),
                    None => (
                        ErrorKind::Unknown,
                        "planning collaborator reported failure".to_string(),
                    ),
                };
                Outcome::failure(kind, message)
            }
            Err(error) => Outcome::from_error(&error),
        }
    }
}

#[async_trait]
impl NodeHandler for AiTaskHandler {
    async fn execute(
        &self,
        node: &Node,
        context: &ExecutionContext,
    ) -> Result<Outcome, TaskGraphError> {
        let strategy = context.ai_policy.resolve(node);
        debug!(
            node_id = node.id.as_str(),
            strategy = strategy.as_str(),
            "dispatching ai-assisted task"
        );
        let outcome = match strategy {
            AiStrategy::Deterministic => match self.deterministic.run(node, context).await {
                Ok(outcome) => outcome,
                Err(error) => Outcome::from_error(&error),
            },
            AiStrategy::Delegated => self.delegate(node, context).await,
        };
        Ok(outcome.with_metadata("ai_strategy", Value::String(strategy.as_str().to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ProcessLifecycleManager, parse_graph_str};
    use std::sync::Mutex;

    const GRAPH: &str = r#"
project_id: p
ai: { mode: auto, include_roles: [designer, copywriter], exclude_roles: [copywriter] }
nodes:
  - { id: design, kind: ai-assisted-task, role: designer, params: { capability: { task: layout } } }
  - { id: copy, kind: ai-assisted-task, role: copywriter, params: { artifacts: [copy.md] } }
  - { id: pinned, kind: ai-assisted-task, role: designer, ai_mode: deterministic }
  - { id: plain, kind: ai-assisted-task }
"#;

    #[derive(Default)]
    struct RecordingPlanner {
        requests: Mutex<Vec<DelegationRequest>>,
    }

    #[async_trait]
    impl PlanningCollaborator for RecordingPlanner {
        async fn delegate(
            &self,
            request: DelegationRequest,
        ) -> Result<DelegationReply, TaskGraphError> {
            self.requests
                .lock()
                .expect("requests mutex should lock")
                .push(request);
            Ok(DelegationReply {
                ok: true,
                artifacts: vec!["layout.fig".to_string()],
                tool_results: vec![serde_json::json!({ "tool": "figma", "ok": true })],
                error: None,
            })
        }
    }

    fn context(policy: AiDispatchPolicy) -> ExecutionContext {
        ExecutionContext {
            run_id: "run-1".to_string(),
            project_id: "p".to_string(),
            attempt: 1,
            upstream_artifacts: BTreeMap::new(),
            ai_policy: policy,
            processes: Arc::new(ProcessLifecycleManager::default()),
        }
    }

    #[test]
    fn resolve_auto_mode_expected_role_policy_and_override() {
        let graph = parse_graph_str(GRAPH, None).expect("graph should load");
        let policy = graph.ai_policy().clone();
        let strategy = |id: &str| policy.resolve(graph.node(id).expect("node should exist"));
        assert_eq!(strategy("design"), AiStrategy::Delegated);
        assert_eq!(strategy("copy"), AiStrategy::Deterministic);
        assert_eq!(strategy("pinned"), AiStrategy::Deterministic);
        assert_eq!(strategy("plain"), AiStrategy::Deterministic);
    }

    #[test]
    fn resolve_run_mode_expected_applies_unless_node_overrides() {
        let graph = parse_graph_str(GRAPH, None).expect("graph should load");
        let delegated = graph.ai_policy().clone().with_run_mode(AiRunMode::Delegated);
        assert_eq!(
            delegated.resolve(graph.node("plain").expect("plain")),
            AiStrategy::Delegated
        );
        assert_eq!(
            delegated.resolve(graph.node("pinned").expect("pinned")),
            AiStrategy::Deterministic
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn ai_task_delegated_expected_single_request_with_capability() {
        let graph = parse_graph_str(GRAPH, None).expect("graph should load");
        let planner = Arc::new(RecordingPlanner::default());
        let handler = AiTaskHandler::default().with_planner(planner.clone());

        let outcome = handler
            .execute(
                graph.node("design").expect("design"),
                &context(graph.ai_policy().clone()),
            )
            .await
            .expect("execution should succeed");

        assert!(outcome.is_success());
        assert_eq!(outcome.artifacts, vec!["layout.fig".to_string()]);
        assert_eq!(outcome.metadata["ai_strategy"], "delegated");
        let requests = planner.requests.lock().expect("requests mutex should lock");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].capability_request["task"], "layout");
        assert_eq!(requests[0].policy_context.role.as_deref(), Some("designer"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn ai_task_deterministic_expected_declared_artifacts() {
        let graph = parse_graph_str(GRAPH, None).expect("graph should load");
        let outcome = AiTaskHandler::default()
            .execute(
                graph.node("copy").expect("copy"),
                &context(graph.ai_policy().clone()),
            )
            .await
            .expect("execution should succeed");
        assert!(outcome.is_success());
        assert_eq!(outcome.artifacts, vec!["copy.md".to_string()]);
        assert_eq!(outcome.metadata["ai_strategy"], "deterministic");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn ai_task_delegated_without_planner_expected_collaborator_unavailable() {
        let graph = parse_graph_str(GRAPH, None).expect("graph should load");
        let outcome = AiTaskHandler::default()
            .execute(
                graph.node("design").expect("design"),
                &context(graph.ai_policy().clone()),
            )
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.error_kind, Some(ErrorKind::CollaboratorUnavailable));
    }
}
