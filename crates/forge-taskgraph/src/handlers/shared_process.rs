use crate::{
    ErrorKind, ExecutionContext, Node, Outcome, ProcessLifecycleError, SharedProcessSpec,
    TaskGraphError, handlers::NodeHandler,
};
use async_trait::async_trait;
use serde_json::Value;

pub const OWNERSHIP_METADATA_KEY: &str = "process_ownership";
pub const PROCESS_NAME_METADATA_KEY: &str = "process_name";
pub const PROCESS_PID_METADATA_KEY: &str = "process_pid";

/// Ensures the backing process described by `params` is up.
#[derive(Debug, Default)]
pub struct SharedProcessHandler;

#[async_trait]
impl NodeHandler for SharedProcessHandler {
    async fn execute(
        &self,
        node: &Node,
        context: &ExecutionContext,
    ) -> Result<Outcome, TaskGraphError> {
        let spec: SharedProcessSpec = match serde_json::from_value(node.params.clone()) {
            Ok(spec) => spec,
            Err(error) => {
                return Ok(Outcome::failure(
                    ErrorKind::Validation,
                    format!("node '{}' has invalid shared process params: {error}", node.id),
                ));
            }
        };
        match context.processes.ensure(&context.run_id, &spec).await {
            Ok(lease) => {
                let mut outcome = Outcome::success()
                    .with_metadata(
                        OWNERSHIP_METADATA_KEY,
                        Value::String(lease.ownership.as_str().to_string()),
                    )
                    .with_metadata(PROCESS_NAME_METADATA_KEY, Value::String(lease.name));
                if let Some(pid) = lease.pid {
                    outcome = outcome.with_metadata(PROCESS_PID_METADATA_KEY, Value::from(pid));
                }
                Ok(outcome)
            }
            Err(error @ ProcessLifecycleError::InvalidSpec(_)) => {
                Ok(Outcome::failure(ErrorKind::Validation, error.to_string()))
            }
            Err(error) => Ok(Outcome::failure(ErrorKind::ProcessLifecycle, error.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AiDispatchPolicy, HealthCheck, HealthProbe, ProcessLifecycleManager, parse_graph_str,
    };
    use std::collections::BTreeMap;
    use std::sync::Arc;

    struct AlwaysHealthy;

    #[async_trait]
    impl HealthProbe for AlwaysHealthy {
        async fn is_healthy(&self, _check: &HealthCheck) -> bool {
            true
        }
    }

    fn context(processes: Arc<ProcessLifecycleManager>) -> ExecutionContext {
        ExecutionContext {
            run_id: "run-1".to_string(),
            project_id: "p".to_string(),
            attempt: 1,
            upstream_artifacts: BTreeMap::new(),
            ai_policy: AiDispatchPolicy::default(),
            processes,
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn shared_process_healthy_expected_reused_metadata() {
        let graph = parse_graph_str(
            r#"
project_id: p
nodes:
  - id: api
    kind: shared-process
    params: { name: api, command: [/nonexistent/api], health: { tcp: "127.0.0.1:9" } }
"#,
            None,
        )
        .expect("graph should load");
        let processes = Arc::new(ProcessLifecycleManager::new(Arc::new(AlwaysHealthy)));

        let outcome = SharedProcessHandler
            .execute(graph.node("api").expect("api"), &context(processes))
            .await
            .expect("execution should succeed");

        assert!(outcome.is_success());
        assert_eq!(outcome.metadata[OWNERSHIP_METADATA_KEY], "reused");
        assert_eq!(outcome.metadata[PROCESS_NAME_METADATA_KEY], "api");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn shared_process_bad_params_expected_validation_failure() {
        let graph = parse_graph_str(
            "project_id: p\nnodes:\n  - { id: api, kind: shared-process, params: { name: api } }\n",
            None,
        )
        .expect("graph should load");
        let processes = Arc::new(ProcessLifecycleManager::new(Arc::new(AlwaysHealthy)));

        let outcome = SharedProcessHandler
            .execute(graph.node("api").expect("api"), &context(processes))
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.error_kind, Some(ErrorKind::Validation));
    }
}
