use crate::process::ProcessGroupGuard;
use crate::{
    ErrorKind, ExecutionContext, Node, NodeKind, Outcome, TaskGraphError, handlers::NodeHandler,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

const MESSAGE_TAIL_CHARS: usize = 2_000;

/// What a collaborator receives for one node attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollaboratorRequest {
    pub run_id: String,
    pub project_id: String,
    pub node_id: String,
    pub node_kind: NodeKind,
    pub attempt: u32,
    pub params: Value,
    #[serde(default)]
    pub upstream_artifacts: BTreeMap<String, Vec<String>>,
}

impl CollaboratorRequest {
    pub fn from_node(node: &Node, context: &ExecutionContext) -> Self {
        Self {
            run_id: context.run_id.clone(),
            project_id: context.project_id.clone(),
            node_id: node.id.clone(),
            node_kind: node.kind,
            attempt: context.attempt,
            params: node.params.clone(),
            upstream_artifacts: context.upstream_artifacts.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CollaboratorResponse {
    pub ok: bool,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl CollaboratorResponse {
    pub fn succeeded<I, S>(artifacts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ok: true,
            artifacts: artifacts.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn failed(error_kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error_kind: Some(error_kind.into()),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn into_outcome(self) -> Outcome {
        let outcome = if self.ok {
            Outcome::success().with_artifacts(self.artifacts)
        } else {
            let kind = ErrorKind::parse(self.error_kind.as_deref().unwrap_or_default());
            Outcome::failure(
                kind,
                self.message
                    .unwrap_or_else(|| "collaborator reported failure".to_string()),
            )
            .with_artifacts(self.artifacts)
        };
        self.metadata
            .into_iter()
            .fold(outcome, |outcome, (key, value)| outcome.with_metadata(key, value))
    }
}

/// External step executor: browser tests, audits, validators, packagers.
#[async_trait]
pub trait Collaborator: Send + Sync {
    async fn execute(
        &self,
        request: CollaboratorRequest,
    ) -> Result<CollaboratorResponse, TaskGraphError>;
}

pub type SharedCollaborator = Arc<dyn Collaborator>;

/// Runs `params.command` in its own process group.
///
/// `command` is either an argv array or a string run through `sh -c`.
/// Without a command the node succeeds and reports `params.artifacts`.
/// When the last non-empty stdout line is a JSON `CollaboratorResponse`,
/// that response wins over the exit status.
#[derive(Clone, Debug, Default)]
pub struct CommandCollaborator;

#[async_trait]
impl Collaborator for CommandCollaborator {
    async fn execute(
        &self,
        request: CollaboratorRequest,
    ) -> Result<CollaboratorResponse, TaskGraphError> {
        let declared = declared_artifacts(&request.params);
        let command = match command_from_params(&request.params) {
            Ok(Some(command)) => command,
            Ok(None) => return Ok(CollaboratorResponse::succeeded(declared)),
            Err(message) => {
                return Ok(CollaboratorResponse::failed(
                    ErrorKind::Validation.as_str(),
                    message,
                ));
            }
        };

        let mut env = string_map(request.params.get("env"));
        env.insert("FORGE_RUN_ID".to_string(), request.run_id.clone());
        env.insert("FORGE_PROJECT_ID".to_string(), request.project_id.clone());
        env.insert("FORGE_NODE_ID".to_string(), request.node_id.clone());
        env.insert("FORGE_ATTEMPT".to_string(), request.attempt.to_string());
        env.insert(
            "FORGE_UPSTREAM_ARTIFACTS".to_string(),
            serde_json::to_string(&request.upstream_artifacts).unwrap_or_default(),
        );
        let working_dir = request
            .params
            .get("working_dir")
            .and_then(Value::as_str)
            .map(PathBuf::from);

        let output = match run_command(&command, working_dir, &env).await {
            Ok(output) => output,
            Err(error) => {
                return Ok(CollaboratorResponse::failed(
                    ErrorKind::ProcessLaunch.as_str(),
                    format!("failed to launch '{}': {error}", command.join(" ")),
                ));
            }
        };
        debug!(
            node_id = request.node_id.as_str(),
            status = %output.status,
            "collaborator command finished"
        );

        if let Some(reported) = reported_response(&output.stdout) {
            return Ok(reported);
        }
        if output.status.success() {
            return Ok(CollaboratorResponse::succeeded(declared));
        }
        let failure_kind = match request.node_kind {
            NodeKind::ValidationGate => ErrorKind::Validation,
            _ => ErrorKind::CommandFailed,
        };
        Ok(CollaboratorResponse::failed(
            failure_kind.as_str(),
            format!("{}: {}", output.status, tail(&output.stderr)),
        ))
    }
}

pub struct CollaboratorHandler {
    collaborator: SharedCollaborator,
}

impl CollaboratorHandler {
    pub fn new(collaborator: SharedCollaborator) -> Self {
        Self { collaborator }
    }
}

impl Default for CollaboratorHandler {
    fn default() -> Self {
        Self::new(Arc::new(CommandCollaborator))
    }
}

#[async_trait]
impl NodeHandler for CollaboratorHandler {
    async fn execute(
        &self,
        node: &Node,
        context: &ExecutionContext,
    ) -> Result<Outcome, TaskGraphError> {
        let request = CollaboratorRequest::from_node(node, context);
        match self.collaborator.execute(request).await {
            Ok(response) => Ok(response.into_outcome()),
            Err(error) => Ok(Outcome::from_error(&error)),
        }
    }
}

pub(crate) struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Spawns `command` as a new process group leader. Dropping the returned
/// future kills the whole group.
pub(crate) async fn run_command(
    command: &[String],
    working_dir: Option<PathBuf>,
    env: &BTreeMap<String, String>,
) -> std::io::Result<CommandOutput> {
    let (program, args) = command.split_first().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command")
    })?;
    let mut process = Command::new(program);
    process
        .args(args)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = working_dir {
        process.current_dir(dir);
    }
    #[cfg(unix)]
    process.process_group(0);

    let child = process.spawn()?;
    let guard = ProcessGroupGuard::new(child.id());
    let output = child.wait_with_output().await;
    guard.disarm();
    let output = output?;
    Ok(CommandOutput {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

pub(crate) fn command_from_params(params: &Value) -> Result<Option<Vec<String>>, String> {
    match params.get("command") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(script)) if script.trim().is_empty() => Ok(None),
        Some(Value::String(script)) => Ok(Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            script.clone(),
        ])),
        Some(Value::Array(parts)) => {
            let argv: Option<Vec<String>> = parts
                .iter()
                .map(|part| part.as_str().map(str::to_string))
                .collect();
            match argv {
                Some(argv) if !argv.is_empty() => Ok(Some(argv)),
                Some(_) => Ok(None),
                None => Err("params.command must contain only strings".to_string()),
            }
        }
        Some(_) => Err("params.command must be a string or an array of strings".to_string()),
    }
}

pub(crate) fn declared_artifacts(params: &Value) -> Vec<String> {
    params
        .get("artifacts")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|object| {
            object
                .iter()
                .filter_map(|(key, value)| {
                    let value = match value {
                        Value::String(text) => text.clone(),
                        Value::Null => return None,
                        other => other.to_string(),
                    };
                    Some((key.clone(), value))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn reported_response(stdout: &str) -> Option<CollaboratorResponse> {
    let last = stdout.lines().rev().find(|line| !line.trim().is_empty())?;
    let trimmed = last.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

fn tail(text: &str) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= MESSAGE_TAIL_CHARS {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - MESSAGE_TAIL_CHARS).collect()
}
