use crate::{
    AiDispatchPolicy, AiRunMode, DefaultClassifier, ErrorKind, ExecutorSet, MemoryStateStore,
    Node, NodeState, ProcessLifecycleManager, ResourceArbiter, RetrySettings, RuntimeEventSink,
    SharedFailureClassifier, SharedStateStore, TaskGraphError,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failure,
}

/// Normalized result of one node invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub status: OutcomeStatus,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            status: OutcomeStatus::Success,
            artifacts: Vec::new(),
            error_kind: None,
            message: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failure,
            artifacts: Vec::new(),
            error_kind: Some(kind),
            message: Some(message.into()),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_artifacts<I, S>(mut self, artifacts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.artifacts.extend(artifacts.into_iter().map(Into::into));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    /// Maps an engine-side error raised by a handler onto a failure outcome.
    pub fn from_error(error: &TaskGraphError) -> Self {
        let kind = match error {
            TaskGraphError::ProcessLifecycle(_) => ErrorKind::ProcessLifecycle,
            TaskGraphError::Validation(_) | TaskGraphError::Parse(_) => ErrorKind::Validation,
            TaskGraphError::Io(_) => ErrorKind::ProcessLaunch,
            _ => ErrorKind::Unknown,
        };
        Self::failure(kind, error.to_string())
    }
}

/// Everything a handler may know about the invocation besides the node.
#[derive(Clone)]
pub struct ExecutionContext {
    pub run_id: String,
    pub project_id: String,
    pub attempt: u32,
    pub upstream_artifacts: BTreeMap<String, Vec<String>>,
    pub ai_policy: AiDispatchPolicy,
    pub processes: Arc<ProcessLifecycleManager>,
}

#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(
        &self,
        node: &Node,
        context: &ExecutionContext,
    ) -> Result<Outcome, TaskGraphError>;
}

#[derive(Clone)]
pub struct RunConfig {
    pub run_id: Option<String>,
    pub store: SharedStateStore,
    pub arbiter: Arc<ResourceArbiter>,
    pub processes: Arc<ProcessLifecycleManager>,
    pub executor: Arc<dyn NodeExecutor>,
    pub events: RuntimeEventSink,
    pub classifier: SharedFailureClassifier,
    pub retry: RetrySettings,
    /// Overrides the graph document's `ai.mode` when set.
    pub ai_mode: Option<AiRunMode>,
    pub cancellation: CancellationSignal,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            store: Arc::new(MemoryStateStore::new()),
            arbiter: Arc::new(ResourceArbiter::new()),
            processes: Arc::new(ProcessLifecycleManager::default()),
            executor: Arc::new(ExecutorSet::with_defaults()),
            events: RuntimeEventSink::default(),
            classifier: Arc::new(DefaultClassifier::new()),
            retry: RetrySettings::default(),
            ai_mode: None,
            cancellation: CancellationSignal::never(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    PartiallyFailed {
        succeeded: usize,
        failed: usize,
        skipped: usize,
    },
    Cancelled,
}

impl RunOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub graph_id: String,
    pub outcome: RunOutcome,
    pub nodes: BTreeMap<String, NodeState>,
    /// Node ids in the order they were dispatched by this process.
    pub dispatch_order: Vec<String>,
    pub resumed: bool,
}

#[derive(Clone, Debug)]
pub struct CancellationSignal {
    receiver: Option<watch::Receiver<bool>>,
}

#[derive(Debug)]
pub struct CancellationHandle {
    sender: watch::Sender<bool>,
}

pub fn cancellation_pair() -> (CancellationHandle, CancellationSignal) {
    let (sender, receiver) = watch::channel(false);
    (
        CancellationHandle { sender },
        CancellationSignal {
            receiver: Some(receiver),
        },
    )
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

impl CancellationSignal {
    pub fn never() -> Self {
        Self { receiver: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.receiver
            .as_ref()
            .is_some_and(|receiver| *receiver.borrow())
    }

    /// Resolves once cancellation has been requested. Never resolves for
    /// `never()` or when the handle is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        let Some(receiver) = self.receiver.as_mut() else {
            return std::future::pending().await;
        };
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

pub fn timestamp_now() -> String {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!(
        "{}.{:03}Z",
        since_epoch.as_secs(),
        since_epoch.subsec_millis()
    )
}
