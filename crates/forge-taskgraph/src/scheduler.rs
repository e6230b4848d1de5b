//! Event loop that drives one run of a task graph to a settled state.

use crate::handlers::shared_process::{
    OWNERSHIP_METADATA_KEY, PROCESS_NAME_METADATA_KEY, PROCESS_PID_METADATA_KEY,
};
use crate::{
    AiDispatchPolicy, CancellationSignal, ErrorKind, ExecutionContext, Graph, LockEvent, Node,
    NodeError, NodeEvent, NodeExecutor, NodeKind, NodeStatus, Outcome, ProcessEvent,
    RetryController, RetryDecision, RunConfig, RunEvent, RunOutcome, RunReport, RunState,
    RunStatus, RuntimeEvent, RuntimeEventKind, StateEvent, TaskGraphError, propagate_skips,
    reconcile, timestamp_now,
};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Poll interval while waiting on locks held by another run.
const FOREIGN_LOCK_POLL: Duration = Duration::from_millis(50);

pub struct Scheduler {
    graph: Arc<Graph>,
    config: RunConfig,
}

impl Scheduler {
    pub fn new(graph: Graph, config: RunConfig) -> Self {
        Self {
            graph: Arc::new(graph),
            config,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Starts a fresh run. Fails if the store already holds this run id.
    pub async fn run(self) -> Result<RunReport, TaskGraphError> {
        let run_id = self
            .config
            .run_id
            .clone()
            .unwrap_or_else(|| format!("run-{}", Uuid::new_v4()));
        if self.config.store.load(&run_id).await?.is_some() {
            return Err(TaskGraphError::StateExists(run_id));
        }

        let state = RunState::new(run_id.clone(), &self.graph);
        let mut context = RunContext::new(self.graph, self.config, state, false);
        info!(
            run_id = run_id.as_str(),
            graph_id = context.graph.project_id(),
            nodes = context.graph.nodes().len(),
            concurrency = context.graph.concurrency(),
            "run started"
        );
        context.emit(RuntimeEventKind::Run(RunEvent::Started {
            run_id: run_id.clone(),
            graph_id: context.graph.project_id().to_string(),
            node_count: context.graph.nodes().len(),
        }));
        context.persist().await?;
        context.drive().await
    }

    /// Continues a persisted run under the same run id.
    pub async fn resume(self) -> Result<RunReport, TaskGraphError> {
        let run_id = self.config.run_id.clone().ok_or_else(|| {
            TaskGraphError::Runtime("resume requires an explicit run id".to_string())
        })?;
        let mut state = self
            .config
            .store
            .load(&run_id)
            .await?
            .ok_or_else(|| TaskGraphError::StateNotFound(run_id.clone()))?;
        // A finished run is a historical record; report it without touching it.
        if matches!(
            state.status,
            RunStatus::Succeeded | RunStatus::PartiallyFailed
        ) {
            state.check_matches(&self.graph)?;
            info!(run_id = run_id.as_str(), "run already finished; nothing to resume");
            let outcome = settled_outcome(&state);
            return Ok(RunReport {
                run_id,
                graph_id: state.graph_id,
                outcome,
                nodes: state.nodes,
                dispatch_order: Vec::new(),
                resumed: true,
            });
        }
        let retry = RetryController::new(
            Arc::clone(&self.config.classifier),
            self.config.retry.clone(),
        );
        let reconciled = reconcile(&mut state, &self.graph, &retry)?;

        let mut context = RunContext::new(self.graph, self.config, state, true);
        for (node_id, delay_ms) in &reconciled.requeued {
            if *delay_ms > 0 {
                context
                    .backoff
                    .insert(node_id.clone(), deadline_after(*delay_ms));
            }
        }
        context.emit(RuntimeEventKind::Run(RunEvent::Resumed {
            run_id: run_id.clone(),
            graph_id: context.graph.project_id().to_string(),
            resume_count: context.state.resume_count,
            interrupted: reconciled.interrupted.clone(),
        }));
        for node_id in &reconciled.interrupted {
            let attempt = context
                .state
                .node(node_id)
                .map(|node| node.attempt_count)
                .unwrap_or_default();
            context.emit(RuntimeEventKind::Node(NodeEvent::Interrupted {
                run_id: run_id.clone(),
                node_id: node_id.clone(),
                attempt,
            }));
        }
        for node_id in &reconciled.skipped {
            let failed_ancestor = context
                .state
                .node(node_id)
                .and_then(|node| node.skipped_because.clone())
                .unwrap_or_default();
            context.emit(RuntimeEventKind::Node(NodeEvent::Skipped {
                run_id: run_id.clone(),
                node_id: node_id.clone(),
                failed_ancestor,
            }));
        }
        context.persist().await?;
        context.drive().await
    }
}

struct Completion {
    node_id: String,
    attempt: u32,
    outcome: Outcome,
}

enum Wake {
    Joined(Option<Result<Completion, tokio::task::JoinError>>),
    BackoffElapsed,
    Cancelled,
    LockReleased,
}

/// Everything one run owns while it is being driven.
struct RunContext {
    graph: Arc<Graph>,
    config: RunConfig,
    retry: RetryController,
    ai_policy: AiDispatchPolicy,
    state: RunState,
    running: BTreeSet<String>,
    /// node id -> resources granted for its current attempt
    held: BTreeMap<String, Vec<String>>,
    backoff: BTreeMap<String, Instant>,
    contended: BTreeMap<String, String>,
    in_flight: JoinSet<Completion>,
    dispatch_order: Vec<String>,
    sequence_no: u64,
    saves: u64,
    foreign_blocked: bool,
    resumed: bool,
    cancellation: CancellationSignal,
}

impl RunContext {
    fn new(graph: Arc<Graph>, config: RunConfig, state: RunState, resumed: bool) -> Self {
        let retry = RetryController::new(Arc::clone(&config.classifier), config.retry.clone());
        let mut ai_policy = graph.ai_policy().clone();
        if let Some(mode) = config.ai_mode {
            ai_policy = ai_policy.with_run_mode(mode);
        }
        let cancellation = config.cancellation.clone();
        Self {
            graph,
            config,
            retry,
            ai_policy,
            state,
            running: BTreeSet::new(),
            held: BTreeMap::new(),
            backoff: BTreeMap::new(),
            contended: BTreeMap::new(),
            in_flight: JoinSet::new(),
            dispatch_order: Vec::new(),
            sequence_no: 0,
            saves: 0,
            foreign_blocked: false,
            resumed,
            cancellation,
        }
    }

    fn run_id(&self) -> String {
        self.state.run_id.clone()
    }

    /// Lock holder token; node ids alone are not unique across runs.
    fn holder_key(&self, node_id: &str) -> String {
        format!("{}/{}", self.state.run_id, node_id)
    }

    async fn drive(mut self) -> Result<RunReport, TaskGraphError> {
        match self.drive_loop().await {
            Ok(report) => Ok(report),
            Err(error) => {
                self.teardown_after_error().await;
                Err(error)
            }
        }
    }

    async fn drive_loop(&mut self) -> Result<RunReport, TaskGraphError> {
        loop {
            if self.cancellation.is_cancelled() {
                return self.cancel().await;
            }
            self.dispatch_ready().await?;

            let has_pending = self.state.count(NodeStatus::Pending) > 0;
            if self.running.is_empty() && !has_pending {
                return self.finish().await;
            }

            let next_deadline = self.backoff.values().min().copied();
            if self.running.is_empty() && next_deadline.is_none() && !self.foreign_blocked {
                let stuck: Vec<String> = self
                    .state
                    .nodes
                    .iter()
                    .filter(|(_, node)| node.status == NodeStatus::Pending)
                    .map(|(id, _)| id.clone())
                    .collect();
                return Err(TaskGraphError::Runtime(format!(
                    "run '{}' stalled with pending nodes {}",
                    self.state.run_id,
                    stuck.join(", ")
                )));
            }

            let arbiter = Arc::clone(&self.config.arbiter);
            let foreign_blocked = self.foreign_blocked;
            let wake = tokio::select! {
                joined = self.in_flight.join_next(), if !self.in_flight.is_empty() => Wake::Joined(joined),
                _ = sleep_until(next_deadline.unwrap_or_else(Instant::now)), if next_deadline.is_some() => Wake::BackoffElapsed,
                _ = self.cancellation.cancelled() => Wake::Cancelled,
                _ = arbiter.released(), if foreign_blocked => Wake::LockReleased,
                _ = sleep(FOREIGN_LOCK_POLL), if foreign_blocked => Wake::LockReleased,
            };

            match wake {
                Wake::Joined(Some(Ok(completion))) => self.complete(completion).await?,
                Wake::Joined(Some(Err(error))) => {
                    return Err(TaskGraphError::Runtime(format!(
                        "node task failed to join: {error}"
                    )));
                }
                Wake::Joined(None) => {}
                Wake::BackoffElapsed => {
                    let now = Instant::now();
                    self.backoff.retain(|_, deadline| *deadline > now);
                }
                Wake::Cancelled => return self.cancel().await,
                Wake::LockReleased => {}
            }
        }
    }

    /// Starts every ready node, in id order, up to the concurrency bound.
    async fn dispatch_ready(&mut self) -> Result<(), TaskGraphError> {
        self.foreign_blocked = false;
        let concurrency = self.graph.concurrency().max(1);
        let now = Instant::now();
        let pending: Vec<String> = self
            .state
            .nodes
            .iter()
            .filter(|(_, node)| node.status == NodeStatus::Pending)
            .map(|(id, _)| id.clone())
            .collect();

        for node_id in pending {
            if self.running.len() >= concurrency {
                break;
            }
            if self
                .backoff
                .get(&node_id)
                .is_some_and(|deadline| *deadline > now)
            {
                continue;
            }
            let Some(node) = self.graph.node(&node_id).cloned() else {
                continue;
            };
            let requirements_met = node
                .requires
                .iter()
                .all(|required| self.state.status_of(required) == Some(NodeStatus::Success));
            if !requirements_met {
                continue;
            }

            let holder_key = self.holder_key(&node_id);
            if let Err(conflict) = self.config.arbiter.try_acquire(&holder_key, &node.resources) {
                let own_prefix = format!("{}/", self.state.run_id);
                let holder = match conflict.holder.strip_prefix(own_prefix.as_str()) {
                    Some(own_node) => own_node.to_string(),
                    None => {
                        self.foreign_blocked = true;
                        conflict.holder.clone()
                    }
                };
                if self.contended.get(&node_id) != Some(&conflict.resource) {
                    debug!(
                        node_id = node_id.as_str(),
                        resource = conflict.resource.as_str(),
                        holder = holder.as_str(),
                        "node waiting on resource lock"
                    );
                    self.contended
                        .insert(node_id.clone(), conflict.resource.clone());
                    self.emit(RuntimeEventKind::Lock(LockEvent::Contended {
                        run_id: self.run_id(),
                        node_id: node_id.clone(),
                        resource: conflict.resource,
                        holder,
                    }));
                }
                continue;
            }
            self.contended.remove(&node_id);
            self.backoff.remove(&node_id);
            self.start(node).await?;
        }
        Ok(())
    }

    async fn start(&mut self, node: Node) -> Result<(), TaskGraphError> {
        let now = timestamp_now();
        let attempt = {
            let node_state = self.state.node_mut(&node.id)?;
            node_state.status = NodeStatus::Running;
            node_state.attempt_count += 1;
            node_state.started_at = Some(now);
            node_state.ended_at = None;
            node_state.retry_pending = false;
            node_state.attempt_count
        };
        if !node.resources.is_empty() {
            self.held.insert(node.id.clone(), node.resources.clone());
            self.emit(RuntimeEventKind::Lock(LockEvent::Acquired {
                run_id: self.run_id(),
                node_id: node.id.clone(),
                resources: node.resources.clone(),
            }));
        }
        self.sync_locks();
        self.running.insert(node.id.clone());
        self.dispatch_order.push(node.id.clone());
        info!(
            run_id = self.state.run_id.as_str(),
            node_id = node.id.as_str(),
            kind = node.kind.as_str(),
            attempt,
            "node started"
        );
        self.emit(RuntimeEventKind::Node(NodeEvent::Started {
            run_id: self.run_id(),
            node_id: node.id.clone(),
            node_kind: node.kind.as_str().to_string(),
            attempt,
        }));
        self.persist().await?;

        let context = ExecutionContext {
            run_id: self.run_id(),
            project_id: self.graph.project_id().to_string(),
            attempt,
            upstream_artifacts: node
                .requires
                .iter()
                .map(|required| {
                    let artifacts = self
                        .state
                        .node(required)
                        .map(|state| state.artifacts.clone())
                        .unwrap_or_default();
                    (required.clone(), artifacts)
                })
                .collect(),
            ai_policy: self.ai_policy.clone(),
            processes: Arc::clone(&self.config.processes),
        };
        let executor = Arc::clone(&self.config.executor);
        self.in_flight
            .spawn(execute_node(executor, node, context, attempt));
        Ok(())
    }

    async fn complete(&mut self, completion: Completion) -> Result<(), TaskGraphError> {
        let Completion {
            node_id,
            attempt,
            outcome,
        } = completion;
        self.running.remove(&node_id);
        if let Some(resources) = self.held.remove(&node_id) {
            self.config.arbiter.release(&self.holder_key(&node_id));
            self.emit(RuntimeEventKind::Lock(LockEvent::Released {
                run_id: self.run_id(),
                node_id: node_id.clone(),
                resources,
            }));
        }
        self.sync_locks();

        let node = self.graph.node(&node_id).cloned().ok_or_else(|| {
            TaskGraphError::Runtime(format!("completed node '{node_id}' is not in the graph"))
        })?;
        if node.kind == NodeKind::SharedProcess && outcome.is_success() {
            self.emit_process_event(&outcome);
        }

        let now = timestamp_now();
        match self.retry.decide(&node, attempt, &outcome) {
            RetryDecision::Succeeded => {
                let node_state = self.state.node_mut(&node_id)?;
                node_state.status = NodeStatus::Success;
                node_state.ended_at = Some(now);
                node_state.artifacts = outcome.artifacts.clone();
                node_state.last_error = None;
                info!(
                    run_id = self.state.run_id.as_str(),
                    node_id = node_id.as_str(),
                    attempt,
                    "node succeeded"
                );
                self.emit(RuntimeEventKind::Node(NodeEvent::Succeeded {
                    run_id: self.run_id(),
                    node_id: node_id.clone(),
                    attempt,
                    artifacts: outcome.artifacts,
                }));
                self.persist().await?;
            }
            RetryDecision::Retry {
                delay_ms,
                next_attempt,
            } => {
                let error = node_error(&outcome);
                {
                    let node_state = self.state.node_mut(&node_id)?;
                    node_state.status = NodeStatus::Failed;
                    node_state.ended_at = Some(now);
                    node_state.last_error = Some(error.clone());
                    node_state.retry_pending = true;
                }
                warn!(
                    run_id = self.state.run_id.as_str(),
                    node_id = node_id.as_str(),
                    attempt,
                    error_kind = error.kind.as_str(),
                    delay_ms,
                    "node failed; retrying"
                );
                self.emit(RuntimeEventKind::Node(NodeEvent::Failed {
                    run_id: self.run_id(),
                    node_id: node_id.clone(),
                    attempt,
                    error_kind: error.kind.as_str().to_string(),
                    message: Some(error.message.clone()),
                    will_retry: true,
                }));
                self.persist().await?;

                {
                    let node_state = self.state.node_mut(&node_id)?;
                    node_state.status = NodeStatus::Pending;
                    node_state.retry_pending = false;
                }
                if delay_ms > 0 {
                    self.backoff.insert(node_id.clone(), deadline_after(delay_ms));
                }
                self.emit(RuntimeEventKind::Node(NodeEvent::Retrying {
                    run_id: self.run_id(),
                    node_id: node_id.clone(),
                    attempt,
                    next_attempt,
                    delay_ms,
                }));
                self.persist().await?;
            }
            RetryDecision::Fail { reason } => {
                let error = node_error(&outcome);
                {
                    let node_state = self.state.node_mut(&node_id)?;
                    node_state.status = NodeStatus::Failed;
                    node_state.ended_at = Some(now);
                    node_state.last_error = Some(error.clone());
                    node_state.retry_pending = false;
                }
                warn!(
                    run_id = self.state.run_id.as_str(),
                    node_id = node_id.as_str(),
                    attempt,
                    error_kind = error.kind.as_str(),
                    reason = reason.as_str(),
                    "node failed"
                );
                self.emit(RuntimeEventKind::Node(NodeEvent::Failed {
                    run_id: self.run_id(),
                    node_id: node_id.clone(),
                    attempt,
                    error_kind: error.kind.as_str().to_string(),
                    message: Some(error.message),
                    will_retry: false,
                }));
                let skipped = propagate_skips(&mut self.state, &self.graph, &node_id);
                for skipped_id in skipped {
                    self.backoff.remove(&skipped_id);
                    self.contended.remove(&skipped_id);
                    self.emit(RuntimeEventKind::Node(NodeEvent::Skipped {
                        run_id: self.run_id(),
                        node_id: skipped_id,
                        failed_ancestor: node_id.clone(),
                    }));
                }
                self.persist().await?;
            }
        }
        Ok(())
    }

    fn emit_process_event(&mut self, outcome: &Outcome) {
        let name = outcome
            .metadata
            .get(PROCESS_NAME_METADATA_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let kind = match outcome
            .metadata
            .get(OWNERSHIP_METADATA_KEY)
            .and_then(Value::as_str)
        {
            Some("started") => ProcessEvent::Started {
                run_id: self.run_id(),
                name,
                pid: outcome
                    .metadata
                    .get(PROCESS_PID_METADATA_KEY)
                    .and_then(Value::as_u64)
                    .and_then(|pid| u32::try_from(pid).ok()),
            },
            _ => ProcessEvent::Reused {
                run_id: self.run_id(),
                name,
            },
        };
        self.emit(RuntimeEventKind::Process(kind));
    }

    async fn finish(&mut self) -> Result<RunReport, TaskGraphError> {
        self.shutdown_processes().await;
        let succeeded = self.state.count(NodeStatus::Success);
        let failed = self.state.count(NodeStatus::Failed);
        let skipped = self.state.count(NodeStatus::Skipped);
        let outcome = settled_outcome(&self.state);
        self.state.status = match outcome {
            RunOutcome::Succeeded => RunStatus::Succeeded,
            _ => RunStatus::PartiallyFailed,
        };
        info!(
            run_id = self.state.run_id.as_str(),
            succeeded,
            failed,
            skipped,
            "run completed"
        );
        self.emit(RuntimeEventKind::Run(RunEvent::Completed {
            run_id: self.run_id(),
            graph_id: self.state.graph_id.clone(),
            succeeded,
            failed,
            skipped,
        }));
        self.persist().await?;
        Ok(self.report(outcome))
    }

    /// Stops in-flight work and persists a state `resume` can pick up.
    /// Running nodes stay `running` on disk.
    async fn cancel(&mut self) -> Result<RunReport, TaskGraphError> {
        let running: Vec<String> = self.running.iter().cloned().collect();
        warn!(
            run_id = self.state.run_id.as_str(),
            running = running.len(),
            "run cancelled"
        );
        self.in_flight.abort_all();
        while self.in_flight.join_next().await.is_some() {}
        self.release_all_locks();
        self.state.status = RunStatus::Cancelled;
        self.emit(RuntimeEventKind::Run(RunEvent::Cancelled {
            run_id: self.run_id(),
            graph_id: self.state.graph_id.clone(),
            running,
        }));
        self.persist().await?;
        self.shutdown_processes().await;
        Ok(self.report(RunOutcome::Cancelled))
    }

    async fn teardown_after_error(&mut self) {
        self.in_flight.abort_all();
        while self.in_flight.join_next().await.is_some() {}
        self.release_all_locks();
        self.shutdown_processes().await;
    }

    fn release_all_locks(&mut self) {
        let held = std::mem::take(&mut self.held);
        for (node_id, resources) in held {
            self.config.arbiter.release(&self.holder_key(&node_id));
            self.emit(RuntimeEventKind::Lock(LockEvent::Released {
                run_id: self.run_id(),
                node_id,
                resources,
            }));
        }
        self.sync_locks();
    }

    async fn shutdown_processes(&mut self) {
        let stopped = self
            .config
            .processes
            .shutdown_owned(&self.state.run_id)
            .await;
        for name in stopped {
            self.emit(RuntimeEventKind::Process(ProcessEvent::Stopped {
                run_id: self.run_id(),
                name,
            }));
        }
    }

    fn sync_locks(&mut self) {
        self.state.locks = self
            .held
            .iter()
            .flat_map(|(node_id, resources)| {
                resources
                    .iter()
                    .map(move |resource| (resource.clone(), node_id.clone()))
            })
            .collect();
    }

    async fn persist(&mut self) -> Result<(), TaskGraphError> {
        self.state.touch();
        self.config.store.save(&self.state).await?;
        self.saves += 1;
        self.emit(RuntimeEventKind::State(StateEvent::Saved {
            run_id: self.run_id(),
            sequence_no: self.saves,
        }));
        Ok(())
    }

    fn emit(&mut self, kind: RuntimeEventKind) {
        self.sequence_no += 1;
        if !self.config.events.is_enabled() {
            return;
        }
        self.config.events.emit(RuntimeEvent {
            sequence_no: self.sequence_no,
            timestamp: timestamp_now(),
            kind,
        });
    }

    fn report(&self, outcome: RunOutcome) -> RunReport {
        RunReport {
            run_id: self.state.run_id.clone(),
            graph_id: self.state.graph_id.clone(),
            outcome,
            nodes: self.state.nodes.clone(),
            dispatch_order: self.dispatch_order.clone(),
            resumed: self.resumed,
        }
    }
}

/// Backoff deadlines further out than `Instant` can represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(delay_ms: u64) -> Instant {
    let now = Instant::now();
    now.checked_add(Duration::from_millis(delay_ms))
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

fn settled_outcome(state: &RunState) -> RunOutcome {
    let succeeded = state.count(NodeStatus::Success);
    let failed = state.count(NodeStatus::Failed);
    let skipped = state.count(NodeStatus::Skipped);
    if failed == 0 && skipped == 0 {
        RunOutcome::Succeeded
    } else {
        RunOutcome::PartiallyFailed {
            succeeded,
            failed,
            skipped,
        }
    }
}

fn node_error(outcome: &Outcome) -> NodeError {
    let kind = outcome.error_kind.clone().unwrap_or(ErrorKind::Unknown);
    let message = outcome
        .message
        .clone()
        .unwrap_or_else(|| kind.as_str().to_string());
    NodeError { kind, message }
}

/// One attempt of one node, bounded by its timeout. Panics become outcomes.
async fn execute_node(
    executor: Arc<dyn NodeExecutor>,
    node: Node,
    context: ExecutionContext,
    attempt: u32,
) -> Completion {
    let limit = Duration::from_millis(node.timeout_ms);
    let invocation = AssertUnwindSafe(tokio::time::timeout(
        limit,
        executor.execute(&node, &context),
    ))
    .catch_unwind()
    .await;
    let outcome = match invocation {
        Ok(Ok(Ok(outcome))) => outcome,
        Ok(Ok(Err(error))) => Outcome::from_error(&error),
        Ok(Err(_elapsed)) => Outcome::failure(
            ErrorKind::Timeout,
            format!("node '{}' exceeded its {}ms timeout", node.id, node.timeout_ms),
        ),
        Err(payload) => Outcome::failure(ErrorKind::Panicked, panic_message(payload.as_ref())),
    };
    Completion {
        node_id: node.id,
        attempt,
        outcome,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return format!("executor panicked: {message}");
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return format!("executor panicked: {message}");
    }
    "executor panicked".to_string()
}
