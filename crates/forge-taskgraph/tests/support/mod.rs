#![allow(dead_code)]

use async_trait::async_trait;
use forge_taskgraph::{
    ErrorKind, ExecutionContext, Graph, MemoryStateStore, Node, NodeHandler, Outcome, RunConfig,
    RuntimeEvent, RuntimeEventSink, SharedRuntimeEventObserver, TaskGraphError, parse_graph_str,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, sleep};

#[derive(Clone, Debug)]
pub enum Step {
    Succeed,
    Fail(ErrorKind),
    /// Sleep, then succeed.
    Work(u64),
    /// Never finishes on its own.
    Hang,
}

/// Counters shared with the test body.
#[derive(Default)]
pub struct Probe {
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub overlaps: AtomicUsize,
    pub started: Mutex<Vec<String>>,
    pub finished: Mutex<Vec<String>>,
    per_resource: Mutex<BTreeMap<String, usize>>,
}

impl Probe {
    pub fn started(&self) -> Vec<String> {
        self.started.lock().expect("probe mutex").clone()
    }

    pub fn calls(&self, node_id: &str) -> usize {
        self.started()
            .iter()
            .filter(|started| started.as_str() == node_id)
            .count()
    }
}

struct ActiveGuard<'a> {
    probe: &'a Probe,
    resources: Vec<String>,
}

impl<'a> ActiveGuard<'a> {
    fn enter(probe: &'a Probe, node: &Node) -> Self {
        probe.started.lock().expect("probe mutex").push(node.id.clone());
        let active = probe.active.fetch_add(1, Ordering::SeqCst) + 1;
        probe.max_active.fetch_max(active, Ordering::SeqCst);
        let mut per_resource = probe.per_resource.lock().expect("probe mutex");
        for resource in &node.resources {
            let holders = per_resource.entry(resource.clone()).or_default();
            *holders += 1;
            if *holders > 1 {
                probe.overlaps.fetch_add(1, Ordering::SeqCst);
            }
        }
        Self {
            probe,
            resources: node.resources.clone(),
        }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.probe.active.fetch_sub(1, Ordering::SeqCst);
        let mut per_resource = self.probe.per_resource.lock().expect("probe mutex");
        for resource in &self.resources {
            if let Some(holders) = per_resource.get_mut(resource) {
                *holders = holders.saturating_sub(1);
            }
        }
    }
}

/// Executes each node according to a per-node queue of steps. Nodes without
/// a script (or with an exhausted one) run `default_step`.
pub struct ScriptedExecutor {
    scripts: Mutex<BTreeMap<String, VecDeque<Step>>>,
    default_step: Step,
    pub probe: Arc<Probe>,
}

impl ScriptedExecutor {
    pub fn new(default_step: Step) -> Self {
        Self {
            scripts: Mutex::new(BTreeMap::new()),
            default_step,
            probe: Arc::new(Probe::default()),
        }
    }

    pub fn script(self, node_id: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .expect("scripts mutex")
            .insert(node_id.to_string(), steps.into());
        self
    }

    fn next_step(&self, node_id: &str) -> Step {
        self.scripts
            .lock()
            .expect("scripts mutex")
            .get_mut(node_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.default_step.clone())
    }
}

#[async_trait]
impl NodeHandler for ScriptedExecutor {
    async fn execute(
        &self,
        node: &Node,
        _context: &ExecutionContext,
    ) -> Result<Outcome, TaskGraphError> {
        let step = self.next_step(&node.id);
        let guard = ActiveGuard::enter(&self.probe, node);
        let outcome = match step {
            Step::Succeed => Outcome::success().with_artifacts([format!("{}.out", node.id)]),
            Step::Fail(kind) => Outcome::failure(kind, format!("{} scripted failure", node.id)),
            Step::Work(ms) => {
                sleep(Duration::from_millis(ms)).await;
                Outcome::success().with_artifacts([format!("{}.out", node.id)])
            }
            Step::Hang => {
                std::future::pending::<()>().await;
                Outcome::success()
            }
        };
        drop(guard);
        self.probe
            .finished
            .lock()
            .expect("probe mutex")
            .push(node.id.clone());
        Ok(outcome)
    }
}

pub fn graph(yaml: &str) -> Graph {
    parse_graph_str(yaml, None).expect("graph should load")
}

pub fn recording_sink() -> (RuntimeEventSink, Arc<Mutex<Vec<RuntimeEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&events);
    let observer: SharedRuntimeEventObserver = Arc::new(move |event: &RuntimeEvent| {
        captured.lock().expect("events mutex").push(event.clone());
    });
    (RuntimeEventSink::with_observer(observer), events)
}

pub fn config(
    run_id: &str,
    executor: Arc<ScriptedExecutor>,
    store: Arc<MemoryStateStore>,
) -> RunConfig {
    RunConfig {
        run_id: Some(run_id.to_string()),
        store,
        executor,
        ..RunConfig::default()
    }
}
