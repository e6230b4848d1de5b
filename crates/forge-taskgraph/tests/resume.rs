mod support;

use forge_taskgraph::{
    ErrorKind, FsStateStore, MemoryStateStore, NodeEvent, NodeStatus, ResourceArbiter, RunConfig,
    RunOutcome, RunState, RunStatus, RuntimeEventKind, Scheduler, StateStore, TaskGraphError,
    cancellation_pair,
};
use std::sync::Arc;
use support::{ScriptedExecutor, Step, config, graph, recording_sink};
use tokio::time::{Duration, sleep};

const CHAIN: &str = r#"
project_id: chain
retry: { max_attempts: 2, backoff_ms: 10 }
nodes:
  - { id: a, kind: packaging }
  - { id: b, kind: test-runner, requires: [a], resources: [browser] }
  - { id: c, kind: reporting, requires: [b] }
"#;

fn crashed_state(yaml: &str) -> RunState {
    let mut state = RunState::new("run-1", &graph(yaml));
    let a = state.node_mut("a").expect("a");
    a.status = NodeStatus::Success;
    a.attempt_count = 1;
    a.artifacts = vec!["a.out".to_string()];
    let b = state.node_mut("b").expect("b");
    b.status = NodeStatus::Running;
    b.attempt_count = 1;
    b.started_at = Some("1.000Z".to_string());
    state.locks.insert("browser".to_string(), "b".to_string());
    state
}

#[tokio::test(flavor = "current_thread")]
async fn resume_after_crash_expected_interrupted_node_rerun_and_success_kept() {
    let store = Arc::new(MemoryStateStore::with_state(crashed_state(CHAIN)));
    let executor = Arc::new(ScriptedExecutor::new(Step::Succeed));
    let (events, captured) = recording_sink();

    let report = Scheduler::new(
        graph(CHAIN),
        RunConfig {
            events,
            ..config("run-1", executor.clone(), store.clone())
        },
    )
    .resume()
    .await
    .expect("resume should finish");

    assert!(report.resumed);
    assert_eq!(report.outcome, RunOutcome::Succeeded);
    assert_eq!(executor.probe.started(), vec!["b", "c"]);
    assert_eq!(report.nodes["a"].attempt_count, 1);
    assert_eq!(report.nodes["a"].artifacts, vec!["a.out".to_string()]);
    assert_eq!(report.nodes["b"].attempt_count, 2);

    let saved = store.latest("run-1").expect("state should be saved");
    assert_eq!(saved.resume_count, 1);
    assert!(saved.locks.is_empty());

    let interrupted = captured
        .lock()
        .expect("events mutex")
        .iter()
        .any(|event| {
            matches!(
                &event.kind,
                RuntimeEventKind::Node(NodeEvent::Interrupted { node_id, .. }) if node_id == "b"
            )
        });
    assert!(interrupted);
}

#[tokio::test(flavor = "current_thread")]
async fn resume_interrupted_without_attempts_left_expected_failed_and_skipped() {
    let yaml = CHAIN.replace("max_attempts: 2", "max_attempts: 1");
    let tmp = tempfile::tempdir().expect("tempdir should be created");
    let store = Arc::new(FsStateStore::new(tmp.path()).expect("store should initialize"));
    store
        .save(&crashed_state(&yaml))
        .await
        .expect("crashed state should save");
    let executor = Arc::new(ScriptedExecutor::new(Step::Succeed));

    let report = Scheduler::new(
        graph(&yaml),
        RunConfig {
            run_id: Some("run-1".to_string()),
            store: store.clone(),
            executor: executor.clone(),
            ..RunConfig::default()
        },
    )
    .resume()
    .await
    .expect("resume should finish");

    assert!(executor.probe.started().is_empty());
    assert_eq!(report.nodes["b"].status, NodeStatus::Failed);
    assert_eq!(
        report.nodes["b"].last_error.as_ref().map(|error| error.kind.clone()),
        Some(ErrorKind::Interrupted)
    );
    assert_eq!(report.nodes["c"].status, NodeStatus::Skipped);
    let on_disk = store
        .load("run-1")
        .await
        .expect("load should succeed")
        .expect("state should exist");
    assert_eq!(on_disk.status, RunStatus::PartiallyFailed);
}

#[tokio::test(flavor = "current_thread")]
async fn cancel_then_resume_expected_consistent_state_and_completion() {
    let yaml = CHAIN.replace("max_attempts: 2", "max_attempts: 3");
    let store = Arc::new(MemoryStateStore::new());
    let arbiter = Arc::new(ResourceArbiter::new());
    let hanging = Arc::new(ScriptedExecutor::new(Step::Succeed).script("b", vec![Step::Hang]));
    let (handle, signal) = cancellation_pair();

    let canceller = tokio::spawn(async move {
        sleep(Duration::from_millis(50)).await;
        handle.cancel();
    });
    let cancelled = Scheduler::new(
        graph(&yaml),
        RunConfig {
            arbiter: Arc::clone(&arbiter),
            cancellation: signal,
            ..config("run-1", hanging.clone(), store.clone())
        },
    )
    .run()
    .await
    .expect("cancelled run should still report");
    canceller.await.expect("canceller should finish");

    assert_eq!(cancelled.outcome, RunOutcome::Cancelled);
    assert!(arbiter.snapshot().is_empty());
    let saved = store.latest("run-1").expect("state should be saved");
    assert_eq!(saved.status, RunStatus::Cancelled);
    assert_eq!(saved.status_of("a"), Some(NodeStatus::Success));
    assert_eq!(saved.status_of("b"), Some(NodeStatus::Running));
    assert_eq!(saved.status_of("c"), Some(NodeStatus::Pending));
    assert!(saved.locks.is_empty());

    let finishing = Arc::new(ScriptedExecutor::new(Step::Succeed));
    let resumed = Scheduler::new(
        graph(&yaml),
        RunConfig {
            arbiter: Arc::clone(&arbiter),
            ..config("run-1", finishing.clone(), store.clone())
        },
    )
    .resume()
    .await
    .expect("resume should finish");

    assert_eq!(resumed.outcome, RunOutcome::Succeeded);
    assert_eq!(finishing.probe.started(), vec!["b", "c"]);
    assert_eq!(resumed.nodes["b"].attempt_count, 2);
}

#[tokio::test(flavor = "current_thread")]
async fn resume_with_changed_graph_expected_mismatch() {
    let store = Arc::new(MemoryStateStore::with_state(crashed_state(CHAIN)));
    let changed = CHAIN.replace("backoff_ms: 10", "backoff_ms: 20");

    let error = Scheduler::new(
        graph(&changed),
        config(
            "run-1",
            Arc::new(ScriptedExecutor::new(Step::Succeed)),
            store,
        ),
    )
    .resume()
    .await
    .expect_err("changed graph should not resume");
    assert!(matches!(error, TaskGraphError::ResumeMismatch { .. }));
}

#[tokio::test(flavor = "current_thread")]
async fn resume_unknown_run_expected_state_not_found() {
    let error = Scheduler::new(
        graph(CHAIN),
        config(
            "run-404",
            Arc::new(ScriptedExecutor::new(Step::Succeed)),
            Arc::new(MemoryStateStore::new()),
        ),
    )
    .resume()
    .await
    .expect_err("missing state should fail");
    assert!(matches!(error, TaskGraphError::StateNotFound(_)));
}

#[tokio::test(flavor = "current_thread")]
async fn resume_finished_run_expected_no_reexecution() {
    let store = Arc::new(MemoryStateStore::new());
    let first = Arc::new(ScriptedExecutor::new(Step::Succeed));
    Scheduler::new(graph(CHAIN), config("run-1", first, store.clone()))
        .run()
        .await
        .expect("run should finish");

    let before = store.latest("run-1").expect("state should be saved");
    let saves_before = store.history().len();

    let second = Arc::new(ScriptedExecutor::new(Step::Succeed));
    let (events, captured) = recording_sink();
    let report = Scheduler::new(
        graph(CHAIN),
        RunConfig {
            events,
            ..config("run-1", second.clone(), store.clone())
        },
    )
    .resume()
    .await
    .expect("resume should finish");

    assert_eq!(report.outcome, RunOutcome::Succeeded);
    assert!(second.probe.started().is_empty());
    assert_eq!(store.latest("run-1"), Some(before));
    assert_eq!(store.history().len(), saves_before);
    assert!(captured.lock().expect("events mutex").is_empty());
}
