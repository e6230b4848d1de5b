use clap::{ArgAction, Parser, Subcommand};
use forge_taskgraph::{
    AiRunMode, EngineSettings, FsStateStore, Graph, JsonlEventObserver, LockEvent, NodeEvent,
    NodeStatus, ProcessEvent, RunConfig, RunEvent, RunOutcome, RunReport, RunState, RuntimeEvent,
    RuntimeEventKind, RuntimeEventSink, Scheduler, StateEvent, TaskGraphError, cancellation_pair,
    load_graph_file, runtime_event_channel,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const LOG_FILTER_ENV: &str = "FORGE_LOG";
const EXIT_PARTIAL_FAILURE: u8 = 2;
const EXIT_INVALID_GRAPH: u8 = 3;
const EXIT_CANCELLED: u8 = 4;

#[derive(Parser, Debug)]
#[command(name = "forge-cli")]
#[command(about = "Runs project task graphs with the Forge scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Run(RunArgs),
    Resume(ResumeArgs),
    Validate(ValidateArgs),
    InspectState(InspectStateArgs),
}

#[derive(clap::Args, Debug)]
struct EngineArgs {
    #[arg(long)]
    state_dir: Option<PathBuf>,
    #[arg(long)]
    events_dir: Option<PathBuf>,
    /// deterministic, delegated or auto
    #[arg(long)]
    ai_mode: Option<String>,
    #[arg(long = "no-stream-events", action = ArgAction::SetTrue)]
    no_stream_events: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[arg(long)]
    graph: PathBuf,
    #[arg(long)]
    run_id: Option<String>,
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(clap::Args, Debug)]
struct ResumeArgs {
    #[arg(long)]
    graph: PathBuf,
    #[arg(long)]
    run_id: String,
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(clap::Args, Debug)]
struct ValidateArgs {
    #[arg(long)]
    graph: PathBuf,
}

#[derive(clap::Args, Debug)]
struct InspectStateArgs {
    #[arg(long)]
    run_id: String,
    #[arg(long)]
    state_dir: Option<PathBuf>,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Clone, Copy, Debug)]
enum Mode {
    Fresh,
    Resume,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => {
            execute(Mode::Fresh, args.graph, args.run_id, args.engine).await
        }
        Commands::Resume(args) => {
            execute(Mode::Resume, args.graph, Some(args.run_id), args.engine).await
        }
        Commands::Validate(args) => validate_command(args),
        Commands::InspectState(args) => inspect_state_command(args),
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn engine_settings(
    engine: Option<&EngineArgs>,
    state_dir: Option<PathBuf>,
) -> Result<EngineSettings, String> {
    let mut settings = EngineSettings::from_env().map_err(|error| error.to_string())?;
    if let Some(dir) = state_dir {
        settings.state_dir = dir;
    }
    if let Some(engine) = engine {
        if let Some(dir) = engine.events_dir.clone() {
            settings.events_dir = Some(dir);
        }
        if let Some(raw) = engine.ai_mode.as_deref() {
            let mode = AiRunMode::parse(raw).ok_or_else(|| {
                format!("--ai-mode '{raw}' must be deterministic, delegated or auto")
            })?;
            settings.ai_mode = Some(mode);
        }
    }
    Ok(settings)
}

async fn execute(
    mode: Mode,
    graph_path: PathBuf,
    run_id: Option<String>,
    engine: EngineArgs,
) -> Result<ExitCode, String> {
    let graph = match load_graph_file(&graph_path) {
        Ok(graph) => graph,
        Err(error) if error.is_load_error() => {
            report_load_error(&graph_path, &error);
            return Ok(ExitCode::from(EXIT_INVALID_GRAPH));
        }
        Err(error) => return Err(error.to_string()),
    };
    let settings = engine_settings(Some(&engine), engine.state_dir.clone())?;
    let store = FsStateStore::new(&settings.state_dir).map_err(|error| error.to_string())?;

    let (mut events, event_task) = event_stream(!engine.no_stream_events, engine.event_json);
    if let Some(dir) = settings.events_dir.as_deref() {
        let observer = JsonlEventObserver::open(dir).map_err(|error| error.to_string())?;
        tracing::info!(path = %observer.path().display(), "writing event log");
        events = events.observer(Arc::new(observer));
    }

    let (cancel, cancellation) = cancellation_pair();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let scheduler = Scheduler::new(
        graph,
        RunConfig {
            run_id,
            store: Arc::new(store),
            events,
            retry: settings.retry_settings(),
            ai_mode: settings.ai_mode,
            cancellation,
            ..RunConfig::default()
        },
    );
    let result = match mode {
        Mode::Fresh => scheduler.run().await,
        Mode::Resume => scheduler.resume().await,
    };
    interrupt.abort();
    if let Some(task) = event_task {
        task.await.map_err(|error| error.to_string())?;
    }

    let report = result.map_err(|error| error.to_string())?;
    print_run_summary(&report);
    Ok(exit_code_for_outcome(report.outcome))
}

fn validate_command(args: ValidateArgs) -> Result<ExitCode, String> {
    match load_graph_file(&args.graph) {
        Ok(graph) => {
            print_graph_summary(&graph);
            Ok(ExitCode::SUCCESS)
        }
        Err(error) if error.is_load_error() => {
            report_load_error(&args.graph, &error);
            Ok(ExitCode::from(EXIT_INVALID_GRAPH))
        }
        Err(error) => Err(error.to_string()),
    }
}

fn inspect_state_command(args: InspectStateArgs) -> Result<ExitCode, String> {
    let settings = engine_settings(None, args.state_dir)?;
    let store = FsStateStore::new(&settings.state_dir).map_err(|error| error.to_string())?;
    let state = store
        .load_blocking(&args.run_id)
        .map_err(|error| error.to_string())?
        .ok_or_else(|| TaskGraphError::StateNotFound(args.run_id.clone()).to_string())?;

    if args.json {
        let json = serde_json::to_string_pretty(&state).map_err(|error| error.to_string())?;
        println!("{json}");
    } else {
        print_state(&state);
    }
    Ok(ExitCode::SUCCESS)
}

fn report_load_error(path: &std::path::Path, error: &TaskGraphError) {
    eprintln!("invalid graph '{}': {error}", path.display());
    if let TaskGraphError::Validation(validation) = error {
        for diagnostic in &validation.diagnostics {
            eprintln!("  {diagnostic}");
        }
    }
}

fn event_stream(
    stream_events: bool,
    event_json: bool,
) -> (RuntimeEventSink, Option<tokio::task::JoinHandle<()>>) {
    if !stream_events {
        return (RuntimeEventSink::default(), None);
    }

    let (tx, mut rx) = runtime_event_channel();
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if event_json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(_) => print_event_text(&event),
                }
            } else {
                print_event_text(&event);
            }
        }
    });
    (RuntimeEventSink::with_sender(tx), Some(task))
}

fn print_event_text(event: &RuntimeEvent) {
    println!(
        "[event seq={}] {} {}",
        event.sequence_no,
        event.timestamp,
        describe_event(&event.kind)
    );
}

fn describe_event(kind: &RuntimeEventKind) -> String {
    match kind {
        RuntimeEventKind::Run(RunEvent::Started { node_count, .. }) => {
            format!("run.started nodes={node_count}")
        }
        RuntimeEventKind::Run(RunEvent::Resumed {
            resume_count,
            interrupted,
            ..
        }) => format!(
            "run.resumed count={resume_count} interrupted=[{}]",
            interrupted.join(",")
        ),
        RuntimeEventKind::Run(RunEvent::Completed {
            succeeded,
            failed,
            skipped,
            ..
        }) => format!("run.completed succeeded={succeeded} failed={failed} skipped={skipped}"),
        RuntimeEventKind::Run(RunEvent::Cancelled { running, .. }) => {
            format!("run.cancelled running=[{}]", running.join(","))
        }
        RuntimeEventKind::Node(NodeEvent::Started {
            node_id,
            node_kind,
            attempt,
            ..
        }) => format!("node.started {node_id} kind={node_kind} attempt={attempt}"),
        RuntimeEventKind::Node(NodeEvent::Succeeded {
            node_id, attempt, ..
        }) => format!("node.succeeded {node_id} attempt={attempt}"),
        RuntimeEventKind::Node(NodeEvent::Failed {
            node_id,
            attempt,
            error_kind,
            will_retry,
            ..
        }) => format!("node.failed {node_id} attempt={attempt} error={error_kind} retry={will_retry}"),
        RuntimeEventKind::Node(NodeEvent::Retrying {
            node_id,
            next_attempt,
            delay_ms,
            ..
        }) => format!("node.retrying {node_id} next_attempt={next_attempt} delay_ms={delay_ms}"),
        RuntimeEventKind::Node(NodeEvent::Skipped {
            node_id,
            failed_ancestor,
            ..
        }) => format!("node.skipped {node_id} because={failed_ancestor}"),
        RuntimeEventKind::Node(NodeEvent::Interrupted {
            node_id, attempt, ..
        }) => format!("node.interrupted {node_id} attempt={attempt}"),
        RuntimeEventKind::Lock(LockEvent::Acquired {
            node_id, resources, ..
        }) => format!("lock.acquired {node_id} [{}]", resources.join(",")),
        RuntimeEventKind::Lock(LockEvent::Released {
            node_id, resources, ..
        }) => format!("lock.released {node_id} [{}]", resources.join(",")),
        RuntimeEventKind::Lock(LockEvent::Contended {
            node_id,
            resource,
            holder,
            ..
        }) => format!("lock.contended {node_id} resource={resource} holder={holder}"),
        RuntimeEventKind::Process(ProcessEvent::Started { name, pid, .. }) => match pid {
            Some(pid) => format!("process.started {name} pid={pid}"),
            None => format!("process.started {name}"),
        },
        RuntimeEventKind::Process(ProcessEvent::Reused { name, .. }) => {
            format!("process.reused {name}")
        }
        RuntimeEventKind::Process(ProcessEvent::Stopped { name, .. }) => {
            format!("process.stopped {name}")
        }
        RuntimeEventKind::State(StateEvent::Saved { sequence_no, .. }) => {
            format!("state.saved seq={sequence_no}")
        }
    }
}

fn print_graph_summary(graph: &Graph) {
    println!("graph: {}", graph.project_id());
    println!("digest: {}", graph.digest());
    println!("nodes: {}", graph.nodes().len());
    println!("concurrency: {}", graph.concurrency());
    println!("valid: true");
}

fn print_run_summary(report: &RunReport) {
    println!("run_id: {}", report.run_id);
    println!("graph: {}", report.graph_id);
    println!("status: {}", outcome_label(report.outcome));
    println!("resumed: {}", report.resumed);
    for (node_id, node) in &report.nodes {
        match (&node.last_error, &node.skipped_because) {
            (_, Some(ancestor)) => {
                println!("  {node_id}: {} (after {ancestor})", node.status.as_str())
            }
            (Some(error), None) if node.status != NodeStatus::Success => println!(
                "  {node_id}: {} [{}] {}",
                node.status.as_str(),
                error.kind.as_str(),
                error.message
            ),
            _ => println!(
                "  {node_id}: {} attempts={}",
                node.status.as_str(),
                node.attempt_count
            ),
        }
    }
}

fn print_state(state: &RunState) {
    println!("run_id: {}", state.run_id);
    println!("graph: {}", state.graph_id);
    println!("digest: {}", state.graph_digest);
    println!("status: {:?}", state.status);
    println!("updated_at: {}", state.updated_at);
    println!("resume_count: {}", state.resume_count);
    for (node_id, node) in &state.nodes {
        println!(
            "  {node_id}: {} attempts={}",
            node.status.as_str(),
            node.attempt_count
        );
    }
    for (resource, holder) in &state.locks {
        println!("  lock {resource}: {holder}");
    }
}

fn outcome_label(outcome: RunOutcome) -> &'static str {
    match outcome {
        RunOutcome::Succeeded => "succeeded",
        RunOutcome::PartiallyFailed { .. } => "partially_failed",
        RunOutcome::Cancelled => "cancelled",
    }
}

fn exit_code_for_outcome(outcome: RunOutcome) -> ExitCode {
    match outcome {
        RunOutcome::Succeeded => ExitCode::SUCCESS,
        RunOutcome::PartiallyFailed { .. } => ExitCode::from(EXIT_PARTIAL_FAILURE),
        RunOutcome::Cancelled => ExitCode::from(EXIT_CANCELLED),
    }
}
