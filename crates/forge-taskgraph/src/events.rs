use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::TaskGraphError;

pub const EVENTS_FILE_NAME: &str = "events.jsonl";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub sequence_no: u64,
    pub timestamp: String,
    pub kind: RuntimeEventKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum RuntimeEventKind {
    Run(RunEvent),
    Node(NodeEvent),
    Lock(LockEvent),
    Process(ProcessEvent),
    State(StateEvent),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEvent {
    Started {
        run_id: String,
        graph_id: String,
        node_count: usize,
    },
    Resumed {
        run_id: String,
        graph_id: String,
        resume_count: u32,
        interrupted: Vec<String>,
    },
    Completed {
        run_id: String,
        graph_id: String,
        succeeded: usize,
        failed: usize,
        skipped: usize,
    },
    Cancelled {
        run_id: String,
        graph_id: String,
        running: Vec<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeEvent {
    Started {
        run_id: String,
        node_id: String,
        node_kind: String,
        attempt: u32,
    },
    Succeeded {
        run_id: String,
        node_id: String,
        attempt: u32,
        artifacts: Vec<String>,
    },
    Failed {
        run_id: String,
        node_id: String,
        attempt: u32,
        error_kind: String,
        message: Option<String>,
        will_retry: bool,
    },
    Retrying {
        run_id: String,
        node_id: String,
        attempt: u32,
        next_attempt: u32,
        delay_ms: u64,
    },
    Skipped {
        run_id: String,
        node_id: String,
        failed_ancestor: String,
    },
    Interrupted {
        run_id: String,
        node_id: String,
        attempt: u32,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LockEvent {
    Acquired {
        run_id: String,
        node_id: String,
        resources: Vec<String>,
    },
    Released {
        run_id: String,
        node_id: String,
        resources: Vec<String>,
    },
    Contended {
        run_id: String,
        node_id: String,
        resource: String,
        holder: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessEvent {
    Started {
        run_id: String,
        name: String,
        pid: Option<u32>,
    },
    Reused {
        run_id: String,
        name: String,
    },
    Stopped {
        run_id: String,
        name: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateEvent {
    Saved { run_id: String, sequence_no: u64 },
}

pub trait RuntimeEventObserver: Send + Sync {
    fn on_event(&self, event: &RuntimeEvent);
}

impl<F> RuntimeEventObserver for F
where
    F: Fn(&RuntimeEvent) + Send + Sync,
{
    fn on_event(&self, event: &RuntimeEvent) {
        self(event);
    }
}

pub type SharedRuntimeEventObserver = Arc<dyn RuntimeEventObserver>;
pub type RuntimeEventSender = mpsc::UnboundedSender<RuntimeEvent>;
pub type RuntimeEventReceiver = mpsc::UnboundedReceiver<RuntimeEvent>;

#[derive(Clone, Default)]
pub struct RuntimeEventSink {
    observers: Vec<SharedRuntimeEventObserver>,
    sender: Option<RuntimeEventSender>,
}

impl RuntimeEventSink {
    pub fn with_observer(observer: SharedRuntimeEventObserver) -> Self {
        Self {
            observers: vec![observer],
            sender: None,
        }
    }

    pub fn with_sender(sender: RuntimeEventSender) -> Self {
        Self {
            observers: Vec::new(),
            sender: Some(sender),
        }
    }

    pub fn observer(mut self, observer: SharedRuntimeEventObserver) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn sender(mut self, sender: RuntimeEventSender) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn is_enabled(&self) -> bool {
        !self.observers.is_empty() || self.sender.is_some()
    }

    pub fn emit(&self, event: RuntimeEvent) {
        for observer in &self.observers {
            observer.on_event(&event);
        }
        if let Some(sender) = self.sender.as_ref() {
            let _ = sender.send(event);
        }
    }
}

pub fn runtime_event_channel() -> (RuntimeEventSender, RuntimeEventReceiver) {
    mpsc::unbounded_channel()
}

/// Appends every event as one JSON line to `<dir>/events.jsonl`.
pub struct JsonlEventObserver {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlEventObserver {
    pub fn open(dir: &Path) -> Result<Self, TaskGraphError> {
        fs::create_dir_all(dir).map_err(|error| {
            TaskGraphError::Io(format!(
                "create events directory '{}' failed: {error}",
                dir.display()
            ))
        })?;
        let path = dir.join(EVENTS_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|error| {
                TaskGraphError::Io(format!("open events log '{}' failed: {error}", path.display()))
            })?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RuntimeEventObserver for JsonlEventObserver {
    fn on_event(&self, event: &RuntimeEvent) {
        let Ok(mut line) = serde_json::to_string(event) else {
            return;
        };
        line.push('\n');
        let mut file = self
            .file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Observability must never fail a run.
        if let Err(error) = file.write_all(line.as_bytes()) {
            tracing::warn!(path = %self.path.display(), %error, "failed to append event");
        }
    }
}
