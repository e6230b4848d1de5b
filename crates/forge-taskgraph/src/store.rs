use crate::{RunState, TaskGraphError, lint::is_well_formed_identifier};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Durable home of `RunState`. `save` must be atomic: a reader never
/// observes a partially written state.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, run_id: &str) -> Result<Option<RunState>, TaskGraphError>;
    async fn save(&self, state: &RunState) -> Result<(), TaskGraphError>;
}

pub type SharedStateStore = Arc<dyn StateStore>;

#[derive(Clone, Debug)]
pub struct FsStateStore {
    root: PathBuf,
}

impl FsStateStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, TaskGraphError> {
        fs::create_dir_all(root.as_ref()).map_err(|error| {
            TaskGraphError::State(format!(
                "create state directory '{}' failed: {error}",
                root.as_ref().display()
            ))
        })?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_path(&self, run_id: &str) -> Result<PathBuf, TaskGraphError> {
        if !is_well_formed_identifier(run_id) {
            return Err(TaskGraphError::State(format!(
                "run id '{run_id}' is not usable as a state file name"
            )));
        }
        Ok(self.root.join(format!("{run_id}.json")))
    }

    /// Synchronous read used by monitoring tools that have no runtime.
    pub fn load_blocking(&self, run_id: &str) -> Result<Option<RunState>, TaskGraphError> {
        let path = self.state_path(run_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path).map_err(|error| {
            TaskGraphError::State(format!("read state file '{}' failed: {error}", path.display()))
        })?;
        serde_json::from_slice(&raw).map(Some).map_err(|error| {
            TaskGraphError::State(format!(
                "deserialize state file '{}' failed: {error}",
                path.display()
            ))
        })
    }

    fn persist(&self, state: &RunState) -> Result<(), TaskGraphError> {
        let path = self.state_path(&state.run_id)?;
        let raw = serde_json::to_vec_pretty(state)
            .map_err(|error| TaskGraphError::State(format!("serialize state failed: {error}")))?;
        let tmp = path.with_extension("json.tmp");
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&raw)?;
            file.sync_all()
        };
        write().map_err(|error| {
            TaskGraphError::State(format!("write state file '{}' failed: {error}", tmp.display()))
        })?;
        fs::rename(&tmp, &path).map_err(|error| {
            TaskGraphError::State(format!("rename state file '{}' failed: {error}", path.display()))
        })?;
        debug!(run_id = state.run_id.as_str(), path = %path.display(), "run state saved");
        Ok(())
    }
}

#[async_trait]
impl StateStore for FsStateStore {
    async fn load(&self, run_id: &str) -> Result<Option<RunState>, TaskGraphError> {
        self.load_blocking(run_id)
    }

    async fn save(&self, state: &RunState) -> Result<(), TaskGraphError> {
        self.persist(state)
    }
}

/// In-process store. Keeps every saved snapshot for inspection.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryStoreInner>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    latest: BTreeMap<String, RunState>,
    history: Vec<RunState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: RunState) -> Self {
        let store = Self::default();
        store.lock_inner().latest.insert(state.run_id.clone(), state);
        store
    }

    /// Every snapshot saved so far, oldest first.
    pub fn history(&self) -> Vec<RunState> {
        self.lock_inner().history.clone()
    }

    pub fn latest(&self, run_id: &str) -> Option<RunState> {
        self.lock_inner().latest.get(run_id).cloned()
    }

    fn lock_inner(&self) -> MutexGuard<'_, MemoryStoreInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, run_id: &str) -> Result<Option<RunState>, TaskGraphError> {
        Ok(self.latest(run_id))
    }

    async fn save(&self, state: &RunState) -> Result<(), TaskGraphError> {
        let mut inner = self.lock_inner();
        inner.latest.insert(state.run_id.clone(), state.clone());
        inner.history.push(state.clone());
        Ok(())
    }
}
