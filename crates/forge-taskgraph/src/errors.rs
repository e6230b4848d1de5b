use crate::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskGraphError {
    #[error("graph document parse error: {0}")]
    Parse(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("dependency cycle detected: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error("io error: {0}")]
    Io(String),
    #[error("state store error: {0}")]
    State(String),
    #[error("no persisted state for run '{0}'")]
    StateNotFound(String),
    #[error("state for run '{0}' already exists; resume it instead")]
    StateExists(String),
    #[error("cannot resume run '{run_id}': {reason}")]
    ResumeMismatch { run_id: String, reason: String },
    #[error("execution error: {0}")]
    Execution(String),
    #[error(transparent)]
    ProcessLifecycle(#[from] ProcessLifecycleError),
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl TaskGraphError {
    /// True for errors raised before any run state exists.
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            Self::Parse(_) | Self::Validation(_) | Self::Cycle { .. }
        )
    }
}

#[derive(Debug, Error, Clone)]
#[error("validation failed with {errors_count} error(s)")]
pub struct ValidationError {
    pub diagnostics: Vec<Diagnostic>,
    pub errors_count: usize,
}

impl ValidationError {
    pub fn new(diagnostics: Vec<Diagnostic>) -> Self {
        let errors_count = diagnostics.iter().filter(|d| d.is_error()).count();
        Self {
            diagnostics,
            errors_count,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessLifecycleError {
    #[error("failed to launch shared process '{name}': {reason}")]
    Launch { name: String, reason: String },
    #[error("shared process '{name}' did not become healthy within {timeout_ms}ms")]
    Unhealthy { name: String, timeout_ms: u64 },
    #[error("shared process '{name}' exited during startup: {reason}")]
    ExitedEarly { name: String, reason: String },
    #[error("failed to stop shared process '{name}': {reason}")]
    Shutdown { name: String, reason: String },
    #[error("invalid shared process spec: {0}")]
    InvalidSpec(String),
}
