//! Task-graph execution engine for Forge build pipelines.
//!
//! A compiled graph document is loaded and validated, then a single-threaded
//! scheduler dispatches ready nodes under a concurrency bound and exclusive
//! resource locks, retries transient failures with backoff, persists run
//! state after every transition and resumes interrupted runs.

pub mod config;
pub mod diagnostics;
pub mod errors;
pub mod events;
pub mod graph;
pub mod handlers;
pub mod lint;
pub mod locks;
pub mod parse;
pub mod process;
pub mod resume;
pub mod retry;
pub mod runtime;
pub mod scheduler;
pub mod state;
pub mod store;

pub use config::*;
pub use diagnostics::*;
pub use errors::*;
pub use events::*;
pub use graph::*;
pub use handlers::ai_task::{
    AiDispatchPolicy, AiRunMode, AiStrategy, AiTaskHandler, CommandTask, DelegationError,
    DelegationReply, DelegationRequest, DeterministicTask, PlanningCollaborator, PolicyContext,
    SharedPlanningCollaborator,
};
pub use handlers::collaborator::{
    Collaborator, CollaboratorHandler, CollaboratorRequest, CollaboratorResponse,
    CommandCollaborator, SharedCollaborator,
};
pub use handlers::shared_process::SharedProcessHandler;
pub use handlers::{ExecutorSet, NodeHandler, SharedNodeHandler};
pub use lint::*;
pub use locks::*;
pub use parse::*;
pub use process::{
    DefaultHealthProbe, HealthCheck, HealthProbe, HttpProbe, Ownership, ProcessLease,
    ProcessLifecycleManager, SharedProcessSpec, TcpProbe,
};
pub use resume::*;
pub use retry::*;
pub use runtime::*;
pub use scheduler::*;
pub use state::*;
pub use store::*;
