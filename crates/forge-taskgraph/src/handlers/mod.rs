use crate::{ExecutionContext, Node, NodeKind, Outcome, TaskGraphError};
use async_trait::async_trait;
use std::sync::Arc;

pub mod ai_task;
pub mod collaborator;
pub mod shared_process;

#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(
        &self,
        node: &Node,
        context: &ExecutionContext,
    ) -> Result<Outcome, TaskGraphError>;
}

pub type SharedNodeHandler = Arc<dyn NodeHandler>;

#[async_trait]
impl<T> crate::NodeExecutor for T
where
    T: NodeHandler + Send + Sync,
{
    async fn execute(
        &self,
        node: &Node,
        context: &ExecutionContext,
    ) -> Result<Outcome, TaskGraphError> {
        NodeHandler::execute(self, node, context).await
    }
}

/// One handler per node kind. Adding a kind forces a decision here.
#[derive(Clone)]
pub struct ExecutorSet {
    pub shared_process: SharedNodeHandler,
    pub test_runner: SharedNodeHandler,
    pub audit_runner: SharedNodeHandler,
    pub validation_gate: SharedNodeHandler,
    pub ai_assisted_task: SharedNodeHandler,
    pub packaging: SharedNodeHandler,
    pub reporting: SharedNodeHandler,
}

impl ExecutorSet {
    pub fn with_defaults() -> Self {
        let collaborator: SharedNodeHandler =
            Arc::new(collaborator::CollaboratorHandler::default());
        Self {
            shared_process: Arc::new(shared_process::SharedProcessHandler),
            test_runner: collaborator.clone(),
            audit_runner: collaborator.clone(),
            validation_gate: collaborator.clone(),
            ai_assisted_task: Arc::new(ai_task::AiTaskHandler::default()),
            packaging: collaborator.clone(),
            reporting: collaborator,
        }
    }

    /// Routes every collaborator-backed kind to `collaborator`.
    pub fn with_collaborator(mut self, collaborator: collaborator::SharedCollaborator) -> Self {
        let handler: SharedNodeHandler =
            Arc::new(collaborator::CollaboratorHandler::new(collaborator));
        self.test_runner = handler.clone();
        self.audit_runner = handler.clone();
        self.validation_gate = handler.clone();
        self.packaging = handler.clone();
        self.reporting = handler;
        self
    }

    pub fn with_handler(mut self, kind: NodeKind, handler: SharedNodeHandler) -> Self {
        *self.slot_mut(kind) = handler;
        self
    }

    /// Uses `handler` for every kind.
    pub fn uniform(handler: SharedNodeHandler) -> Self {
        Self {
            shared_process: handler.clone(),
            test_runner: handler.clone(),
            audit_runner: handler.clone(),
            validation_gate: handler.clone(),
            ai_assisted_task: handler.clone(),
            packaging: handler.clone(),
            reporting: handler,
        }
    }

    pub fn handler_for(&self, kind: NodeKind) -> &SharedNodeHandler {
        match kind {
            NodeKind::SharedProcess => &self.shared_process,
            NodeKind::TestRunner => &self.test_runner,
            NodeKind::AuditRunner => &self.audit_runner,
            NodeKind::ValidationGate => &self.validation_gate,
            NodeKind::AiAssistedTask => &self.ai_assisted_task,
            NodeKind::Packaging => &self.packaging,
            NodeKind::Reporting => &self.reporting,
        }
    }

    fn slot_mut(&mut self, kind: NodeKind) -> &mut SharedNodeHandler {
        match kind {
            NodeKind::SharedProcess => &mut self.shared_process,
            NodeKind::TestRunner => &mut self.test_runner,
            NodeKind::AuditRunner => &mut self.audit_runner,
            NodeKind::ValidationGate => &mut self.validation_gate,
            NodeKind::AiAssistedTask => &mut self.ai_assisted_task,
            NodeKind::Packaging => &mut self.packaging,
            NodeKind::Reporting => &mut self.reporting,
        }
    }
}

impl Default for ExecutorSet {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[async_trait]
impl NodeHandler for ExecutorSet {
    async fn execute(
        &self,
        node: &Node,
        context: &ExecutionContext,
    ) -> Result<Outcome, TaskGraphError> {
        self.handler_for(node.kind).execute(node, context).await
    }
}
