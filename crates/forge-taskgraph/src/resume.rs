use crate::{
    ErrorKind, Graph, NodeError, NodeStatus, RetryController, RetryDecision, RunState, RunStatus,
    TaskGraphError, timestamp_now,
};
use std::collections::BTreeMap;
use tracing::{info, warn};

pub const INTERRUPTED_MESSAGE: &str = "interrupted";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Nodes found `running`, reclassified as failed "interrupted".
    pub interrupted: Vec<String>,
    /// Nodes sent back to `pending`, with the backoff to honour first.
    pub requeued: BTreeMap<String, u64>,
    /// Interrupted nodes with no attempts left.
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub dropped_locks: BTreeMap<String, String>,
}

/// Prepares a loaded state for continued scheduling under the same run id.
///
/// Terminal nodes are left untouched. Locks are always dropped: the only
/// process that could hold them is gone.
pub fn reconcile(
    state: &mut RunState,
    graph: &Graph,
    retry: &RetryController,
) -> Result<ReconcileReport, TaskGraphError> {
    state.check_matches(graph)?;

    let mut report = ReconcileReport {
        dropped_locks: std::mem::take(&mut state.locks),
        ..ReconcileReport::default()
    };
    let now = timestamp_now();

    for (node_id, node_state) in state.nodes.iter_mut() {
        let Some(node) = graph.node(node_id) else {
            continue;
        };
        match node_state.status {
            NodeStatus::Running => {
                warn!(
                    node_id = node_id.as_str(),
                    attempt = node_state.attempt_count,
                    "node was running at crash time; marking interrupted"
                );
                report.interrupted.push(node_id.clone());
                node_state.status = NodeStatus::Failed;
                node_state.ended_at = Some(now.clone());
                node_state.last_error = Some(NodeError {
                    kind: ErrorKind::Interrupted,
                    message: INTERRUPTED_MESSAGE.to_string(),
                });
                match retry.decide_failure(
                    node,
                    node_state.attempt_count.max(1),
                    &ErrorKind::Interrupted,
                ) {
                    RetryDecision::Retry { delay_ms, .. } => {
                        node_state.status = NodeStatus::Pending;
                        node_state.retry_pending = false;
                        report.requeued.insert(node_id.clone(), delay_ms);
                    }
                    RetryDecision::Fail { .. } | RetryDecision::Succeeded => {
                        node_state.retry_pending = false;
                        report.failed.push(node_id.clone());
                    }
                }
            }
            NodeStatus::Failed if node_state.retry_pending => {
                node_state.status = NodeStatus::Pending;
                node_state.retry_pending = false;
                report.requeued.insert(node_id.clone(), 0);
            }
            NodeStatus::Pending
            | NodeStatus::Success
            | NodeStatus::Failed
            | NodeStatus::Skipped => {}
        }
    }

    let failed_terminal: Vec<String> = state
        .nodes
        .iter()
        .filter(|(_, node)| node.status == NodeStatus::Failed && !node.retry_pending)
        .map(|(id, _)| id.clone())
        .collect();
    for failed in failed_terminal {
        report
            .skipped
            .extend(propagate_skips(state, graph, &failed));
    }

    state.resume_count += 1;
    state.status = RunStatus::Running;
    state.touch();
    info!(
        run_id = state.run_id.as_str(),
        interrupted = report.interrupted.len(),
        requeued = report.requeued.len(),
        dropped_locks = report.dropped_locks.len(),
        "run state reconciled for resume"
    );
    Ok(report)
}

/// Marks every not-yet-terminal descendant of `failed_node_id` as skipped.
/// Returns the ids that changed, in id order.
pub fn propagate_skips(state: &mut RunState, graph: &Graph, failed_node_id: &str) -> Vec<String> {
    let mut skipped = Vec::new();
    let now = timestamp_now();
    for descendant in graph.descendants(failed_node_id) {
        let Some(node_state) = state.nodes.get_mut(&descendant) else {
            continue;
        };
        if node_state.is_terminal() {
            continue;
        }
        node_state.status = NodeStatus::Skipped;
        node_state.retry_pending = false;
        node_state.ended_at = Some(now.clone());
        node_state.skipped_because = Some(failed_node_id.to_string());
        skipped.push(descendant);
    }
    skipped
}
