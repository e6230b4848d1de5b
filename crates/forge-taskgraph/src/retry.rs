use crate::{Node, Outcome, OutcomeStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Failure categories reported by executors or produced by the engine.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ProcessLaunch,
    NetworkReset,
    Timeout,
    Interrupted,
    ProcessLifecycle,
    Validation,
    PolicyDenied,
    CommandFailed,
    CollaboratorUnavailable,
    Panicked,
    /// Error kind reported verbatim by a collaborator.
    Collaborator(String),
    Unknown,
}

impl ErrorKind {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "process_launch" => Self::ProcessLaunch,
            "network_reset" => Self::NetworkReset,
            "timeout" => Self::Timeout,
            "interrupted" => Self::Interrupted,
            "process_lifecycle" => Self::ProcessLifecycle,
            "validation" => Self::Validation,
            "policy_denied" => Self::PolicyDenied,
            "command_failed" => Self::CommandFailed,
            "collaborator_unavailable" => Self::CollaboratorUnavailable,
            "panicked" => Self::Panicked,
            "" | "unknown" => Self::Unknown,
            other => Self::Collaborator(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::ProcessLaunch => "process_launch",
            Self::NetworkReset => "network_reset",
            Self::Timeout => "timeout",
            Self::Interrupted => "interrupted",
            Self::ProcessLifecycle => "process_lifecycle",
            Self::Validation => "validation",
            Self::PolicyDenied => "policy_denied",
            Self::CommandFailed => "command_failed",
            Self::CollaboratorUnavailable => "collaborator_unavailable",
            Self::Panicked => "panicked",
            Self::Collaborator(kind) => kind,
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    /// Transient, but retried at most this many times regardless of policy.
    TransientLimited(u32),
    Permanent,
}

pub trait FailureClassifier: Send + Sync {
    fn classify(&self, kind: &ErrorKind) -> FailureClass;
}

pub type SharedFailureClassifier = Arc<dyn FailureClassifier>;

/// Conservative classifier: anything not explicitly listed is permanent.
#[derive(Clone, Debug)]
pub struct DefaultClassifier {
    retryable_collaborator_kinds: BTreeSet<String>,
    overrides: BTreeMap<ErrorKind, FailureClass>,
}

impl Default for DefaultClassifier {
    fn default() -> Self {
        Self {
            retryable_collaborator_kinds: ["rate_limited", "unavailable", "connection_reset"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            overrides: BTreeMap::new(),
        }
    }
}

impl DefaultClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retryable_kind(mut self, kind: impl Into<String>) -> Self {
        self.retryable_collaborator_kinds.insert(kind.into());
        self
    }

    pub fn with_override(mut self, kind: ErrorKind, class: FailureClass) -> Self {
        self.overrides.insert(kind, class);
        self
    }
}

impl FailureClassifier for DefaultClassifier {
    fn classify(&self, kind: &ErrorKind) -> FailureClass {
        if let Some(class) = self.overrides.get(kind) {
            return *class;
        }
        match kind {
            ErrorKind::ProcessLaunch
            | ErrorKind::NetworkReset
            | ErrorKind::Interrupted
            | ErrorKind::ProcessLifecycle => FailureClass::Transient,
            ErrorKind::Timeout => FailureClass::TransientLimited(1),
            ErrorKind::Collaborator(name) if self.retryable_collaborator_kinds.contains(name) => {
                FailureClass::Transient
            }
            ErrorKind::Validation
            | ErrorKind::PolicyDenied
            | ErrorKind::CommandFailed
            | ErrorKind::CollaboratorUnavailable
            | ErrorKind::Panicked
            | ErrorKind::Collaborator(_)
            | ErrorKind::Unknown => FailureClass::Permanent,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_delay_ms: 60_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Succeeded,
    Retry { delay_ms: u64, next_attempt: u32 },
    Fail { reason: String },
}

#[derive(Clone)]
pub struct RetryController {
    classifier: SharedFailureClassifier,
    settings: RetrySettings,
}

impl RetryController {
    pub fn new(classifier: SharedFailureClassifier, settings: RetrySettings) -> Self {
        Self {
            classifier,
            settings,
        }
    }

    /// Decides what follows attempt number `attempt_count` (1-based) of `node`.
    pub fn decide(&self, node: &Node, attempt_count: u32, outcome: &Outcome) -> RetryDecision {
        if outcome.status == OutcomeStatus::Success {
            return RetryDecision::Succeeded;
        }
        let kind = outcome.error_kind.clone().unwrap_or(ErrorKind::Unknown);
        self.decide_failure(node, attempt_count, &kind)
    }

    pub fn decide_failure(&self, node: &Node, attempt_count: u32, kind: &ErrorKind) -> RetryDecision {
        let attempt_limit = match self.classifier.classify(kind) {
            FailureClass::Permanent => {
                return RetryDecision::Fail {
                    reason: format!("permanent failure ({kind})"),
                };
            }
            FailureClass::Transient => node.retry.max_attempts,
            FailureClass::TransientLimited(retries) => {
                node.retry.max_attempts.min(retries.saturating_add(1))
            }
        };
        if attempt_count >= attempt_limit {
            return RetryDecision::Fail {
                reason: format!("transient failure ({kind}) after {attempt_count} attempt(s)"),
            };
        }
        RetryDecision::Retry {
            delay_ms: delay_for_attempt_ms(node.retry.backoff_ms, attempt_count, &self.settings),
            next_attempt: attempt_count + 1,
        }
    }
}

/// `backoff_ms * 2^(attempt-1)`, saturating and capped at `max_delay_ms`.
pub fn delay_for_attempt_ms(backoff_ms: u64, attempt: u32, settings: &RetrySettings) -> u64 {
    let exp = attempt.saturating_sub(1).min(63);
    let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
    backoff_ms
        .saturating_mul(factor)
        .min(settings.max_delay_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_graph_str;

    fn node_with_attempts(max_attempts: u32) -> Node {
        let graph = parse_graph_str(
            &format!(
                "project_id: p\nretry: {{ max_attempts: {max_attempts}, backoff_ms: 100 }}\nnodes:\n  - {{ id: n, kind: test-runner }}\n"
            ),
            None,
        )
        .expect("graph should load");
        graph.node("n").expect("node should exist").clone()
    }

    fn controller() -> RetryController {
        RetryController::new(Arc::new(DefaultClassifier::new()), RetrySettings::default())
    }

    #[test]
    fn delay_for_attempt_ms_expected_exponential_sequence() {
        let settings = RetrySettings::default();
        assert_eq!(delay_for_attempt_ms(100, 1, &settings), 100);
        assert_eq!(delay_for_attempt_ms(100, 2, &settings), 200);
        assert_eq!(delay_for_attempt_ms(100, 3, &settings), 400);
        assert_eq!(delay_for_attempt_ms(100, 40, &settings), 60_000);
    }

    #[test]
    fn decide_transient_with_attempts_left_expected_retry_with_backoff() {
        let node = node_with_attempts(3);
        let outcome = Outcome::failure(ErrorKind::NetworkReset, "reset by peer");
        assert_eq!(
            controller().decide(&node, 2, &outcome),
            RetryDecision::Retry {
                delay_ms: 200,
                next_attempt: 3
            }
        );
    }

    #[test]
    fn decide_transient_exhausted_expected_fail() {
        let node = node_with_attempts(3);
        let outcome = Outcome::failure(ErrorKind::ProcessLaunch, "spawn failed");
        assert!(matches!(
            controller().decide(&node, 3, &outcome),
            RetryDecision::Fail { .. }
        ));
    }

    #[test]
    fn decide_permanent_and_unclassified_expected_fail_immediately() {
        let node = node_with_attempts(5);
        for kind in [
            ErrorKind::Validation,
            ErrorKind::PolicyDenied,
            ErrorKind::Unknown,
            ErrorKind::Collaborator("weird".to_string()),
        ] {
            let outcome = Outcome::failure(kind, "nope");
            assert!(matches!(
                controller().decide(&node, 1, &outcome),
                RetryDecision::Fail { .. }
            ));
        }
    }

    #[test]
    fn decide_timeout_expected_retried_once_only() {
        let node = node_with_attempts(5);
        let outcome = Outcome::failure(ErrorKind::Timeout, "timed out");
        assert!(matches!(
            controller().decide(&node, 1, &outcome),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            controller().decide(&node, 2, &outcome),
            RetryDecision::Fail { .. }
        ));
    }

    #[test]
    fn classifier_extended_kind_expected_transient() {
        let classifier = DefaultClassifier::new()
            .with_retryable_kind("flaky_browser")
            .with_override(ErrorKind::Validation, FailureClass::Transient);
        assert_eq!(
            classifier.classify(&ErrorKind::parse("flaky_browser")),
            FailureClass::Transient
        );
        assert_eq!(
            classifier.classify(&ErrorKind::Validation),
            FailureClass::Transient
        );
        assert_eq!(
            classifier.classify(&ErrorKind::parse("rate_limited")),
            FailureClass::Transient
        );
    }

    #[test]
    fn decide_success_expected_succeeded() {
        let node = node_with_attempts(1);
        assert_eq!(
            controller().decide(&node, 1, &Outcome::success()),
            RetryDecision::Succeeded
        );
    }
}
