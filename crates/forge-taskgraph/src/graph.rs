use crate::{AiDispatchPolicy, AiRunMode, AiStrategy, TaskGraphError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

pub const DEFAULT_CONCURRENCY: usize = 1;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 1;
pub const DEFAULT_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 600_000;

/// Graph document as produced by the brief compiler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphSpec {
    pub project_id: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub retry: RetrySpec,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub ai: AiPolicySpec,
    pub nodes: Vec<NodeSpec>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySpec {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_ms: DEFAULT_BACKOFF_MS,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryOverride {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff_ms: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AiPolicySpec {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub include_roles: Vec<String>,
    #[serde(default)]
    pub exclude_roles: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSpec {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub retry: Option<RetryOverride>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub ai_mode: Option<String>,
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_backoff_ms() -> u64 {
    DEFAULT_BACKOFF_MS
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    SharedProcess,
    TestRunner,
    AuditRunner,
    ValidationGate,
    AiAssistedTask,
    Packaging,
    Reporting,
}

impl NodeKind {
    pub const ALL: [NodeKind; 7] = [
        Self::SharedProcess,
        Self::TestRunner,
        Self::AuditRunner,
        Self::ValidationGate,
        Self::AiAssistedTask,
        Self::Packaging,
        Self::Reporting,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SharedProcess => "shared-process",
            Self::TestRunner => "test-runner",
            Self::AuditRunner => "audit-runner",
            Self::ValidationGate => "validation-gate",
            Self::AiAssistedTask => "ai-assisted-task",
            Self::Packaging => "packaging",
            Self::Reporting => "reporting",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value.trim())
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn resolve(defaults: &RetrySpec, node_override: Option<&RetryOverride>) -> Self {
        let node_override = node_override.cloned().unwrap_or_default();
        Self {
            max_attempts: node_override
                .max_attempts
                .unwrap_or(defaults.max_attempts)
                .max(1),
            backoff_ms: node_override.backoff_ms.unwrap_or(defaults.backoff_ms),
        }
    }
}

/// A node with defaults merged in. Resources are sorted and deduplicated.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    pub params: Value,
    pub requires: Vec<String>,
    pub resources: Vec<String>,
    pub retry: RetryPolicy,
    pub timeout_ms: u64,
    pub role: Option<String>,
    pub ai_mode: Option<AiStrategy>,
}

impl Node {
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// Immutable, validated task graph.
#[derive(Clone, Debug)]
pub struct Graph {
    spec: GraphSpec,
    nodes: BTreeMap<String, Node>,
    dependents: BTreeMap<String, BTreeSet<String>>,
    ai_policy: AiDispatchPolicy,
    digest: String,
}

impl Graph {
    /// Builds the resolved graph. Callers must have run validation first.
    pub(crate) fn from_validated(spec: GraphSpec) -> Result<Self, TaskGraphError> {
        let mut nodes = BTreeMap::new();
        let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for node_spec in &spec.nodes {
            let kind = NodeKind::parse(&node_spec.kind).ok_or_else(|| {
                TaskGraphError::Runtime(format!(
                    "node '{}' has unknown kind '{}'",
                    node_spec.id, node_spec.kind
                ))
            })?;
            let ai_mode = match node_spec.ai_mode.as_deref() {
                Some(raw) => Some(AiStrategy::parse(raw).ok_or_else(|| {
                    TaskGraphError::Runtime(format!(
                        "node '{}' has invalid ai_mode '{}'",
                        node_spec.id, raw
                    ))
                })?),
                None => None,
            };
            let resources: BTreeSet<String> = node_spec.resources.iter().cloned().collect();

            dependents.entry(node_spec.id.clone()).or_default();
            for required in &node_spec.requires {
                dependents
                    .entry(required.clone())
                    .or_default()
                    .insert(node_spec.id.clone());
            }

            nodes.insert(
                node_spec.id.clone(),
                Node {
                    id: node_spec.id.clone(),
                    kind,
                    params: node_spec.params.clone(),
                    requires: node_spec.requires.clone(),
                    resources: resources.into_iter().collect(),
                    retry: RetryPolicy::resolve(&spec.retry, node_spec.retry.as_ref()),
                    timeout_ms: node_spec.timeout_ms.unwrap_or(spec.timeout_ms),
                    role: node_spec.role.clone(),
                    ai_mode,
                },
            );
        }

        let run_mode = match spec.ai.mode.as_deref() {
            Some(raw) => AiRunMode::parse(raw).ok_or_else(|| {
                TaskGraphError::Runtime(format!("invalid ai.mode '{raw}'"))
            })?,
            None => AiRunMode::Auto,
        };
        let ai_policy = AiDispatchPolicy {
            run_mode,
            include_roles: spec.ai.include_roles.iter().cloned().collect(),
            exclude_roles: spec.ai.exclude_roles.iter().cloned().collect(),
        };

        let canonical = serde_json::to_vec(&spec)
            .map_err(|error| TaskGraphError::Parse(format!("failed to canonicalize graph: {error}")))?;
        let digest = blake3::hash(&canonical).to_hex().to_string();

        Ok(Self {
            spec,
            nodes,
            dependents,
            ai_policy,
            digest,
        })
    }

    pub fn spec(&self) -> &GraphSpec {
        &self.spec
    }

    pub fn project_id(&self) -> &str {
        &self.spec.project_id
    }

    pub fn concurrency(&self) -> usize {
        self.spec.concurrency
    }

    pub fn ai_policy(&self) -> &AiDispatchPolicy {
        &self.ai_policy
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn nodes(&self) -> &BTreeMap<String, Node> {
        &self.nodes
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &String> + '_ {
        self.nodes.keys()
    }

    pub fn dependents_of<'a>(&'a self, node_id: &str) -> impl Iterator<Item = &'a String> + 'a {
        self.dependents
            .get(node_id)
            .into_iter()
            .flat_map(|ids| ids.iter())
    }

    /// Every node that transitively requires `node_id`, in id order.
    pub fn descendants(&self, node_id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<String> = self.dependents_of(node_id).cloned().collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(self.dependents_of(&next).cloned());
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_graph_str;

    const DIAMOND: &str = r#"
project_id: diamond
retry: { max_attempts: 2, backoff_ms: 50 }
nodes:
  - { id: a, kind: test-runner }
  - { id: b, kind: audit-runner, requires: [a], retry: { max_attempts: 5 } }
  - { id: c, kind: validation-gate, requires: [a], resources: [zeta, alpha, zeta] }
  - { id: d, kind: reporting, requires: [b, c], timeout_ms: 10 }
"#;

    #[test]
    fn node_kind_parse_known_kinds_expected_roundtrip() {
        for kind in NodeKind::ALL {
            assert_eq!(NodeKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(NodeKind::parse("browser"), None);
    }

    #[test]
    fn from_validated_overrides_expected_merged_onto_defaults() {
        let graph = parse_graph_str(DIAMOND, None).expect("graph should load");
        let b = graph.node("b").expect("b should exist");
        assert_eq!(b.retry.max_attempts, 5);
        assert_eq!(b.retry.backoff_ms, 50);
        assert_eq!(b.timeout_ms, DEFAULT_TIMEOUT_MS);

        let c = graph.node("c").expect("c should exist");
        assert_eq!(c.resources, vec!["alpha".to_string(), "zeta".to_string()]);

        let d = graph.node("d").expect("d should exist");
        assert_eq!(d.timeout_ms, 10);
        assert_eq!(d.retry.max_attempts, 2);
    }

    #[test]
    fn descendants_diamond_expected_transitive_closure() {
        let graph = parse_graph_str(DIAMOND, None).expect("graph should load");
        let from_a: Vec<String> = graph.descendants("a").into_iter().collect();
        assert_eq!(from_a, vec!["b", "c", "d"]);
        let from_c: Vec<String> = graph.descendants("c").into_iter().collect();
        assert_eq!(from_c, vec!["d"]);
        assert!(graph.descendants("d").is_empty());
    }

    #[test]
    fn digest_same_document_expected_stable() {
        let first = parse_graph_str(DIAMOND, None).expect("graph should load");
        let second = parse_graph_str(DIAMOND, None).expect("graph should load");
        assert_eq!(first.digest(), second.digest());
        assert_eq!(first.digest().len(), 64);
    }
}
