use crate::{AiRunMode, AiStrategy, Diagnostic, GraphSpec, NodeKind, ValidationError};
use std::collections::{BTreeMap, BTreeSet};

pub trait LintRule {
    fn name(&self) -> &str;
    fn apply(&self, spec: &GraphSpec) -> Vec<Diagnostic>;
}

pub fn validate(spec: &GraphSpec, extra_rules: &[&dyn LintRule]) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    diagnostics.extend(rule_project_id(spec));
    diagnostics.extend(rule_concurrency_positive(spec));
    diagnostics.extend(rule_retry_policy_valid(spec));
    diagnostics.extend(rule_timeout_positive(spec));
    diagnostics.extend(rule_unique_ids(spec));
    diagnostics.extend(rule_id_well_formed(spec));
    diagnostics.extend(rule_kind_known(spec));
    diagnostics.extend(rule_requires_exist(spec));
    diagnostics.extend(rule_resource_well_formed(spec));
    diagnostics.extend(rule_ai_mode_valid(spec));

    for rule in extra_rules {
        diagnostics.extend(rule.apply(spec));
    }

    diagnostics
}

pub fn validate_or_raise(
    spec: &GraphSpec,
    extra_rules: &[&dyn LintRule],
) -> Result<Vec<Diagnostic>, ValidationError> {
    let diagnostics = validate(spec, extra_rules);
    if diagnostics.iter().any(Diagnostic::is_error) {
        return Err(ValidationError::new(diagnostics));
    }
    Ok(diagnostics)
}

/// Depth-first search over `requires`. Returns the first cycle found as a
/// closed path (`[a, b, a]`); edges to unknown nodes are ignored.
pub fn find_cycle(spec: &GraphSpec) -> Option<Vec<String>> {
    let edges: BTreeMap<&str, Vec<&str>> = spec
        .nodes
        .iter()
        .map(|node| {
            (
                node.id.as_str(),
                node.requires.iter().map(String::as_str).collect(),
            )
        })
        .collect();

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
    for root in edges.keys().copied() {
        if marks.contains_key(root) {
            continue;
        }
        // Explicit stack of (node, next edge index) keeps deep graphs off the call stack.
        let mut path: Vec<&str> = vec![root];
        let mut cursor: Vec<usize> = vec![0];
        marks.insert(root, Mark::Visiting);

        while let Some(&current) = path.last() {
            let depth = path.len() - 1;
            let targets = edges.get(current).map(Vec::as_slice).unwrap_or(&[]);
            if cursor[depth] >= targets.len() {
                marks.insert(current, Mark::Done);
                path.pop();
                cursor.pop();
                continue;
            }
            let next = targets[cursor[depth]];
            cursor[depth] += 1;
            if !edges.contains_key(next) {
                continue;
            }
            match marks.get(next) {
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|id| *id == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|id| id.to_string()).collect();
                    cycle.push(next.to_string());
                    return Some(cycle);
                }
                Some(Mark::Done) => {}
                None => {
                    marks.insert(next, Mark::Visiting);
                    path.push(next);
                    cursor.push(0);
                }
            }
        }
    }
    None
}

pub fn is_well_formed_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_ascii_alphanumeric()
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
}

fn rule_project_id(spec: &GraphSpec) -> Vec<Diagnostic> {
    if spec.project_id.trim().is_empty() {
        return vec![
            Diagnostic::error("project_id", "project_id must not be empty").with_field("project_id"),
        ];
    }
    Vec::new()
}

fn rule_concurrency_positive(spec: &GraphSpec) -> Vec<Diagnostic> {
    if spec.concurrency == 0 {
        return vec![
            Diagnostic::error("concurrency_positive", "concurrency must be at least 1")
                .with_field("concurrency"),
        ];
    }
    Vec::new()
}

fn rule_retry_policy_valid(spec: &GraphSpec) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    if spec.retry.max_attempts == 0 {
        diagnostics.push(
            Diagnostic::error("retry_policy_valid", "retry.max_attempts must be at least 1")
                .with_field("retry.max_attempts"),
        );
    }
    for (index, node) in spec.nodes.iter().enumerate() {
        let Some(retry) = node.retry.as_ref() else {
            continue;
        };
        if retry.max_attempts == Some(0) {
            diagnostics.push(
                Diagnostic::error("retry_policy_valid", "retry.max_attempts must be at least 1")
                    .with_node_id(node.id.clone())
                    .with_field(format!("nodes[{index}].retry.max_attempts")),
            );
        }
    }
    diagnostics
}

fn rule_timeout_positive(spec: &GraphSpec) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    if spec.timeout_ms == 0 {
        diagnostics.push(
            Diagnostic::error("timeout_positive", "timeout_ms must be positive")
                .with_field("timeout_ms"),
        );
    }
    for (index, node) in spec.nodes.iter().enumerate() {
        if node.timeout_ms == Some(0) {
            diagnostics.push(
                Diagnostic::error("timeout_positive", "timeout_ms must be positive")
                    .with_node_id(node.id.clone())
                    .with_field(format!("nodes[{index}].timeout_ms")),
            );
        }
    }
    diagnostics
}

fn rule_unique_ids(spec: &GraphSpec) -> Vec<Diagnostic> {
    let mut seen = BTreeSet::new();
    let mut diagnostics = Vec::new();
    for (index, node) in spec.nodes.iter().enumerate() {
        if !seen.insert(node.id.as_str()) {
            diagnostics.push(
                Diagnostic::error("unique_ids", format!("duplicate node id '{}'", node.id))
                    .with_node_id(node.id.clone())
                    .with_field(format!("nodes[{index}].id")),
            );
        }
    }
    diagnostics
}

fn rule_id_well_formed(spec: &GraphSpec) -> Vec<Diagnostic> {
    spec.nodes
        .iter()
        .enumerate()
        .filter(|(_, node)| !is_well_formed_identifier(&node.id))
        .map(|(index, node)| {
            Diagnostic::error("id_well_formed", format!("node id '{}' is not a valid identifier", node.id))
                .with_node_id(node.id.clone())
                .with_field(format!("nodes[{index}].id"))
        })
        .collect()
}

fn rule_kind_known(spec: &GraphSpec) -> Vec<Diagnostic> {
    spec.nodes
        .iter()
        .enumerate()
        .filter(|(_, node)| NodeKind::parse(&node.kind).is_none())
        .map(|(index, node)| {
            Diagnostic::error("kind_known", format!("unknown node kind '{}'", node.kind))
                .with_node_id(node.id.clone())
                .with_field(format!("nodes[{index}].kind"))
        })
        .collect()
}

fn rule_requires_exist(spec: &GraphSpec) -> Vec<Diagnostic> {
    let ids: BTreeSet<&str> = spec.nodes.iter().map(|node| node.id.as_str()).collect();
    let mut diagnostics = Vec::new();
    for (index, node) in spec.nodes.iter().enumerate() {
        for (req_index, required) in node.requires.iter().enumerate() {
            let field = format!("nodes[{index}].requires[{req_index}]");
            if required == &node.id {
                diagnostics.push(
                    Diagnostic::error("no_self_dependency", "node must not require itself")
                        .with_node_id(node.id.clone())
                        .with_field(field),
                );
            } else if !ids.contains(required.as_str()) {
                diagnostics.push(
                    Diagnostic::error(
                        "requires_exist",
                        format!("required node '{required}' does not exist"),
                    )
                    .with_node_id(node.id.clone())
                    .with_field(field),
                );
            }
        }
    }
    diagnostics
}

fn rule_resource_well_formed(spec: &GraphSpec) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for (index, node) in spec.nodes.iter().enumerate() {
        for (res_index, resource) in node.resources.iter().enumerate() {
            if !is_well_formed_identifier(resource) {
                diagnostics.push(
                    Diagnostic::error(
                        "resource_well_formed",
                        format!("resource name '{resource}' is not a valid identifier"),
                    )
                    .with_node_id(node.id.clone())
                    .with_field(format!("nodes[{index}].resources[{res_index}]")),
                );
            }
        }
    }
    diagnostics
}

fn rule_ai_mode_valid(spec: &GraphSpec) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    if let Some(mode) = spec.ai.mode.as_deref() {
        if AiRunMode::parse(mode).is_none() {
            diagnostics.push(
                Diagnostic::error(
                    "ai_mode_valid",
                    format!("ai.mode '{mode}' must be deterministic, delegated or auto"),
                )
                .with_field("ai.mode"),
            );
        }
    }
    for (index, node) in spec.nodes.iter().enumerate() {
        let Some(mode) = node.ai_mode.as_deref() else {
            continue;
        };
        if AiStrategy::parse(mode).is_none() {
            diagnostics.push(
                Diagnostic::error(
                    "ai_mode_valid",
                    format!("ai_mode '{mode}' must be deterministic or delegated"),
                )
                .with_node_id(node.id.clone())
                .with_field(format!("nodes[{index}].ai_mode")),
            );
        }
    }
    diagnostics
}
