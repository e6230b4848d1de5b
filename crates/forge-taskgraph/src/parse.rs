use crate::{Graph, GraphSpec, TaskGraphError, find_cycle, validate_or_raise};
use std::fs;
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GraphFormat {
    Yaml,
    Json,
}

impl GraphFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Some(Self::Json),
            Some("yaml" | "yml") => Some(Self::Yaml),
            _ => None,
        }
    }

    fn sniff(text: &str) -> Self {
        if text.trim_start().starts_with('{') {
            Self::Json
        } else {
            Self::Yaml
        }
    }
}

/// Parses the document without validating it.
pub fn parse_graph_spec(
    text: &str,
    format: Option<GraphFormat>,
) -> Result<GraphSpec, TaskGraphError> {
    match format.unwrap_or_else(|| GraphFormat::sniff(text)) {
        GraphFormat::Json => serde_json::from_str(text)
            .map_err(|error| TaskGraphError::Parse(format!("invalid JSON graph document: {error}"))),
        GraphFormat::Yaml => serde_yaml::from_str(text)
            .map_err(|error| TaskGraphError::Parse(format!("invalid YAML graph document: {error}"))),
    }
}

/// Validates a parsed document and produces the immutable graph.
///
/// Structural errors are reported together as a `Validation` error; a
/// dependency cycle is reported separately with its full path.
pub fn build_graph(spec: GraphSpec) -> Result<Graph, TaskGraphError> {
    validate_or_raise(&spec, &[])?;
    if let Some(path) = find_cycle(&spec) {
        return Err(TaskGraphError::Cycle { path });
    }
    Graph::from_validated(spec)
}

pub fn parse_graph_str(text: &str, format: Option<GraphFormat>) -> Result<Graph, TaskGraphError> {
    build_graph(parse_graph_spec(text, format)?)
}

pub fn load_graph_file(path: &Path) -> Result<Graph, TaskGraphError> {
    let text = fs::read_to_string(path).map_err(|error| {
        TaskGraphError::Io(format!(
            "failed reading graph document '{}': {}",
            path.display(),
            error
        ))
    })?;
    parse_graph_str(&text, GraphFormat::from_path(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_graph_str_json_document_expected_loaded() {
        let graph = parse_graph_str(
            r#"{"project_id":"p","concurrency":3,"nodes":[{"id":"a","kind":"packaging"}]}"#,
            None,
        )
        .expect("json graph should load");
        assert_eq!(graph.concurrency(), 3);
        assert!(graph.node("a").is_some());
    }

    #[test]
    fn parse_graph_str_unknown_field_expected_parse_error_naming_field() {
        let error = parse_graph_str(
            "project_id: p\nnodes:\n  - { id: a, kind: packaging, depends_on: [b] }\n",
            None,
        )
        .expect_err("unknown field should fail");
        let message = match error {
            TaskGraphError::Parse(message) => message,
            other => panic!("expected parse error, got {other:?}"),
        };
        assert!(message.contains("depends_on"), "message was: {message}");
    }

    #[test]
    fn parse_graph_str_cycle_expected_cycle_error() {
        let error = parse_graph_str(
            r#"
project_id: p
nodes:
  - { id: a, kind: packaging, requires: [b] }
  - { id: b, kind: packaging, requires: [a] }
"#,
            None,
        )
        .expect_err("cycle should fail");
        assert!(error.is_load_error());
        let TaskGraphError::Cycle { path } = error else {
            panic!("expected cycle error");
        };
        assert_eq!(path, vec!["a", "b", "a"]);
    }

    #[test]
    fn load_graph_file_missing_file_expected_io_error() {
        let error = load_graph_file(Path::new("/definitely/not/here.yaml"))
            .expect_err("missing file should fail");
        assert!(matches!(error, TaskGraphError::Io(_)));
    }
}
