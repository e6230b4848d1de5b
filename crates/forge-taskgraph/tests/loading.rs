use forge_taskgraph::{
    GraphFormat, NodeKind, Severity, TaskGraphError, load_graph_file, parse_graph_str,
};

fn rules(error: &TaskGraphError) -> Vec<String> {
    match error {
        TaskGraphError::Validation(validation) => validation
            .diagnostics
            .iter()
            .map(|diagnostic| diagnostic.rule.clone())
            .collect(),
        other => panic!("expected validation error, got {other}"),
    }
}

#[test]
fn load_cyclic_graph_expected_cycle_error_with_path() {
    let error = parse_graph_str(
        r#"
project_id: loop
nodes:
  - { id: a, kind: packaging, requires: [c] }
  - { id: b, kind: packaging, requires: [a] }
  - { id: c, kind: packaging, requires: [b] }
  - { id: d, kind: reporting }
"#,
        None,
    )
    .expect_err("cycle should be rejected");

    match error {
        TaskGraphError::Cycle { path } => {
            assert_eq!(path.len(), 4);
            assert_eq!(path.first(), path.last());
            for id in ["a", "b", "c"] {
                assert!(path.iter().any(|step| step == id));
            }
        }
        other => panic!("expected cycle error, got {other}"),
    }
}

#[test]
fn load_several_structural_errors_expected_all_reported_together() {
    let error = parse_graph_str(
        r#"
project_id: broken
concurrency: 0
nodes:
  - { id: a, kind: browser }
  - { id: a, kind: packaging, requires: [ghost] }
  - { id: b, kind: packaging, requires: [b], resources: ["bad lock"] }
"#,
        None,
    )
    .expect_err("invalid graph should be rejected");

    assert!(error.is_load_error());
    let found = rules(&error);
    for expected in [
        "concurrency_positive",
        "kind_known",
        "unique_ids",
        "requires_exist",
        "no_self_dependency",
        "resource_well_formed",
    ] {
        assert!(
            found.iter().any(|rule| rule == expected),
            "missing {expected} in {found:?}"
        );
    }
    if let TaskGraphError::Validation(validation) = &error {
        assert!(
            validation
                .diagnostics
                .iter()
                .all(|diagnostic| diagnostic.severity == Severity::Error)
        );
        assert_eq!(validation.errors_count, validation.diagnostics.len());
    }
}

#[test]
fn load_unknown_field_expected_parse_error() {
    let error = parse_graph_str(
        "project_id: p\nnodes:\n  - { id: a, kind: packaging, priority: 3 }\n",
        None,
    )
    .expect_err("unknown fields should be rejected");
    assert!(matches!(error, TaskGraphError::Parse(_)));
}

#[test]
fn load_json_document_expected_same_graph_as_yaml() {
    let json = r#"{
  "project_id": "site",
  "concurrency": 2,
  "nodes": [
    { "id": "build", "kind": "packaging" },
    { "id": "e2e", "kind": "test-runner", "requires": ["build"], "resources": ["browser"] }
  ]
}"#;
    let yaml = r#"
project_id: site
concurrency: 2
nodes:
  - { id: build, kind: packaging }
  - { id: e2e, kind: test-runner, requires: [build], resources: [browser] }
"#;
    let from_json = parse_graph_str(json, Some(GraphFormat::Json)).expect("json should load");
    let from_yaml = parse_graph_str(yaml, None).expect("yaml should load");

    assert_eq!(from_json.digest(), from_yaml.digest());
    assert_eq!(
        from_json.node("e2e").map(|node| node.kind),
        Some(NodeKind::TestRunner)
    );
    assert_eq!(from_json.concurrency(), 2);
}

#[test]
fn load_graph_file_by_extension_expected_loaded() {
    let tmp = tempfile::tempdir().expect("tempdir should be created");
    let path = tmp.path().join("graph.yml");
    std::fs::write(
        &path,
        "project_id: disk\nnodes:\n  - { id: only, kind: reporting }\n",
    )
    .expect("graph file should be written");

    let graph = load_graph_file(&path).expect("graph file should load");
    assert_eq!(graph.project_id(), "disk");

    let missing = load_graph_file(&tmp.path().join("missing.yaml"))
        .expect_err("missing file should fail");
    assert!(matches!(missing, TaskGraphError::Io(_)));
}
