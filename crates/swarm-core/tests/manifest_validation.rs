//! Manifest validation collects every violation in one pass.

use swarm_core::domain::manifest::RawManifest;
use swarm_core::{validate, CpuQuantity, MemoryQuantity, Project, RegistryKind, SwarmError};
use swarm_state::ProviderKind;

fn parse(yaml: &str) -> RawManifest {
    RawManifest::from_yaml(yaml).expect("yaml")
}

#[test]
fn every_violation_is_reported() {
    let raw = parse(
        r#"
project:
  name: ""
registry:
  type: quay
infrastructure:
  provider: heroku
agents:
  - name: triage
    replicas: -2
    resources:
      cpu: lots
      memory: 12XB
  - name: triage
    depends_on: [ghost]
  - name: Upper_Case
"#,
    );
    let err = validate(&raw).expect_err("invalid");
    let fields: Vec<&str> = err.violations.iter().map(|v| v.field.as_str()).collect();
    for expected in [
        "project.name",
        "registry.type",
        "infrastructure.provider",
        "agents[0].replicas",
        "agents[0].resources.cpu",
        "agents[0].resources.memory",
        "agents[1].name",
        "agents[1].depends_on",
        "agents[2].name",
    ] {
        assert!(fields.contains(&expected), "missing {expected} in {fields:?}");
    }
    assert!(err
        .for_field("agents[1].name")
        .any(|v| v.reason.contains("duplicate agent name 'triage'")));
}

#[test]
fn numeric_and_string_quantities_are_equivalent() {
    let raw = parse(
        r#"
project:
  name: demo
  version: 1.2
agents:
  - name: a
    resources:
      cpu: 2
      memory: 1Gi
  - name: b
    resources:
      cpu: "250m"
      memory: 256Mi
"#,
    );
    let project = validate(&raw).expect("valid");
    assert_eq!(project.version, "1.2");
    let a = project.agent("a").expect("a");
    assert_eq!(a.resources.cpu, CpuQuantity::from_millis(2000));
    assert_eq!(a.resources.memory, MemoryQuantity::from_bytes(1 << 30));
    let b = project.agent("b").expect("b");
    assert_eq!(b.resources.cpu, CpuQuantity::from_millis(250));
    assert_eq!(b.resources.memory.mebibytes(), 256);
}

#[test]
fn unknown_sections_are_ignored() {
    let raw = parse(
        r#"
project:
  name: demo
  created_at: "2024-01-01T00:00:00Z"
registry:
  url: null
  type: ecr
services:
  message_queue:
    type: redis
agents: []
"#,
    );
    let project = validate(&raw).expect("valid");
    assert_eq!(project.registry.kind, RegistryKind::Ecr);
    assert!(project.registry.url.is_none());
    assert_eq!(project.infrastructure.provider, ProviderKind::Local);
    assert!(project.agents.is_empty());
}

#[test]
fn names_differing_only_by_padding_are_duplicates() {
    let raw = parse(
        r#"
project:
  name: demo
agents:
  - name: a
  - name: " a"
  - name: b
    depends_on: [" a "]
"#,
    );
    let err = validate(&raw).expect_err("duplicate");
    assert_eq!(err.violations.len(), 1, "{:?}", err.violations);
    assert!(err
        .for_field("agents[1].name")
        .any(|v| v.reason.contains("duplicate agent name 'a'") && v.reason.contains("agents[0]")));
}

#[test]
fn padded_dependency_names_resolve() {
    let raw = parse("project:\n  name: demo\nagents:\n  - name: a\n  - name: b\n    depends_on: [\" a\"]\n");
    let project = validate(&raw).expect("valid");
    assert_eq!(project.agent("b").expect("b").depends_on, vec!["a".to_string()]);
}

#[test]
fn zero_replicas_is_allowed() {
    let raw = parse("project:\n  name: demo\nagents:\n  - name: idle\n    replicas: 0\n");
    let project = validate(&raw).expect("valid");
    assert_eq!(project.agent("idle").expect("idle").replicas, 0);
}

#[test]
fn load_reports_missing_and_malformed_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    assert!(matches!(Project::load(dir.path()), Err(SwarmError::Io(_))));

    std::fs::write(dir.path().join("aiswarm.yaml"), "project: [unterminated").expect("write");
    assert!(matches!(
        Project::load(dir.path()),
        Err(SwarmError::ManifestParse(_))
    ));

    std::fs::write(dir.path().join("aiswarm.yaml"), "agents:\n  - name: a\n").expect("write");
    match Project::load(dir.path()) {
        Err(SwarmError::Manifest(err)) => {
            assert_eq!(err.violations.len(), 1);
            assert_eq!(err.violations[0].field, "project.name");
        }
        other => panic!("expected manifest error, got {other:?}"),
    }
}
