//! `init`, `agent create` and the active-agent context.

use std::fs;

use swarm_core::scaffold::{
    active_agent, create_agent, find_enclosing_project, init_project, set_active_agent,
    AgentTemplate, InitOptions, ProjectTemplate,
};
use swarm_core::{Project, SwarmError};
use swarm_state::ProviderKind;

fn options(parent: &std::path::Path) -> InitOptions {
    let mut options = InitOptions::new("support-swarm", parent);
    options.registry = Some("registry.example.com".to_string());
    options.provider = ProviderKind::Gcp;
    options
}

#[test]
fn init_creates_a_loadable_project() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dir = init_project(&options(tmp.path())).expect("init");

    assert_eq!(dir, tmp.path().join("support-swarm"));
    for sub in ["agents", "infrastructure/gcp", "scripts", "config", "tests", "docs"] {
        assert!(dir.join(sub).join(".gitkeep").exists(), "{sub}");
    }
    assert!(dir.join(".gitignore").exists());
    for file in ["main.py", "Dockerfile", "requirements.txt"] {
        assert!(dir.join("agents/example-agent").join(file).exists(), "{file}");
    }

    let project = Project::load(&dir).expect("load");
    assert_eq!(project.name, "support-swarm");
    assert_eq!(project.infrastructure.provider, ProviderKind::Gcp);
    assert_eq!(project.registry.url.as_deref(), Some("registry.example.com"));
    assert!(project.id.is_some());
    assert_eq!(
        project.agent_names().collect::<Vec<_>>(),
        vec!["example-agent"]
    );
    assert_eq!(find_enclosing_project(&dir.join("agents")), Some(dir));
}

#[test]
fn monitoring_template_adds_prometheus_config() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut opts = options(tmp.path());
    opts.template = ProjectTemplate::Monitoring;
    let dir = init_project(&opts).expect("init");
    assert!(dir.join("config/prometheus.yml").exists());

    let manifest: serde_yaml::Value =
        serde_yaml::from_str(&fs::read_to_string(dir.join("aiswarm.yaml")).expect("read"))
            .expect("yaml");
    assert_eq!(manifest["project"]["template"].as_str(), Some("monitoring"));
    assert_eq!(
        manifest["services"]["monitoring"]["type"].as_str(),
        Some("prometheus")
    );
}

#[test]
fn init_refuses_non_empty_directory_without_force() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let target = tmp.path().join("support-swarm");
    fs::create_dir_all(&target).expect("mkdir");
    fs::write(target.join("notes.txt"), "keep me").expect("write");

    let err = init_project(&options(tmp.path())).expect_err("not empty");
    assert!(matches!(err, SwarmError::ProjectInit(_)));
    assert!(!target.join("aiswarm.yaml").exists());

    let mut forced = options(tmp.path());
    forced.force = true;
    init_project(&forced).expect("forced init");
    assert!(target.join("aiswarm.yaml").exists());
    assert_eq!(fs::read_to_string(target.join("notes.txt")).expect("read"), "keep me");
}

#[test]
fn init_inside_existing_project_is_refused() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let outer = init_project(&options(tmp.path())).expect("init");

    let nested = InitOptions::new("inner", outer.join("docs"));
    let err = init_project(&nested).expect_err("nested");
    match err {
        SwarmError::ProjectExists(path) => assert_eq!(path, outer),
        other => panic!("expected ProjectExists, got {other:?}"),
    }
}

#[test]
fn create_agent_appends_to_manifest() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = init_project(&options(tmp.path())).expect("init");

    let dir = create_agent(&root, "summarizer", AgentTemplate::Worker).expect("create");
    assert_eq!(dir, root.join("agents/summarizer"));
    let main = fs::read_to_string(dir.join("main.py")).expect("main.py");
    assert!(main.contains("blpop"));

    let project = Project::load(&root).expect("load");
    assert_eq!(
        project.agent_names().collect::<Vec<_>>(),
        vec!["example-agent", "summarizer"]
    );
    // Unrelated manifest sections are preserved.
    let manifest: serde_yaml::Value =
        serde_yaml::from_str(&fs::read_to_string(root.join("aiswarm.yaml")).expect("read"))
            .expect("yaml");
    assert!(manifest["services"]["message_queue"].is_mapping());
}

#[test]
fn create_agent_rejects_duplicates_and_bad_names() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = init_project(&options(tmp.path())).expect("init");
    let before = fs::read_to_string(root.join("aiswarm.yaml")).expect("read");

    let dup = create_agent(&root, "example-agent", AgentTemplate::Basic).expect_err("duplicate");
    assert!(matches!(dup, SwarmError::ProjectInit(_)));

    let bad = create_agent(&root, "Bad_Name", AgentTemplate::Basic).expect_err("bad name");
    assert!(matches!(bad, SwarmError::Manifest(_)));
    assert!(!root.join("agents/Bad_Name").exists());

    assert_eq!(fs::read_to_string(root.join("aiswarm.yaml")).expect("read"), before);
}

#[test]
fn active_agent_round_trip() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = init_project(&options(tmp.path())).expect("init");
    let project = Project::load(&root).expect("load");
    let state_dir = project.state_dir();

    assert_eq!(active_agent(&state_dir).expect("read"), None);
    set_active_agent(&project, &state_dir, "example-agent").expect("use");
    assert_eq!(
        active_agent(&state_dir).expect("read").as_deref(),
        Some("example-agent")
    );

    let err = set_active_agent(&project, &state_dir, "ghost").expect_err("unknown");
    assert!(matches!(err, SwarmError::UnknownAgent(_)));
}
