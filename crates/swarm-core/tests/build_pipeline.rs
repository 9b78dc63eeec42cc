//! Build pipeline: content-addressed tags, caching, failures and timeouts.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use swarm_core::build::{BuildConfig, BuildContext, BuildError, BuildPipeline};
use swarm_core::fakes::MemoryBuildEngine;
use swarm_core::orchestrator::{cancel_pair, CancelSignal};
use swarm_core::{AgentSpec, Project, ResourceRequest};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const MANIFEST: &str = r#"
project:
  name: demo
registry:
  url: https://registry.example.com
agents:
  - name: triage
  - name: responder
  - name: summarizer
"#;

fn project() -> (TempDir, Project) {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("aiswarm.yaml"), MANIFEST).expect("manifest");
    for agent in ["triage", "responder", "summarizer"] {
        let src = dir.path().join("agents").join(agent);
        std::fs::create_dir_all(&src).expect("agent dir");
        std::fs::write(src.join("Dockerfile"), "FROM python:3.11-slim\n").expect("dockerfile");
        std::fs::write(src.join("main.py"), "print('hello')\n").expect("main.py");
    }
    let project = Project::load(dir.path()).expect("load");
    (dir, project)
}

fn pipeline(engine: Arc<MemoryBuildEngine>) -> BuildPipeline {
    BuildPipeline::new(
        engine,
        BuildConfig {
            max_parallel: 2,
            timeout: Duration::from_secs(5),
            log_tail_lines: 2,
        },
    )
}

fn agent(project: &Project, name: &str) -> AgentSpec {
    project.agent(name).expect("declared").clone()
}

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tag_is_derived_from_content() {
    let (dir, project) = project();
    let ctx = BuildContext::for_project(&project);
    let pipeline = pipeline(Arc::new(MemoryBuildEngine::new()));
    let triage = agent(&project, "triage");

    let first = pipeline.derive_image(&triage, &ctx).await.expect("derive");
    let again = pipeline.derive_image(&triage, &ctx).await.expect("derive");
    assert_eq!(first, again);
    assert_eq!(first.repository, "registry.example.com/demo/triage");
    assert_eq!(first.tag.len(), 12);
    assert!(first.tag.chars().all(|c| c.is_ascii_hexdigit()));
    assert!(first.digest.starts_with(&format!("sha256:{}", first.tag)));

    std::fs::write(
        dir.path().join("agents/triage/main.py"),
        "print('changed')\n",
    )
    .expect("edit");
    let edited = pipeline.derive_image(&triage, &ctx).await.expect("derive");
    assert_ne!(edited.tag, first.tag);
}

#[tokio::test]
async fn identical_sources_differ_per_agent() {
    let (_dir, project) = project();
    let ctx = BuildContext::for_project(&project);
    let pipeline = pipeline(Arc::new(MemoryBuildEngine::new()));
    let a = pipeline
        .derive_image(&agent(&project, "triage"), &ctx)
        .await
        .expect("derive");
    let b = pipeline
        .derive_image(&agent(&project, "responder"), &ctx)
        .await
        .expect("derive");
    assert_ne!(a.tag, b.tag);
}

#[tokio::test]
async fn build_args_change_the_tag() {
    let (_dir, project) = project();
    let ctx = BuildContext::for_project(&project);
    let pipeline = pipeline(Arc::new(MemoryBuildEngine::new()));
    let plain = agent(&project, "triage");
    let mut with_args = plain.clone();
    with_args.build_args = BTreeMap::from([("PYTHON_VERSION".to_string(), "3.12".to_string())]);

    let a = pipeline.derive_image(&plain, &ctx).await.expect("derive");
    let b = pipeline.derive_image(&with_args, &ctx).await.expect("derive");
    assert_ne!(a.tag, b.tag);
}

#[tokio::test]
async fn hidden_and_cache_files_do_not_change_the_tag() {
    let (dir, project) = project();
    let ctx = BuildContext::for_project(&project);
    let pipeline = pipeline(Arc::new(MemoryBuildEngine::new()));
    let triage = agent(&project, "triage");
    let before = pipeline.derive_image(&triage, &ctx).await.expect("derive");

    let src = dir.path().join("agents/triage");
    std::fs::write(src.join(".DS_Store"), "junk").expect("hidden");
    std::fs::create_dir_all(src.join("__pycache__")).expect("pycache");
    std::fs::write(src.join("__pycache__/main.cpython-311.pyc"), "bytes").expect("pyc");

    let after = pipeline.derive_image(&triage, &ctx).await.expect("derive");
    assert_eq!(before, after);
}

// ---------------------------------------------------------------------------
// Caching
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unchanged_sources_are_not_rebuilt() {
    let (_dir, project) = project();
    let ctx = BuildContext::for_project(&project);
    let engine = Arc::new(MemoryBuildEngine::new());
    let triage = agent(&project, "triage");

    let first = pipeline(engine.clone()).build(&triage, &ctx).await;
    assert!(first.is_success());
    assert!(!first.cached());

    let same_process = pipeline(engine.clone());
    same_process.build(&triage, &ctx).await;
    let second = same_process.build(&triage, &ctx).await;
    assert!(second.cached());
    assert_eq!(second.image(), first.image());
    assert_eq!(engine.builds(), 1);
}

#[tokio::test]
async fn pruned_engine_rebuilds() {
    let (_dir, project) = project();
    let ctx = BuildContext::for_project(&project);
    let engine = Arc::new(MemoryBuildEngine::new());
    let triage = agent(&project, "triage");

    pipeline(engine.clone()).build(&triage, &ctx).await;
    engine.prune();
    let rebuilt = pipeline(engine.clone()).build(&triage, &ctx).await;
    assert!(!rebuilt.cached());
    assert_eq!(engine.builds(), 2);
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn engine_failure_carries_log_tail() {
    let (_dir, project) = project();
    let ctx = BuildContext::for_project(&project);
    let pipeline = pipeline(Arc::new(MemoryBuildEngine::new().failing("triage")));
    let result = pipeline.build(&agent(&project, "triage"), &ctx).await;

    match result.outcome {
        Err(BuildError::EngineFailed { agent, log, .. }) => {
            assert_eq!(agent, "triage");
            assert_eq!(log.lines().count(), 2);
            assert!(log.ends_with("error: triage does not build"));
        }
        other => panic!("expected engine failure, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_source_is_reported() {
    let (_dir, project) = project();
    let ctx = BuildContext::for_project(&project);
    let pipeline = pipeline(Arc::new(MemoryBuildEngine::new()));
    let ghost = AgentSpec {
        name: "ghost".to_string(),
        source_path: PathBuf::from("agents/ghost"),
        replicas: 1,
        resources: ResourceRequest::default(),
        build_args: BTreeMap::new(),
        depends_on: Vec::new(),
    };
    let result = pipeline.build(&ghost, &ctx).await;
    assert!(matches!(
        result.outcome,
        Err(BuildError::SourceUnreadable { ref agent, .. }) if agent == "ghost"
    ));
}

#[tokio::test(start_paused = true)]
async fn slow_build_times_out() {
    let (_dir, project) = project();
    let ctx = BuildContext::for_project(&project);
    let pipeline = pipeline(Arc::new(
        MemoryBuildEngine::new().with_delay(Duration::from_secs(60)),
    ));
    let result = pipeline.build(&agent(&project, "triage"), &ctx).await;
    assert!(matches!(
        result.outcome,
        Err(BuildError::TimedOut { secs: 5, .. })
    ));
}

#[tokio::test]
async fn build_all_isolates_failures() {
    let (_dir, project) = project();
    let ctx = BuildContext::for_project(&project);
    let engine = Arc::new(MemoryBuildEngine::new().failing("responder"));
    let pipeline = Arc::new(pipeline(engine.clone()));

    let mut rx = pipeline.build_all(project.agents.clone(), ctx, CancelSignal::never());
    let mut results = Vec::new();
    while let Some(result) = rx.recv().await {
        results.push(result);
    }
    results.sort_by(|a, b| a.agent.cmp(&b.agent));

    assert_eq!(results.len(), 3);
    let failed: Vec<&str> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.agent.as_str())
        .collect();
    assert_eq!(failed, vec!["responder"]);
    assert_eq!(engine.built_tags().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancelled_build_all_starts_no_queued_builds() {
    let (_dir, project) = project();
    let ctx = BuildContext::for_project(&project);
    let engine = Arc::new(MemoryBuildEngine::new().with_delay(Duration::from_secs(60)));
    let pipeline = Arc::new(BuildPipeline::new(
        engine.clone(),
        BuildConfig {
            max_parallel: 1,
            timeout: Duration::from_secs(600),
            log_tail_lines: 10,
        },
    ));
    let (handle, signal) = cancel_pair();

    let mut rx = pipeline.build_all(project.agents.clone(), ctx, signal);
    while engine.builds() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.cancel();

    let mut results = Vec::new();
    while let Some(result) = rx.recv().await {
        results.push(result);
    }
    assert_eq!(results.len(), 3);
    assert!(results
        .iter()
        .all(|r| matches!(r.outcome, Err(BuildError::Cancelled { .. }))));

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(engine.builds(), 1, "queued builds never reached the engine");
    assert!(engine.built_tags().is_empty());
}
