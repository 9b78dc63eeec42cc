//! `agent test`: build one agent, run a single local replica, tear it down.
//!
//! The replica runs under a separate compose project, `<project>-test`, so
//! it never touches a real local deployment of the same agent.

use std::sync::Arc;

use swarm_state::{DeploymentRecord, DeploymentStatus, ImageRef, ProviderKind};
use tracing::{info, warn};

use crate::build::{BuildContext, BuildPipeline};
use crate::domain::{Project, Result, SwarmError};
use crate::provider::{ComposeRuntime, LocalTarget, Provider, ProviderError, ReconcilingProvider};

#[derive(Debug, Clone)]
pub struct SmokeReport {
    pub agent: String,
    pub image: ImageRef,
    pub cached: bool,
    /// What the test replica converged to.
    pub record: DeploymentRecord,
    /// `false` when the test replica could not be removed.
    pub cleaned_up: bool,
}

impl SmokeReport {
    pub fn passed(&self) -> bool {
        self.record.status == DeploymentStatus::Healthy && self.cleaned_up
    }
}

/// Compose project name the test replicas run under.
pub fn test_project_name(project: &Project) -> String {
    format!("{}-test", project.name)
}

pub async fn smoke_test(
    project: &Project,
    agent: &str,
    pipeline: &BuildPipeline,
    runtime: Arc<dyn ComposeRuntime>,
) -> Result<SmokeReport> {
    let spec = project
        .agent(agent)
        .ok_or_else(|| SwarmError::UnknownAgent(agent.to_string()))?;

    let ctx = BuildContext::for_project(project);
    let built = pipeline.build(spec, &ctx).await.outcome?;

    let provider = ReconcilingProvider::new(LocalTarget::new(test_project_name(project), runtime))
        .with_resources([(spec.name.clone(), spec.resources)]);
    let desired = DeploymentRecord::desired(&spec.name, ProviderKind::Local, 1, built.image.clone());

    let applied = provider.apply(&desired).await;
    let cleaned_up = match provider.remove(&spec.name).await {
        Ok(()) | Err(ProviderError::NotFound { .. }) => true,
        Err(e) => {
            warn!(agent = %spec.name, error = %e, "test replica left running");
            false
        }
    };
    let record = applied?;

    info!(
        agent = %spec.name,
        image = %built.image,
        status = %record.status,
        "agent test finished"
    );
    Ok(SmokeReport {
        agent: spec.name.clone(),
        image: built.image,
        cached: built.cached,
        record,
        cleaned_up,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::BuildConfig;
    use crate::fakes::{MemoryBuildEngine, MemoryComposeRuntime};

    fn fixture() -> (tempfile::TempDir, Project) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("aiswarm.yaml"),
            "project:\n  name: demo\nagents:\n  - name: triage\n    replicas: 3\n",
        )
        .unwrap();
        let src = dir.path().join("agents/triage");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("Dockerfile"), "FROM python:3.11-slim\n").unwrap();
        let project = Project::load(dir.path()).unwrap();
        (dir, project)
    }

    fn pipeline(engine: MemoryBuildEngine) -> BuildPipeline {
        BuildPipeline::new(Arc::new(engine), BuildConfig::default())
    }

    #[tokio::test]
    async fn test_single_replica_up_then_down() {
        let (_dir, project) = fixture();
        let runtime = Arc::new(MemoryComposeRuntime::new());

        let report = smoke_test(&project, "triage", &pipeline(MemoryBuildEngine::new()), runtime.clone())
            .await
            .unwrap();

        assert!(report.passed());
        assert_eq!(report.record.desired_replicas, 1);
        assert_eq!(runtime.upped(), vec!["demo-test-triage".to_string()]);
        assert_eq!(runtime.downs(), 1);
        assert!(runtime.service("demo-test-triage").is_none());
    }

    #[tokio::test]
    async fn test_degraded_replica_fails_but_is_removed() {
        let (_dir, project) = fixture();
        let runtime = Arc::new(MemoryComposeRuntime::new());
        runtime.degrade_next_ups(1);

        let report = smoke_test(&project, "triage", &pipeline(MemoryBuildEngine::new()), runtime.clone())
            .await
            .unwrap();

        assert_eq!(report.record.status, DeploymentStatus::Degraded);
        assert!(!report.passed());
        assert!(report.cleaned_up);
    }

    #[tokio::test]
    async fn test_build_failure_runs_nothing() {
        let (_dir, project) = fixture();
        let runtime = Arc::new(MemoryComposeRuntime::new());
        let engine = MemoryBuildEngine::new().failing("triage");

        let err = smoke_test(&project, "triage", &pipeline(engine), runtime.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, SwarmError::Build(_)));
        assert_eq!(runtime.ups(), 0);
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let (_dir, project) = fixture();
        let runtime = Arc::new(MemoryComposeRuntime::new());
        let err = smoke_test(&project, "ghost", &pipeline(MemoryBuildEngine::new()), runtime)
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmError::UnknownAgent(_)));
    }
}
