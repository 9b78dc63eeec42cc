//! Provider abstraction: converge an agent's deployment on one backend.
//!
//! Every backend implements the small [`Target`] trait (observe, converge,
//! delete). [`ReconcilingProvider`] wraps a target and supplies the
//! [`Provider`] contract on top of it:
//!
//! - `apply` observes first and makes no mutation call when the live state
//!   already matches the desired record;
//! - a partial convergence is reported as `Degraded` and never replaces the
//!   last-known-good record that concurrent `status` readers see.

pub mod aws;
pub mod azure;
pub mod cloud;
pub mod gcp;
pub mod local;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use swarm_state::{DeploymentRecord, DeploymentStatus, ImageRef, ProviderKind};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::domain::manifest::{Project, ResourceRequest};
use crate::metrics::METRICS;

pub use aws::AwsTarget;
pub use azure::AzureTarget;
pub use cloud::{CloudApi, CloudRequest, CloudResource, HttpControlPlane};
pub use gcp::GcpTarget;
pub use local::{ComposeRuntime, ComposeService, DockerComposeRuntime, LocalTarget, ServiceState};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("agent {agent} is not deployed")]
    NotFound { agent: String },

    #[error("invalid deployment request for {agent}: {reason}")]
    InvalidRequest { agent: String, reason: String },

    #[error("backend rejected {agent}: {detail}")]
    Rejected { agent: String, detail: String },

    #[error("backend unavailable: {detail}")]
    Unavailable { detail: String },

    #[error("apply of {agent} timed out after {secs}s")]
    TimedOut { agent: String, secs: u64 },
}

impl ProviderError {
    pub fn unavailable(detail: impl Into<String>) -> Self {
        ProviderError::Unavailable {
            detail: detail.into(),
        }
    }
}

/// Uniform deployment interface. The orchestrator never branches on the
/// concrete backend.
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Converge toward `desired`; returns the observed record.
    async fn apply(&self, desired: &DeploymentRecord) -> Result<DeploymentRecord, ProviderError>;

    /// Read-only view of an agent's deployment.
    async fn status(&self, agent: &str) -> Result<DeploymentRecord, ProviderError>;

    async fn remove(&self, agent: &str) -> Result<(), ProviderError>;
}

/// What a backend is asked to run for one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub agent: String,
    pub image: ImageRef,
    pub replicas: u32,
    pub resources: ResourceRequest,
}

/// Live state of one agent as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observed {
    pub ready_replicas: u32,
    /// Image reference (`repository:tag`) currently running.
    pub image: Option<String>,
}

/// One deployment backend.
#[async_trait]
pub trait Target: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Backend identifier of the agent's deployment.
    fn resource_id(&self, agent: &str) -> String;

    /// `None` when nothing is deployed for `agent`.
    async fn observe(&self, agent: &str) -> Result<Option<Observed>, ProviderError>;

    /// Request the backend to run `spec`; returns what it reports afterwards.
    async fn converge(&self, spec: &TargetSpec) -> Result<Observed, ProviderError>;

    /// `false` when nothing was deployed.
    async fn delete(&self, agent: &str) -> Result<bool, ProviderError>;
}

/// Split `repo:tag` back into an [`ImageRef`] with an unknown digest.
pub fn image_from_reference(reference: &str) -> ImageRef {
    match reference.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => ImageRef::new(repo, tag, ""),
        _ => ImageRef::new(reference, "latest", ""),
    }
}

pub struct ReconcilingProvider<T: Target> {
    target: T,
    resources: HashMap<String, ResourceRequest>,
    known_good: RwLock<HashMap<String, DeploymentRecord>>,
}

impl<T: Target> ReconcilingProvider<T> {
    pub fn new(target: T) -> Self {
        Self {
            target,
            resources: HashMap::new(),
            known_good: RwLock::new(HashMap::new()),
        }
    }

    /// Resource requests per agent; agents not listed get the defaults.
    pub fn with_resources<I>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = (String, ResourceRequest)>,
    {
        self.resources.extend(resources);
        self
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub async fn last_known_good(&self, agent: &str) -> Option<DeploymentRecord> {
        self.known_good.read().await.get(agent).cloned()
    }

    /// A scaled-to-zero workload has nothing running to compare images with.
    fn converged(desired: &DeploymentRecord, wanted: &str, observed: Option<&Observed>) -> bool {
        match observed {
            None => desired.desired_replicas == 0,
            Some(live) if desired.desired_replicas == 0 => live.ready_replicas == 0,
            Some(live) => {
                live.ready_replicas == desired.desired_replicas
                    && live.image.as_deref() == Some(wanted)
            }
        }
    }

    fn healthy(&self, desired: &DeploymentRecord, image: &ImageRef) -> DeploymentRecord {
        DeploymentRecord {
            agent: desired.agent.clone(),
            provider: self.target.kind(),
            desired_replicas: desired.desired_replicas,
            observed_replicas: desired.desired_replicas,
            image: Some(image.clone()),
            status: DeploymentStatus::Healthy,
            last_error: None,
        }
    }
}

#[async_trait]
impl<T: Target> Provider for ReconcilingProvider<T> {
    fn kind(&self) -> ProviderKind {
        self.target.kind()
    }

    async fn apply(&self, desired: &DeploymentRecord) -> Result<DeploymentRecord, ProviderError> {
        let agent = desired.agent.as_str();
        let image = desired
            .image
            .clone()
            .ok_or_else(|| ProviderError::InvalidRequest {
                agent: agent.to_string(),
                reason: "no image to deploy".to_string(),
            })?;
        let wanted = image.tagged();

        let live = self.target.observe(agent).await?;
        if Self::converged(desired, &wanted, live.as_ref()) {
            debug!(agent, resource = %self.target.resource_id(agent), "already converged");
            let record = self.healthy(desired, &image);
            self.known_good
                .write()
                .await
                .insert(agent.to_string(), record.clone());
            return Ok(record);
        }

        METRICS.inc_applies();
        let spec = TargetSpec {
            agent: agent.to_string(),
            image: image.clone(),
            replicas: desired.desired_replicas,
            resources: self.resources.get(agent).copied().unwrap_or_default(),
        };
        info!(
            agent,
            provider = %self.target.kind(),
            resource = %self.target.resource_id(agent),
            replicas = spec.replicas,
            image = %wanted,
            "applying"
        );
        let observed = self.target.converge(&spec).await?;

        if Self::converged(desired, &wanted, Some(&observed)) {
            let record = self.healthy(desired, &image);
            self.known_good
                .write()
                .await
                .insert(agent.to_string(), record.clone());
            return Ok(record);
        }

        warn!(
            agent,
            ready = observed.ready_replicas,
            desired = desired.desired_replicas,
            "partial convergence"
        );
        Ok(DeploymentRecord {
            agent: agent.to_string(),
            provider: self.target.kind(),
            desired_replicas: desired.desired_replicas,
            observed_replicas: observed.ready_replicas,
            image: Some(image),
            status: DeploymentStatus::Degraded,
            last_error: Some(format!(
                "{}/{} replicas ready{}",
                observed.ready_replicas,
                desired.desired_replicas,
                match observed.image.as_deref() {
                    Some(running) if running != wanted => format!(", running {running}"),
                    _ => String::new(),
                }
            )),
        })
    }

    async fn status(&self, agent: &str) -> Result<DeploymentRecord, ProviderError> {
        let live = self
            .target
            .observe(agent)
            .await?
            .ok_or_else(|| ProviderError::NotFound {
                agent: agent.to_string(),
            })?;
        let known = self.known_good.read().await.get(agent).cloned();

        let desired_replicas = known
            .as_ref()
            .map_or(live.ready_replicas, |k| k.desired_replicas);
        let image = match (&known, live.image.as_deref()) {
            (Some(k), Some(running)) => match &k.image {
                Some(img) if img.tagged() == running => Some(img.clone()),
                _ => Some(image_from_reference(running)),
            },
            (_, Some(running)) => Some(image_from_reference(running)),
            (Some(k), None) => k.image.clone(),
            (None, None) => None,
        };
        let status = if live.ready_replicas == desired_replicas {
            DeploymentStatus::Healthy
        } else {
            DeploymentStatus::Degraded
        };
        Ok(DeploymentRecord {
            agent: agent.to_string(),
            provider: self.target.kind(),
            desired_replicas,
            observed_replicas: live.ready_replicas,
            image,
            status,
            last_error: None,
        })
    }

    async fn remove(&self, agent: &str) -> Result<(), ProviderError> {
        if !self.target.delete(agent).await? {
            return Err(ProviderError::NotFound {
                agent: agent.to_string(),
            });
        }
        self.known_good.write().await.remove(agent);
        info!(agent, provider = %self.target.kind(), "removed");
        Ok(())
    }
}

/// Collaborators the providers delegate to.
#[derive(Clone)]
pub struct ProviderDeps {
    pub compose: Arc<dyn ComposeRuntime>,
    /// Control-plane connector for the cloud backends.
    pub cloud: Option<Arc<dyn CloudApi>>,
}

/// Build the provider for `kind`, configured with the project's resources.
pub fn create_provider(
    project: &Project,
    kind: ProviderKind,
    deps: ProviderDeps,
) -> Result<Arc<dyn Provider>, ProviderError> {
    let resources: Vec<(String, ResourceRequest)> = project
        .agents
        .iter()
        .map(|a| (a.name.clone(), a.resources))
        .collect();
    let region = project.infrastructure.region.clone();
    let cloud = || {
        deps.cloud.clone().ok_or_else(|| {
            ProviderError::unavailable(format!(
                "no control-plane connector configured for provider '{kind}'"
            ))
        })
    };

    let provider: Arc<dyn Provider> = match kind {
        ProviderKind::Local => Arc::new(
            ReconcilingProvider::new(LocalTarget::new(&project.name, deps.compose.clone()))
                .with_resources(resources),
        ),
        ProviderKind::Aws => Arc::new(
            ReconcilingProvider::new(AwsTarget::new(cloud()?, &project.name, region))
                .with_resources(resources),
        ),
        ProviderKind::Gcp => Arc::new(
            ReconcilingProvider::new(GcpTarget::new(cloud()?, &project.name, region))
                .with_resources(resources),
        ),
        ProviderKind::Azure => Arc::new(
            ReconcilingProvider::new(AzureTarget::new(cloud()?, &project.name, region))
                .with_resources(resources),
        ),
    };
    Ok(provider)
}
