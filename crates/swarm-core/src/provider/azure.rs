//! Azure backend: one Container App per agent, in a resource group named
//! after the project.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use swarm_state::ProviderKind;

use super::cloud::{CloudApi, CloudRequest};
use super::{Observed, ProviderError, Target, TargetSpec};
use crate::domain::manifest::ResourceRequest;

/// Container Apps allocate CPU in quarter-core steps.
pub fn cpu_cores(resources: &ResourceRequest) -> f64 {
    let quarters = u64::from(resources.cpu.millis()).div_ceil(250).max(1);
    quarters as f64 * 0.25
}

/// Memory rounded up to a quarter GiB, rendered like `0.5Gi`.
pub fn memory_gi(resources: &ResourceRequest) -> String {
    let quarters = resources.memory.mebibytes().div_ceil(256).max(1);
    let whole = quarters / 4;
    match quarters % 4 {
        0 => format!("{whole}Gi"),
        1 => format!("{whole}.25Gi"),
        2 => format!("{whole}.5Gi"),
        _ => format!("{whole}.75Gi"),
    }
}

pub struct AzureTarget {
    api: Arc<dyn CloudApi>,
    resource_group: String,
    region: String,
}

impl AzureTarget {
    pub fn new(api: Arc<dyn CloudApi>, project: &str, region: impl Into<String>) -> Self {
        Self {
            api,
            resource_group: project.to_string(),
            region: region.into(),
        }
    }

    pub fn request(&self, spec: &TargetSpec) -> CloudRequest {
        CloudRequest {
            resource_id: self.resource_id(&spec.agent),
            resource_type: "container-app".to_string(),
            replicas: spec.replicas,
            image: spec.image.tagged(),
            body: json!({
                "location": self.region,
                "tags": { "aiswarm-digest": spec.image.digest },
                "properties": {
                    "template": {
                        "containers": [{
                            "name": spec.agent,
                            "image": spec.image.tagged(),
                            "resources": {
                                "cpu": cpu_cores(&spec.resources),
                                "memory": memory_gi(&spec.resources),
                            },
                        }],
                        "scale": {
                            "minReplicas": spec.replicas,
                            "maxReplicas": spec.replicas,
                        },
                    },
                },
            }),
        }
    }
}

#[async_trait]
impl Target for AzureTarget {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Azure
    }

    fn resource_id(&self, agent: &str) -> String {
        format!(
            "/resourceGroups/{}/containerApps/{}",
            self.resource_group, agent
        )
    }

    async fn observe(&self, agent: &str) -> Result<Option<Observed>, ProviderError> {
        Ok(self
            .api
            .describe(&self.resource_id(agent))
            .await?
            .map(Observed::from))
    }

    async fn converge(&self, spec: &TargetSpec) -> Result<Observed, ProviderError> {
        Ok(self.api.put(&self.request(spec)).await?.into())
    }

    async fn delete(&self, agent: &str) -> Result<bool, ProviderError> {
        self.api.delete(&self.resource_id(agent)).await
    }
}
