//! AWS backend: one ECS Fargate service per agent.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use swarm_state::ProviderKind;

use super::cloud::{CloudApi, CloudRequest};
use super::{Observed, ProviderError, Target, TargetSpec};
use crate::domain::manifest::ResourceRequest;

/// Task CPU sizes Fargate accepts, in CPU units (1024 = 1 vCPU).
const FARGATE_CPU_UNITS: [u32; 7] = [256, 512, 1024, 2048, 4096, 8192, 16384];

/// Smallest Fargate CPU size covering the request.
pub fn cpu_units(resources: &ResourceRequest) -> u32 {
    let wanted = (u64::from(resources.cpu.millis()) * 1024).div_ceil(1000);
    FARGATE_CPU_UNITS
        .iter()
        .copied()
        .find(|&units| u64::from(units) >= wanted)
        .unwrap_or(FARGATE_CPU_UNITS[FARGATE_CPU_UNITS.len() - 1])
}

/// Task memory in MiB, rounded up to a 512 MiB step.
pub fn memory_mib(resources: &ResourceRequest) -> u64 {
    resources.memory.mebibytes().div_ceil(512).max(1) * 512
}

pub struct AwsTarget {
    api: Arc<dyn CloudApi>,
    cluster: String,
    region: String,
}

impl AwsTarget {
    /// The ECS cluster is named after the project.
    pub fn new(api: Arc<dyn CloudApi>, project: &str, region: impl Into<String>) -> Self {
        Self {
            api,
            cluster: project.to_string(),
            region: region.into(),
        }
    }

    fn service_name(&self, agent: &str) -> String {
        format!("{}-{}", self.cluster, agent)
    }

    pub fn request(&self, spec: &TargetSpec) -> CloudRequest {
        let name = self.service_name(&spec.agent);
        CloudRequest {
            resource_id: self.resource_id(&spec.agent),
            resource_type: "ecs-service".to_string(),
            replicas: spec.replicas,
            image: spec.image.tagged(),
            body: json!({
                "region": self.region,
                "cluster": self.cluster,
                "serviceName": name,
                "desiredCount": spec.replicas,
                "launchType": "FARGATE",
                "taskDefinition": {
                    "family": name,
                    "networkMode": "awsvpc",
                    "requiresCompatibilities": ["FARGATE"],
                    "cpu": cpu_units(&spec.resources).to_string(),
                    "memory": memory_mib(&spec.resources).to_string(),
                    "containerDefinitions": [{
                        "name": spec.agent,
                        "image": spec.image.tagged(),
                        "essential": true,
                        "dockerLabels": { "org.aiswarm.digest": spec.image.digest },
                    }],
                },
            }),
        }
    }
}

#[async_trait]
impl Target for AwsTarget {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Aws
    }

    fn resource_id(&self, agent: &str) -> String {
        format!("ecs:{}:{}/{}", self.region, self.cluster, self.service_name(agent))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::quantity::{CpuQuantity, MemoryQuantity};
    use crate::fakes::MemoryCloudApi;
    use swarm_state::ImageRef;

    fn resources(millis: u32, mib: u64) -> ResourceRequest {
        ResourceRequest {
            cpu: CpuQuantity::from_millis(millis),
            memory: MemoryQuantity::from_bytes(mib * 1024 * 1024),
        }
    }

    #[test]
    fn test_cpu_units_round_up_to_fargate_sizes() {
        assert_eq!(cpu_units(&resources(250, 512)), 256);
        assert_eq!(cpu_units(&resources(500, 512)), 512);
        assert_eq!(cpu_units(&resources(1000, 512)), 1024);
        assert_eq!(cpu_units(&resources(1500, 512)), 2048);
        assert_eq!(cpu_units(&resources(64000, 512)), 16384);
    }

    #[test]
    fn test_memory_rounds_to_512_steps() {
        assert_eq!(memory_mib(&resources(500, 512)), 512);
        assert_eq!(memory_mib(&resources(500, 600)), 1024);
        assert_eq!(memory_mib(&resources(500, 100)), 512);
    }

    #[test]
    fn test_request_translation() {
        let target = AwsTarget::new(Arc::new(MemoryCloudApi::new()), "demo", "eu-west-1");
        let spec = TargetSpec {
            agent: "triage".to_string(),
            image: ImageRef::new("r/demo/triage", "abc", "sha256:abc"),
            replicas: 3,
            resources: resources(500, 1024),
        };
        let req = target.request(&spec);
        assert_eq!(req.resource_id, "ecs:eu-west-1:demo/demo-triage");
        assert_eq!(req.body["desiredCount"], 3);
        assert_eq!(req.body["taskDefinition"]["cpu"], "512");
        assert_eq!(req.body["taskDefinition"]["memory"], "1024");
        assert_eq!(
            req.body["taskDefinition"]["containerDefinitions"][0]["image"],
            "r/demo/triage:abc"
        );
    }
}
