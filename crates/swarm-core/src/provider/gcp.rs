//! GCP backend: one Cloud Run service per agent.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use swarm_state::ProviderKind;

use super::cloud::{CloudApi, CloudRequest};
use super::{Observed, ProviderError, Target, TargetSpec};

pub struct GcpTarget {
    api: Arc<dyn CloudApi>,
    project: String,
    region: String,
}

impl GcpTarget {
    /// The GCP project id is taken to be the swarm project name.
    pub fn new(api: Arc<dyn CloudApi>, project: &str, region: impl Into<String>) -> Self {
        Self {
            api,
            project: project.to_string(),
            region: region.into(),
        }
    }

    pub fn request(&self, spec: &TargetSpec) -> CloudRequest {
        CloudRequest {
            resource_id: self.resource_id(&spec.agent),
            resource_type: "cloud-run-service".to_string(),
            replicas: spec.replicas,
            image: spec.image.tagged(),
            body: json!({
                "labels": {
                    "aiswarm-project": self.project,
                    "aiswarm-agent": spec.agent,
                },
                "template": {
                    "containers": [{
                        "image": spec.image.tagged(),
                        "resources": {
                            "limits": {
                                "cpu": format!("{}m", spec.resources.cpu.millis()),
                                "memory": format!("{}Mi", spec.resources.memory.mebibytes()),
                            },
                        },
                    }],
                    "scaling": {
                        "minInstanceCount": spec.replicas,
                        "maxInstanceCount": spec.replicas,
                    },
                },
            }),
        }
    }
}

#[async_trait]
impl Target for GcpTarget {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gcp
    }

    fn resource_id(&self, agent: &str) -> String {
        format!(
            "projects/{}/locations/{}/services/{}",
            self.project, self.region, agent
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::manifest::ResourceRequest;
    use crate::fakes::MemoryCloudApi;
    use swarm_state::ImageRef;

    #[test]
    fn test_request_translation() {
        let target = GcpTarget::new(Arc::new(MemoryCloudApi::new()), "demo", "us-east1");
        let spec = TargetSpec {
            agent: "triage".to_string(),
            image: ImageRef::new("gcr.io/demo/triage", "abc", "sha256:abc"),
            replicas: 2,
            resources: ResourceRequest::default(),
        };
        let req = target.request(&spec);
        assert_eq!(req.resource_id, "projects/demo/locations/us-east1/services/triage");
        let limits = &req.body["template"]["containers"][0]["resources"]["limits"];
        assert_eq!(limits["cpu"], "500m");
        assert_eq!(limits["memory"], "512Mi");
        assert_eq!(req.body["template"]["scaling"]["minInstanceCount"], 2);
        assert_eq!(req.body["template"]["scaling"]["maxInstanceCount"], 2);
    }
}
