//! Control-plane boundary shared by the cloud backends.
//!
//! AWS, GCP and Azure targets translate a [`TargetSpec`] into a
//! [`CloudRequest`] and hand it to a [`CloudApi`]. Cloud SDK calls happen on
//! the far side of that trait. [`HttpControlPlane`] forwards requests to a
//! gateway speaking a small JSON protocol.

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};

use super::{Observed, ProviderError};

/// Desired state of one cloud resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudRequest {
    pub resource_id: String,
    /// Resource type understood by the control plane, e.g. `ecs-service`.
    pub resource_type: String,
    pub replicas: u32,
    /// `repository:tag` to run.
    pub image: String,
    /// Provider-native resource definition.
    pub body: serde_json::Value,
}

/// Live state of one cloud resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudResource {
    pub resource_id: String,
    #[serde(default)]
    pub ready_replicas: u32,
    #[serde(default)]
    pub image: Option<String>,
}

impl From<CloudResource> for Observed {
    fn from(r: CloudResource) -> Self {
        Observed {
            ready_replicas: r.ready_replicas,
            image: r.image,
        }
    }
}

/// Cloud control plane (external collaborator).
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn describe(&self, resource_id: &str) -> Result<Option<CloudResource>, ProviderError>;

    /// Create or update the resource to match `request`.
    async fn put(&self, request: &CloudRequest) -> Result<CloudResource, ProviderError>;

    /// `false` when the resource did not exist.
    async fn delete(&self, resource_id: &str) -> Result<bool, ProviderError>;
}

/// Forwards requests to `<base>/v1/resources/<resource-id>`.
pub struct HttpControlPlane {
    base: Url,
    http: reqwest::Client,
}

impl HttpControlPlane {
    pub fn new(base_url: &str) -> Result<Self, ProviderError> {
        let base = Url::parse(base_url)
            .map_err(|e| ProviderError::unavailable(format!("bad control-plane url: {e}")))?;
        let http = reqwest::Client::builder()
            .user_agent(concat!("aiswarm/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::unavailable(e.to_string()))?;
        Ok(Self { base, http })
    }

    /// The resource id becomes a single percent-encoded path segment.
    pub fn resource_url(&self, resource_id: &str) -> Result<Url, ProviderError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ProviderError::unavailable("control-plane url cannot be a base"))?
            .pop_if_empty()
            .extend(["v1", "resources", resource_id]);
        Ok(url)
    }

    fn classify(resource_id: &str, status: StatusCode, body: String) -> ProviderError {
        if status.is_client_error() {
            ProviderError::Rejected {
                agent: resource_id.to_string(),
                detail: format!("{status}: {body}"),
            }
        } else {
            ProviderError::unavailable(format!("{status}: {body}"))
        }
    }
}

#[async_trait]
impl CloudApi for HttpControlPlane {
    async fn describe(&self, resource_id: &str) -> Result<Option<CloudResource>, ProviderError> {
        let response = self
            .http
            .get(self.resource_url(resource_id)?)
            .send()
            .await
            .map_err(|e| ProviderError::unavailable(e.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => response
                .json()
                .await
                .map(Some)
                .map_err(|e| ProviderError::unavailable(format!("bad describe response: {e}"))),
            s => Err(Self::classify(
                resource_id,
                s,
                response.text().await.unwrap_or_default(),
            )),
        }
    }

    async fn put(&self, request: &CloudRequest) -> Result<CloudResource, ProviderError> {
        let response = self
            .http
            .put(self.resource_url(&request.resource_id)?)
            .json(request)
            .send()
            .await
            .map_err(|e| ProviderError::unavailable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Self::classify(
                &request.resource_id,
                status,
                response.text().await.unwrap_or_default(),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| ProviderError::unavailable(format!("bad put response: {e}")))
    }

    async fn delete(&self, resource_id: &str) -> Result<bool, ProviderError> {
        let response = self
            .http
            .delete(self.resource_url(resource_id)?)
            .send()
            .await
            .map_err(|e| ProviderError::unavailable(e.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            s => Err(Self::classify(
                resource_id,
                s,
                response.text().await.unwrap_or_default(),
            )),
        }
    }
}
