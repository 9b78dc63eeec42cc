//! Persisted record types.
//!
//! Everything here is written to disk and read back by later (possibly newer)
//! binaries, so every optional field carries `#[serde(default)]` and no type
//! uses `deny_unknown_fields`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StateError;

/// Current on-disk schema version of [`SwarmRunState`].
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Content-addressed container image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    /// Repository path, e.g. `registry.example.com/support-swarm/triage`.
    pub repository: String,
    /// Tag derived from the content digest.
    pub tag: String,
    /// `sha256:<hex>` digest of the build inputs.
    pub digest: String,
}

impl ImageRef {
    pub fn new(
        repository: impl Into<String>,
        tag: impl Into<String>,
        digest: impl Into<String>,
    ) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
            digest: digest.into(),
        }
    }

    /// `repository:tag`, the form handed to container engines.
    pub fn tagged(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }

    /// Same repository, different tag. Used when publishing a semantic tag.
    pub fn retagged(&self, tag: impl Into<String>) -> Self {
        Self {
            repository: self.repository.clone(),
            tag: tag.into(),
            digest: self.digest.clone(),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// Deployment target backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Local,
    Aws,
    Gcp,
    Azure,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Local => "local",
            ProviderKind::Aws => "aws",
            ProviderKind::Gcp => "gcp",
            ProviderKind::Azure => "azure",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = StateError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "compose" | "docker-compose" => Ok(ProviderKind::Local),
            "aws" => Ok(ProviderKind::Aws),
            "gcp" | "google" => Ok(ProviderKind::Gcp),
            "azure" => Ok(ProviderKind::Azure),
            other => Err(StateError::UnknownProvider(other.to_string())),
        }
    }
}

/// Reconciliation status of a deployed agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Applying,
    Healthy,
    Degraded,
    Failed,
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Applying => "applying",
            DeploymentStatus::Healthy => "healthy",
            DeploymentStatus::Degraded => "degraded",
            DeploymentStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Desired and observed state of one agent on one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub agent: String,
    pub provider: ProviderKind,
    pub desired_replicas: u32,
    #[serde(default)]
    pub observed_replicas: u32,
    /// Last image applied (or requested, for a desired record).
    #[serde(default)]
    pub image: Option<ImageRef>,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl DeploymentRecord {
    /// A desired-state record, as handed to a provider's `apply`.
    pub fn desired(
        agent: impl Into<String>,
        provider: ProviderKind,
        replicas: u32,
        image: ImageRef,
    ) -> Self {
        Self {
            agent: agent.into(),
            provider,
            desired_replicas: replicas,
            observed_replicas: 0,
            image: Some(image),
            status: DeploymentStatus::Pending,
            last_error: None,
        }
    }

    /// True when this observed record already satisfies `desired`.
    pub fn satisfies(&self, desired: &DeploymentRecord) -> bool {
        self.status == DeploymentStatus::Healthy
            && self.observed_replicas == desired.desired_replicas
            && self.desired_replicas == desired.desired_replicas
            && self.image_digest() == desired.image_digest()
    }

    pub fn image_digest(&self) -> Option<&str> {
        self.image.as_ref().map(|i| i.digest.as_str())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            DeploymentStatus::Healthy | DeploymentStatus::Failed
        )
    }
}

/// Aggregate persisted state of one project.
///
/// Written only by the orchestrator of a run; status/list commands read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmRunState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub project: String,
    /// Deployment records keyed by agent name.
    #[serde(default)]
    pub records: BTreeMap<String, DeploymentRecord>,
    /// Last successfully built image per agent, kept for `registry push`.
    #[serde(default)]
    pub images: BTreeMap<String, ImageRef>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_schema_version() -> u32 {
    STATE_SCHEMA_VERSION
}

impl SwarmRunState {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            project: project.into(),
            records: BTreeMap::new(),
            images: BTreeMap::new(),
            updated_at: None,
        }
    }

    pub fn record(&self, agent: &str) -> Option<&DeploymentRecord> {
        self.records.get(agent)
    }

    /// Agents with a record that the manifest no longer declares.
    pub fn drifted<'a, I>(&self, declared: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let declared: BTreeSet<&str> = declared.into_iter().collect();
        self.records
            .keys()
            .filter(|agent| !declared.contains(agent.as_str()))
            .cloned()
            .collect()
    }

    /// Content equality ignoring the `updated_at` stamp.
    pub fn same_content(&self, other: &SwarmRunState) -> bool {
        self.schema_version == other.schema_version
            && self.project == other.project
            && self.records == other.records
            && self.images == other.images
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(digest: &str) -> ImageRef {
        ImageRef::new("registry.local/demo/alpha", "abc123", digest)
    }

    fn healthy(replicas: u32, digest: &str) -> DeploymentRecord {
        DeploymentRecord {
            agent: "alpha".to_string(),
            provider: ProviderKind::Local,
            desired_replicas: replicas,
            observed_replicas: replicas,
            image: Some(image(digest)),
            status: DeploymentStatus::Healthy,
            last_error: None,
        }
    }

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!("aws".parse::<ProviderKind>().unwrap(), ProviderKind::Aws);
        assert_eq!("AZURE".parse::<ProviderKind>().unwrap(), ProviderKind::Azure);
        assert_eq!(
            "docker-compose".parse::<ProviderKind>().unwrap(),
            ProviderKind::Local
        );
        assert!("heroku".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_satisfies_requires_matching_replicas_and_digest() {
        let observed = healthy(2, "sha256:aa");
        let desired = DeploymentRecord::desired("alpha", ProviderKind::Local, 2, image("sha256:aa"));
        assert!(observed.satisfies(&desired));

        let more = DeploymentRecord::desired("alpha", ProviderKind::Local, 3, image("sha256:aa"));
        assert!(!observed.satisfies(&more));

        let newer = DeploymentRecord::desired("alpha", ProviderKind::Local, 2, image("sha256:bb"));
        assert!(!observed.satisfies(&newer));
    }

    #[test]
    fn test_degraded_never_satisfies() {
        let mut observed = healthy(2, "sha256:aa");
        observed.status = DeploymentStatus::Degraded;
        let desired = DeploymentRecord::desired("alpha", ProviderKind::Local, 2, image("sha256:aa"));
        assert!(!observed.satisfies(&desired));
    }

    #[test]
    fn test_drifted_lists_undeclared_agents() {
        let mut state = SwarmRunState::new("demo");
        state.records.insert("alpha".to_string(), healthy(1, "sha256:aa"));
        let mut beta = healthy(1, "sha256:bb");
        beta.agent = "beta".to_string();
        state.records.insert("beta".to_string(), beta);

        assert_eq!(state.drifted(["alpha"]), vec!["beta".to_string()]);
        assert!(state.drifted(["alpha", "beta"]).is_empty());
    }

    #[test]
    fn test_state_ignores_unknown_fields() {
        let json = r#"{
            "schema_version": 7,
            "project": "demo",
            "records": {},
            "future_field": {"anything": true}
        }"#;
        let state: SwarmRunState = serde_json::from_str(json).expect("forward compatible");
        assert_eq!(state.project, "demo");
        assert_eq!(state.schema_version, 7);
        assert!(state.images.is_empty());
    }

    #[test]
    fn test_same_content_ignores_timestamp() {
        let a = SwarmRunState::new("demo");
        let mut b = a.clone();
        b.updated_at = Some(Utc::now());
        assert!(a.same_content(&b));
        b.images.insert("alpha".to_string(), image("sha256:aa"));
        assert!(!a.same_content(&b));
    }
}
