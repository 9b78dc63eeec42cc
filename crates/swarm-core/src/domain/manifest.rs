//! Project manifest (`aiswarm.yaml`): raw serde shape and the validated model.
//!
//! [`validate`] is a pure function from [`RawManifest`] to [`Project`]. It
//! never stops at the first problem; every violation is collected into one
//! [`ManifestError`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use swarm_state::ProviderKind;

use crate::domain::error::{ManifestError, Result, Violation};
use crate::domain::quantity::{CpuQuantity, MemoryQuantity, QuantityError};

/// Manifest file name at the project root.
pub const MANIFEST_FILE: &str = "aiswarm.yaml";

const AGENT_NAME_PATTERN: &str = r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$";
const PROJECT_NAME_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,127}$";

// ---------------------------------------------------------------------------
// Raw shape
// ---------------------------------------------------------------------------

/// A YAML scalar that may have been written as a number or a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::Float(x) => write!(f, "{x}"),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawManifest {
    #[serde(default)]
    pub project: RawProject,
    #[serde(default)]
    pub registry: RawRegistry,
    #[serde(default)]
    pub infrastructure: RawInfrastructure,
    #[serde(default)]
    pub agents: Vec<RawAgent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawProject {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<Scalar>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawRegistry {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawInfrastructure {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawAgent {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub replicas: Option<i64>,
    #[serde(default)]
    pub resources: RawResources,
    #[serde(default)]
    pub build_args: BTreeMap<String, Scalar>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawResources {
    #[serde(default)]
    pub cpu: Option<Scalar>,
    #[serde(default)]
    pub memory: Option<Scalar>,
}

impl RawManifest {
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}

// ---------------------------------------------------------------------------
// Validated model
// ---------------------------------------------------------------------------

/// Registry flavour named in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegistryKind {
    DockerRegistry,
    Ecr,
    Gcr,
    Acr,
    Local,
}

impl RegistryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryKind::DockerRegistry => "docker-registry",
            RegistryKind::Ecr => "ecr",
            RegistryKind::Gcr => "gcr",
            RegistryKind::Acr => "acr",
            RegistryKind::Local => "local",
        }
    }
}

impl FromStr for RegistryKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker-registry" | "docker" | "dockerhub" => Ok(RegistryKind::DockerRegistry),
            "ecr" => Ok(RegistryKind::Ecr),
            "gcr" | "artifact-registry" => Ok(RegistryKind::Gcr),
            "acr" => Ok(RegistryKind::Acr),
            "local" => Ok(RegistryKind::Local),
            other => Err(format!("unknown registry type '{other}'")),
        }
    }
}

impl fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    pub url: Option<String>,
    pub kind: RegistryKind,
}

impl RegistryConfig {
    /// Registry host and path prefix without a URL scheme.
    pub fn host(&self) -> Option<&str> {
        self.url.as_deref().map(|url| {
            url.trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
        })
    }

    /// Repository an agent's images are pushed to.
    pub fn repository_for(&self, project: &str, agent: &str) -> String {
        match self.host() {
            Some(host) if !host.is_empty() => format!("{host}/{project}/{agent}"),
            _ => format!("{project}/{agent}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfrastructureConfig {
    pub provider: ProviderKind,
    pub region: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceRequest {
    pub cpu: CpuQuantity,
    pub memory: MemoryQuantity,
}

/// One agent of the swarm. Immutable once loaded for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSpec {
    pub name: String,
    /// Build context, relative to the project root unless absolute.
    pub source_path: PathBuf,
    pub replicas: u32,
    pub resources: ResourceRequest,
    pub build_args: BTreeMap<String, String>,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub name: String,
    pub version: String,
    pub id: Option<String>,
    pub registry: RegistryConfig,
    pub infrastructure: InfrastructureConfig,
    pub agents: Vec<AgentSpec>,
    /// Directory holding the manifest; relative agent paths resolve here.
    pub root: PathBuf,
}

impl Project {
    /// Read, parse and validate `<dir>/aiswarm.yaml` (or the file itself).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = if path.is_dir() {
            path.join(MANIFEST_FILE)
        } else {
            path.to_path_buf()
        };
        let text = std::fs::read_to_string(&file)?;
        let raw = RawManifest::from_yaml(&text)?;
        let mut project = validate(&raw)?;
        project.root = file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(project)
    }

    pub fn agent(&self, name: &str) -> Option<&AgentSpec> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn agent_names(&self) -> impl Iterator<Item = &str> {
        self.agents.iter().map(|a| a.name.as_str())
    }

    pub fn source_dir(&self, agent: &AgentSpec) -> PathBuf {
        if agent.source_path.is_absolute() {
            agent.source_path.clone()
        } else {
            self.root.join(&agent.source_path)
        }
    }

    /// Default state directory, `<root>/.aiswarm`.
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(".aiswarm")
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a raw manifest, reporting every violation found.
pub fn validate(raw: &RawManifest) -> std::result::Result<Project, ManifestError> {
    let agent_name_re = Regex::new(AGENT_NAME_PATTERN)
        .map_err(|e| ManifestError::single("agents", format!("name pattern: {e}")))?;
    let project_name_re = Regex::new(PROJECT_NAME_PATTERN)
        .map_err(|e| ManifestError::single("project.name", format!("name pattern: {e}")))?;

    let mut violations = Vec::new();

    let name = match raw.project.name.as_deref().map(str::trim) {
        None | Some("") => {
            violations.push(Violation::new("project.name", "must not be empty"));
            String::new()
        }
        Some(n) => {
            if !project_name_re.is_match(n) {
                violations.push(Violation::new(
                    "project.name",
                    format!("'{n}' must start with an alphanumeric and contain only alphanumerics, '-', '_' or '.'"),
                ));
            }
            n.to_string()
        }
    };
    let version = raw
        .project
        .version
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "0.1.0".to_string());

    let registry_kind = match raw.registry.kind.as_deref() {
        None => RegistryKind::DockerRegistry,
        Some(kind) => kind.parse().unwrap_or_else(|reason: String| {
            violations.push(Violation::new("registry.type", reason));
            RegistryKind::DockerRegistry
        }),
    };

    let provider = match raw.infrastructure.provider.as_deref() {
        None => ProviderKind::Local,
        Some(p) => p.parse().unwrap_or_else(|_| {
            violations.push(Violation::new(
                "infrastructure.provider",
                format!("unknown provider '{p}' (expected local, aws, gcp or azure)"),
            ));
            ProviderKind::Local
        }),
    };
    let region = raw
        .infrastructure
        .region
        .clone()
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "us-east-1".to_string());

    // Names first, so depends_on can be checked against the full set.
    let declared: HashSet<&str> = raw
        .agents
        .iter()
        .filter_map(|a| a.name.as_deref().map(str::trim))
        .collect();
    let mut first_seen: HashMap<&str, usize> = HashMap::new();

    let mut agents = Vec::with_capacity(raw.agents.len());
    for (idx, agent) in raw.agents.iter().enumerate() {
        let at = |field: &str| format!("agents[{idx}].{field}");

        let agent_name = agent.name.as_deref().map(str::trim).unwrap_or("");
        if agent_name.is_empty() {
            violations.push(Violation::new(at("name"), "must not be empty"));
        } else {
            if !agent_name_re.is_match(agent_name) {
                violations.push(Violation::new(
                    at("name"),
                    format!("'{agent_name}' must be lowercase alphanumerics and '-', at most 63 characters"),
                ));
            }
            match first_seen.get(agent_name) {
                Some(first) => violations.push(Violation::new(
                    at("name"),
                    format!("duplicate agent name '{agent_name}' (first declared at agents[{first}])"),
                )),
                None => {
                    first_seen.insert(agent_name, idx);
                }
            }
        }

        let replicas = match agent.replicas {
            None => 1,
            Some(r) if r < 0 => {
                violations.push(Violation::new(at("replicas"), format!("must be >= 0, got {r}")));
                0
            }
            Some(r) => u32::try_from(r).unwrap_or_else(|_| {
                violations.push(Violation::new(at("replicas"), format!("{r} is too large")));
                0
            }),
        };

        let cpu = match &agent.resources.cpu {
            None => CpuQuantity::DEFAULT,
            Some(q) => q.to_string().parse().unwrap_or_else(|e: QuantityError| {
                violations.push(Violation::new(at("resources.cpu"), e.to_string()));
                CpuQuantity::DEFAULT
            }),
        };
        let memory = match &agent.resources.memory {
            None => MemoryQuantity::DEFAULT,
            Some(q) => q.to_string().parse().unwrap_or_else(|e: QuantityError| {
                violations.push(Violation::new(at("resources.memory"), e.to_string()));
                MemoryQuantity::DEFAULT
            }),
        };

        let mut depends_on: Vec<String> = Vec::new();
        for dep in agent.depends_on.iter().map(|d| d.trim()) {
            if depends_on.iter().any(|d| d == dep) {
                continue;
            }
            if dep == agent_name {
                violations.push(Violation::new(
                    at("depends_on"),
                    format!("agent '{agent_name}' depends on itself"),
                ));
            } else if !declared.contains(dep) {
                violations.push(Violation::new(
                    at("depends_on"),
                    format!("unknown agent '{dep}'"),
                ));
            }
            depends_on.push(dep.to_string());
        }

        let source_path = agent
            .path
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| Path::new("agents").join(agent_name));

        agents.push(AgentSpec {
            name: agent_name.to_string(),
            source_path,
            replicas,
            resources: ResourceRequest { cpu, memory },
            build_args: agent
                .build_args
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect(),
            depends_on,
        });
    }

    if !violations.is_empty() {
        return Err(ManifestError { violations });
    }

    Ok(Project {
        name,
        version,
        id: raw.project.id.clone(),
        registry: RegistryConfig {
            url: raw.registry.url.clone().filter(|u| !u.trim().is_empty()),
            kind: registry_kind,
        },
        infrastructure: InfrastructureConfig { provider, region },
        agents,
        root: PathBuf::from("."),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
project:
  name: support-swarm
  version: 0.2.0
registry:
  url: https://registry.example.com
  type: docker-registry
infrastructure:
  provider: aws
  region: eu-west-1
agents:
  - name: triage
    replicas: 2
    resources:
      cpu: "0.5"
      memory: 1Gi
    build_args:
      PYTHON_VERSION: 3.11
  - name: responder
    depends_on: [triage]
services:
  message_queue:
    type: redis
"#;

    #[test]
    fn test_minimal_manifest_validates() {
        let raw = RawManifest::from_yaml(MINIMAL).unwrap();
        let project = validate(&raw).unwrap();
        assert_eq!(project.name, "support-swarm");
        assert_eq!(project.version, "0.2.0");
        assert_eq!(project.infrastructure.provider, ProviderKind::Aws);
        assert_eq!(project.infrastructure.region, "eu-west-1");
        assert_eq!(project.agents.len(), 2);

        let triage = project.agent("triage").unwrap();
        assert_eq!(triage.replicas, 2);
        assert_eq!(triage.resources.cpu.millis(), 500);
        assert_eq!(triage.resources.memory.bytes(), 1024 * 1024 * 1024);
        assert_eq!(triage.build_args["PYTHON_VERSION"], "3.11");
        assert_eq!(triage.source_path, PathBuf::from("agents/triage"));

        let responder = project.agent("responder").unwrap();
        assert_eq!(responder.replicas, 1);
        assert_eq!(responder.resources, ResourceRequest::default());
        assert_eq!(responder.depends_on, vec!["triage".to_string()]);
    }

    #[test]
    fn test_repository_for_strips_scheme() {
        let raw = RawManifest::from_yaml(MINIMAL).unwrap();
        let project = validate(&raw).unwrap();
        assert_eq!(
            project.registry.repository_for("support-swarm", "triage"),
            "registry.example.com/support-swarm/triage"
        );
        let local = RegistryConfig {
            url: None,
            kind: RegistryKind::Local,
        };
        assert_eq!(local.repository_for("p", "a"), "p/a");
    }

    #[test]
    fn test_defaults_when_sections_missing() {
        let raw = RawManifest::from_yaml("project:\n  name: bare\n").unwrap();
        let project = validate(&raw).unwrap();
        assert_eq!(project.infrastructure.provider, ProviderKind::Local);
        assert_eq!(project.registry.kind, RegistryKind::DockerRegistry);
        assert!(project.agents.is_empty());
    }

    #[test]
    fn test_self_dependency_rejected() {
        let raw = RawManifest::from_yaml(
            "project: {name: p}\nagents:\n  - name: loop\n    depends_on: [loop]\n",
        )
        .unwrap();
        let err = validate(&raw).unwrap_err();
        assert_eq!(err.violations.len(), 1);
        assert_eq!(err.violations[0].field, "agents[0].depends_on");
        assert!(err.violations[0].reason.contains("itself"));
    }

    #[test]
    fn test_load_sets_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), MINIMAL).unwrap();
        let project = Project::load(dir.path()).unwrap();
        assert_eq!(project.root, dir.path());
        let triage = project.agent("triage").unwrap();
        assert_eq!(project.source_dir(triage), dir.path().join("agents/triage"));
        assert_eq!(project.state_dir(), dir.path().join(".aiswarm"));
    }
}
