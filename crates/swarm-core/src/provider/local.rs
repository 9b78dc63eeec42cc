//! Local provider: one docker compose project per agent.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use swarm_state::ProviderKind;
use tokio::process::Command;
use tracing::debug;

use super::{Observed, ProviderError, Target, TargetSpec};

/// A compose service as aiswarm renders it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeService {
    /// Compose project and service name, `<project>-<agent>`.
    pub name: String,
    pub image: String,
    pub replicas: u32,
    /// Fractional cores, e.g. `"0.5"`.
    pub cpus: String,
    /// Docker memory limit, e.g. `"512m"`.
    pub mem_limit: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct ComposeFile<'a> {
    name: &'a str,
    services: BTreeMap<&'a str, ServiceBody<'a>>,
}

#[derive(Serialize)]
struct ServiceBody<'a> {
    image: &'a str,
    restart: &'static str,
    cpus: &'a str,
    mem_limit: &'a str,
    labels: &'a BTreeMap<String, String>,
    deploy: DeployBody,
}

#[derive(Serialize)]
struct DeployBody {
    replicas: u32,
}

impl ComposeService {
    pub fn to_compose_yaml(&self) -> Result<String, serde_yaml::Error> {
        let mut services = BTreeMap::new();
        services.insert(
            self.name.as_str(),
            ServiceBody {
                image: &self.image,
                restart: "unless-stopped",
                cpus: &self.cpus,
                mem_limit: &self.mem_limit,
                labels: &self.labels,
                deploy: DeployBody {
                    replicas: self.replicas,
                },
            },
        );
        serde_yaml::to_string(&ComposeFile {
            name: &self.name,
            services,
        })
    }
}

/// Running state of a compose service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceState {
    pub running: u32,
    pub image: Option<String>,
}

/// Container runtime driving compose projects (external collaborator).
#[async_trait]
pub trait ComposeRuntime: Send + Sync {
    async fn up(&self, service: &ComposeService) -> Result<(), ProviderError>;

    /// `None` when the service does not exist.
    async fn ps(&self, name: &str) -> Result<Option<ServiceState>, ProviderError>;

    /// `false` when there was nothing to remove.
    async fn down(&self, name: &str) -> Result<bool, ProviderError>;
}

pub struct LocalTarget {
    project: String,
    runtime: Arc<dyn ComposeRuntime>,
}

impl LocalTarget {
    pub fn new(project: impl Into<String>, runtime: Arc<dyn ComposeRuntime>) -> Self {
        Self {
            project: project.into(),
            runtime,
        }
    }

    pub fn service(&self, spec: &TargetSpec) -> ComposeService {
        let mut labels = BTreeMap::new();
        labels.insert("org.aiswarm.project".to_string(), self.project.clone());
        labels.insert("org.aiswarm.agent".to_string(), spec.agent.clone());
        labels.insert("org.aiswarm.digest".to_string(), spec.image.digest.clone());
        ComposeService {
            name: self.resource_id(&spec.agent),
            image: spec.image.tagged(),
            replicas: spec.replicas,
            cpus: spec.resources.cpu.cores_string(),
            mem_limit: format!("{}m", spec.resources.memory.mebibytes()),
            labels,
        }
    }
}

#[async_trait]
impl Target for LocalTarget {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn resource_id(&self, agent: &str) -> String {
        format!("{}-{}", self.project, agent)
    }

    async fn observe(&self, agent: &str) -> Result<Option<Observed>, ProviderError> {
        Ok(self
            .runtime
            .ps(&self.resource_id(agent))
            .await?
            .map(|s| Observed {
                ready_replicas: s.running,
                image: s.image,
            }))
    }

    async fn converge(&self, spec: &TargetSpec) -> Result<Observed, ProviderError> {
        let service = self.service(spec);
        self.runtime.up(&service).await?;
        let state = self.runtime.ps(&service.name).await?;
        Ok(state.map_or(
            Observed {
                ready_replicas: 0,
                image: None,
            },
            |s| Observed {
                ready_replicas: s.running,
                image: s.image,
            },
        ))
    }

    async fn delete(&self, agent: &str) -> Result<bool, ProviderError> {
        self.runtime.down(&self.resource_id(agent)).await
    }
}

#[derive(Debug, Deserialize)]
struct PsRow {
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Image", default)]
    image: Option<String>,
}

/// Parse `docker compose ps --format json`, which is either a JSON array
/// (older compose) or one JSON object per line.
pub fn parse_ps_output(output: &str) -> Result<Vec<(String, Option<String>)>, serde_json::Error> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let rows: Vec<PsRow> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)?
    } else {
        trimmed
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?
    };
    Ok(rows.into_iter().map(|r| (r.state, r.image)).collect())
}

/// `docker compose` CLI runtime. Compose files live under `work_dir`.
#[derive(Debug, Clone)]
pub struct DockerComposeRuntime {
    binary: String,
    work_dir: PathBuf,
}

impl DockerComposeRuntime {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: "docker".to_string(),
            work_dir: work_dir.into(),
        }
    }

    fn file_for(&self, name: &str) -> PathBuf {
        self.work_dir.join(format!("{name}.compose.yaml"))
    }

    async fn compose(&self, name: &str, args: &[&str]) -> Result<String, ProviderError> {
        let file = self.file_for(name);
        let file = file.to_string_lossy();
        let mut full = vec!["compose", "--project-name", name];
        if self.file_for(name).exists() {
            full.extend(["--file", file.as_ref()]);
        }
        full.extend(args);
        debug!(binary = %self.binary, args = ?full, "compose command");
        let output = Command::new(&self.binary)
            .args(&full)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ProviderError::unavailable(format!("cannot run {}: {e}", self.binary)))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(ProviderError::Rejected {
                agent: name.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl ComposeRuntime for DockerComposeRuntime {
    async fn up(&self, service: &ComposeService) -> Result<(), ProviderError> {
        let yaml = service.to_compose_yaml().map_err(|e| ProviderError::InvalidRequest {
            agent: service.name.clone(),
            reason: e.to_string(),
        })?;
        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .map_err(|e| ProviderError::unavailable(format!("{}: {e}", self.work_dir.display())))?;
        let file = self.file_for(&service.name);
        tokio::fs::write(&file, yaml)
            .await
            .map_err(|e| ProviderError::unavailable(format!("{}: {e}", file.display())))?;
        self.compose(&service.name, &["up", "--detach", "--remove-orphans", "--wait"])
            .await?;
        Ok(())
    }

    async fn ps(&self, name: &str) -> Result<Option<ServiceState>, ProviderError> {
        let out = self.compose(name, &["ps", "--all", "--format", "json"]).await?;
        let rows = parse_ps_output(&out)
            .map_err(|e| ProviderError::unavailable(format!("unreadable compose ps output: {e}")))?;
        if rows.is_empty() {
            return Ok(None);
        }
        let running = rows.iter().filter(|(state, _)| state == "running").count() as u32;
        let image = rows.iter().find_map(|(_, image)| image.clone());
        Ok(Some(ServiceState { running, image }))
    }

    async fn down(&self, name: &str) -> Result<bool, ProviderError> {
        let existed = self.ps(name).await?.is_some() || self.file_for(name).exists();
        if !existed {
            return Ok(false);
        }
        self.compose(name, &["down", "--remove-orphans"]).await?;
        let file = self.file_for(name);
        if let Err(e) = tokio::fs::remove_file(&file).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(ProviderError::unavailable(format!("{}: {e}", file.display())));
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::manifest::ResourceRequest;
    use crate::domain::quantity::{CpuQuantity, MemoryQuantity};
    use crate::fakes::MemoryComposeRuntime;
    use swarm_state::ImageRef;

    fn spec() -> TargetSpec {
        TargetSpec {
            agent: "triage".to_string(),
            image: ImageRef::new("demo/triage", "0123456789ab", "sha256:0123456789ab"),
            replicas: 2,
            resources: ResourceRequest {
                cpu: CpuQuantity::from_millis(500),
                memory: MemoryQuantity::from_bytes(512 * 1024 * 1024),
            },
        }
    }

    #[test]
    fn test_service_translation() {
        let target = LocalTarget::new("demo", Arc::new(MemoryComposeRuntime::new()));
        let service = target.service(&spec());
        assert_eq!(service.name, "demo-triage");
        assert_eq!(service.image, "demo/triage:0123456789ab");
        assert_eq!(service.cpus, "0.5");
        assert_eq!(service.mem_limit, "512m");
        assert_eq!(service.replicas, 2);
    }

    #[test]
    fn test_compose_yaml_shape() {
        let target = LocalTarget::new("demo", Arc::new(MemoryComposeRuntime::new()));
        let yaml = target.service(&spec()).to_compose_yaml().unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let svc = &doc["services"]["demo-triage"];
        assert_eq!(svc["image"].as_str(), Some("demo/triage:0123456789ab"));
        assert_eq!(svc["cpus"].as_str(), Some("0.5"));
        assert_eq!(svc["mem_limit"].as_str(), Some("512m"));
        assert_eq!(svc["deploy"]["replicas"].as_u64(), Some(2));
        assert_eq!(svc["labels"]["org.aiswarm.agent"].as_str(), Some("triage"));
    }

    #[test]
    fn test_parse_ps_output_both_formats() {
        let array = r#"[{"State":"running","Image":"demo/a:1"},{"State":"exited","Image":"demo/a:1"}]"#;
        let rows = parse_ps_output(array).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "running");

        let ndjson = "{\"State\":\"running\",\"Image\":\"demo/a:1\"}\n{\"State\":\"running\",\"Image\":\"demo/a:1\"}\n";
        assert_eq!(parse_ps_output(ndjson).unwrap().len(), 2);
        assert!(parse_ps_output("").unwrap().is_empty());
    }
}
