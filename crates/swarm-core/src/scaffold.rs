//! Project and agent scaffolding: `init`, `agent create` and `agent use`.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use swarm_state::ProviderKind;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::error::{Result, SwarmError};
use crate::domain::manifest::{validate, Project, RawManifest, MANIFEST_FILE};

/// Entries whose presence marks a directory as a swarm project.
const PROJECT_MARKERS: [&str; 3] = [MANIFEST_FILE, "agents", "infrastructure"];

const CONTEXT_FILE: &str = "context.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProjectTemplate {
    #[default]
    Basic,
    Distributed,
    Monitoring,
}

impl ProjectTemplate {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectTemplate::Basic => "basic",
            ProjectTemplate::Distributed => "distributed",
            ProjectTemplate::Monitoring => "monitoring",
        }
    }
}

impl FromStr for ProjectTemplate {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(ProjectTemplate::Basic),
            "distributed" => Ok(ProjectTemplate::Distributed),
            "monitoring" => Ok(ProjectTemplate::Monitoring),
            other => Err(format!(
                "unknown template '{other}' (expected basic, distributed or monitoring)"
            )),
        }
    }
}

impl fmt::Display for ProjectTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentTemplate {
    /// FastAPI service with `/execute` and `/health`.
    #[default]
    Basic,
    /// Queue consumer reading tasks from Redis.
    Worker,
}

impl FromStr for AgentTemplate {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(AgentTemplate::Basic),
            "worker" => Ok(AgentTemplate::Worker),
            other => Err(format!(
                "unknown agent template '{other}' (expected basic or worker)"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub name: String,
    /// Directory the project directory is created in.
    pub parent: PathBuf,
    pub registry: Option<String>,
    pub provider: ProviderKind,
    pub template: ProjectTemplate,
    /// Allow a non-empty target directory.
    pub force: bool,
}

impl InitOptions {
    pub fn new(name: impl Into<String>, parent: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            parent: parent.into(),
            registry: None,
            provider: ProviderKind::Aws,
            template: ProjectTemplate::Basic,
            force: false,
        }
    }

    pub fn project_dir(&self) -> PathBuf {
        self.parent.join(&self.name)
    }
}

pub fn is_swarm_project(dir: &Path) -> bool {
    PROJECT_MARKERS.iter().any(|m| dir.join(m).exists())
}

/// Closest directory at or above `dir` that is a swarm project.
pub fn find_enclosing_project(dir: &Path) -> Option<PathBuf> {
    dir.ancestors()
        .find(|d| is_swarm_project(d))
        .map(Path::to_path_buf)
}

/// Create a new project; returns its directory.
pub fn init_project(options: &InitOptions) -> Result<PathBuf> {
    let dir = options.project_dir();
    if let Some(existing) = find_enclosing_project(&dir) {
        return Err(SwarmError::ProjectExists(existing));
    }
    if !options.force && dir.is_dir() && fs::read_dir(&dir)?.next().is_some() {
        return Err(SwarmError::ProjectInit(format!(
            "{} exists and is not empty (use --force)",
            dir.display()
        )));
    }

    let provider_dir = format!("infrastructure/{}", options.provider);
    for sub in ["agents", provider_dir.as_str(), "scripts", "config", "tests", "docs"] {
        let path = dir.join(sub);
        fs::create_dir_all(&path)
            .map_err(|e| SwarmError::ProjectInit(format!("{}: {e}", path.display())))?;
        fs::write(path.join(".gitkeep"), b"")?;
    }

    let manifest = initial_manifest(options);
    // Refuse to write something the loader would reject.
    validate(&serde_yaml::from_value::<RawManifest>(manifest.clone())?)?;
    write_atomic(&dir.join(MANIFEST_FILE), serde_yaml::to_string(&manifest)?.as_bytes())?;

    write_agent_files(&dir.join("agents").join(EXAMPLE_AGENT), AgentTemplate::Basic)?;
    fs::write(dir.join(".gitignore"), GITIGNORE)?;
    if options.template == ProjectTemplate::Monitoring {
        fs::write(dir.join("config").join("prometheus.yml"), PROMETHEUS_CONFIG)?;
    }

    info!(
        project = %options.name,
        path = %dir.display(),
        template = %options.template,
        provider = %options.provider,
        "project initialized"
    );
    Ok(dir)
}

const EXAMPLE_AGENT: &str = "example-agent";

fn initial_manifest(options: &InitOptions) -> Value {
    let mut project = Mapping::new();
    project.insert("name".into(), options.name.clone().into());
    project.insert("version".into(), "0.1.0".into());
    project.insert("id".into(), Uuid::new_v4().to_string().into());
    project.insert("created_at".into(), Utc::now().to_rfc3339().into());
    project.insert("template".into(), options.template.as_str().into());

    let mut registry = Mapping::new();
    registry.insert(
        "url".into(),
        options.registry.clone().map_or(Value::Null, Value::from),
    );
    registry.insert("type".into(), "docker-registry".into());

    let mut infrastructure = Mapping::new();
    infrastructure.insert("provider".into(), options.provider.as_str().into());
    infrastructure.insert("region".into(), "us-east-1".into());

    let mut root = Mapping::new();
    root.insert("project".into(), project.into());
    root.insert("registry".into(), registry.into());
    root.insert("infrastructure".into(), infrastructure.into());
    root.insert(
        "agents".into(),
        Value::Sequence(vec![agent_entry(EXAMPLE_AGENT)]),
    );
    root.insert("services".into(), services(options.template));
    Value::Mapping(root)
}

fn agent_entry(name: &str) -> Value {
    let mut resources = Mapping::new();
    resources.insert("cpu".into(), "0.5".into());
    resources.insert("memory".into(), "512Mi".into());

    let mut agent = Mapping::new();
    agent.insert("name".into(), name.into());
    agent.insert("path".into(), format!("agents/{name}").into());
    agent.insert("replicas".into(), 1.into());
    agent.insert("resources".into(), resources.into());
    Value::Mapping(agent)
}

fn services(template: ProjectTemplate) -> Value {
    let mut queue = Mapping::new();
    queue.insert("type".into(), "redis".into());
    queue.insert("version".into(), "7.0".into());

    let mut monitoring = Mapping::new();
    monitoring.insert("enabled".into(), true.into());
    monitoring.insert("type".into(), "prometheus".into());

    let mut services = Mapping::new();
    services.insert("message_queue".into(), queue.into());
    match template {
        ProjectTemplate::Basic => {}
        ProjectTemplate::Distributed => {
            let mut coordinator = Mapping::new();
            coordinator.insert("type".into(), "redis-streams".into());
            coordinator.insert("consumer_group".into(), "agents".into());
            services.insert("coordinator".into(), coordinator.into());
        }
        ProjectTemplate::Monitoring => {
            monitoring.insert("dashboards".into(), "grafana".into());
            monitoring.insert("config".into(), "config/prometheus.yml".into());
        }
    }
    services.insert("monitoring".into(), monitoring.into());
    Value::Mapping(services)
}

/// Scaffold `agents/<name>/` and append the agent to the manifest.
pub fn create_agent(root: &Path, name: &str, template: AgentTemplate) -> Result<PathBuf> {
    let manifest_path = root.join(MANIFEST_FILE);
    let text = fs::read_to_string(&manifest_path)?;
    let mut doc: Value = serde_yaml::from_str(&text)?;

    let Value::Mapping(map) = &mut doc else {
        return Err(SwarmError::ProjectInit(format!(
            "{} is not a mapping",
            manifest_path.display()
        )));
    };
    let agents = map
        .entry("agents".into())
        .or_insert_with(|| Value::Sequence(Vec::new()));
    if agents.is_null() {
        *agents = Value::Sequence(Vec::new());
    }
    let Value::Sequence(list) = agents else {
        return Err(SwarmError::ProjectInit("`agents` must be a list".to_string()));
    };
    if list
        .iter()
        .any(|a| a.get("name").and_then(Value::as_str) == Some(name))
    {
        return Err(SwarmError::ProjectInit(format!(
            "agent '{name}' already exists"
        )));
    }
    list.push(agent_entry(name));

    validate(&serde_yaml::from_value::<RawManifest>(doc.clone())?)?;

    let agent_dir = root.join("agents").join(name);
    write_agent_files(&agent_dir, template)?;
    write_atomic(&manifest_path, serde_yaml::to_string(&doc)?.as_bytes())?;
    info!(agent = %name, path = %agent_dir.display(), "agent created");
    Ok(agent_dir)
}

/// Write the template files, leaving any existing file alone.
fn write_agent_files(dir: &Path, template: AgentTemplate) -> Result<()> {
    fs::create_dir_all(dir)?;
    let (main, requirements) = match template {
        AgentTemplate::Basic => (BASIC_MAIN, BASIC_REQUIREMENTS),
        AgentTemplate::Worker => (WORKER_MAIN, WORKER_REQUIREMENTS),
    };
    let dockerfile = match template {
        AgentTemplate::Basic => BASIC_DOCKERFILE,
        AgentTemplate::Worker => WORKER_DOCKERFILE,
    };
    for (file, body) in [
        ("main.py", main),
        ("Dockerfile", dockerfile),
        ("requirements.txt", requirements),
    ] {
        let path = dir.join(file);
        if path.exists() {
            debug!(path = %path.display(), "keeping existing file");
            continue;
        }
        fs::write(&path, body)?;
    }
    Ok(())
}

fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(body)?;
    tmp.persist(path).map_err(|e| SwarmError::Io(e.error))?;
    Ok(())
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CliContext {
    #[serde(default)]
    active_agent: Option<String>,
}

fn context_path(state_dir: &Path) -> PathBuf {
    state_dir.join(CONTEXT_FILE)
}

/// Make `agent` the default for commands that omit an agent name.
pub fn set_active_agent(project: &Project, state_dir: &Path, agent: &str) -> Result<()> {
    if project.agent(agent).is_none() {
        return Err(SwarmError::UnknownAgent(agent.to_string()));
    }
    fs::create_dir_all(state_dir)?;
    let context = CliContext {
        active_agent: Some(agent.to_string()),
    };
    write_atomic(
        &context_path(state_dir),
        serde_json::to_string_pretty(&context)?.as_bytes(),
    )
}

pub fn active_agent(state_dir: &Path) -> Result<Option<String>> {
    let path = context_path(state_dir);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let context: CliContext = serde_json::from_str(&text)?;
    Ok(context.active_agent)
}

const BASIC_MAIN: &str = r#"from typing import Any, Dict

from fastapi import FastAPI, HTTPException
from pydantic import BaseModel

app = FastAPI()


class Task(BaseModel):
    input: Any
    parameters: Dict[str, Any] = {}


class Response(BaseModel):
    status: str
    result: Any


@app.post("/execute")
async def execute_task(task: Task) -> Response:
    try:
        # Agent logic goes here; the example echoes its input.
        return Response(status="success", result=task.input)
    except Exception as e:
        raise HTTPException(status_code=500, detail=str(e))


@app.get("/health")
async def health_check():
    return {"status": "healthy"}
"#;

const BASIC_DOCKERFILE: &str = r#"FROM python:3.11-slim

WORKDIR /app
COPY requirements.txt .
RUN pip install --no-cache-dir -r requirements.txt

COPY . .

EXPOSE 8000
CMD ["uvicorn", "main:app", "--host", "0.0.0.0", "--port", "8000"]
"#;

const BASIC_REQUIREMENTS: &str = "fastapi>=0.68.0\nuvicorn>=0.15.0\npydantic>=1.8.0\n";

const WORKER_MAIN: &str = r#"import json
import os

import redis

QUEUE = os.environ.get("AGENT_QUEUE", "tasks")


def handle(task):
    # Agent logic goes here; the example echoes its input.
    return {"status": "success", "result": task.get("input")}


def main():
    client = redis.Redis.from_url(os.environ.get("REDIS_URL", "redis://redis:6379"))
    while True:
        _, raw = client.blpop(QUEUE)
        task = json.loads(raw)
        client.rpush(f"{QUEUE}:results", json.dumps(handle(task)))


if __name__ == "__main__":
    main()
"#;

const WORKER_DOCKERFILE: &str = r#"FROM python:3.11-slim

WORKDIR /app
COPY requirements.txt .
RUN pip install --no-cache-dir -r requirements.txt

COPY . .

CMD ["python", "main.py"]
"#;

const WORKER_REQUIREMENTS: &str = "redis>=4.0.0\n";

const GITIGNORE: &str = "__pycache__/\n*.py[cod]\n.env\n.env.local\n.aiswarm/\n.idea/\n.vscode/\n.DS_Store\n";

const PROMETHEUS_CONFIG: &str = r#"global:
  scrape_interval: 15s

scrape_configs:
  - job_name: agents
    static_configs:
      - targets: ["example-agent:8000"]
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_parse() {
        assert_eq!("Distributed".parse::<ProjectTemplate>().unwrap(), ProjectTemplate::Distributed);
        assert!("fancy".parse::<ProjectTemplate>().is_err());
        assert_eq!("worker".parse::<AgentTemplate>().unwrap(), AgentTemplate::Worker);
    }

    #[test]
    fn test_initial_manifest_validates() {
        for template in [
            ProjectTemplate::Basic,
            ProjectTemplate::Distributed,
            ProjectTemplate::Monitoring,
        ] {
            let mut options = InitOptions::new("demo", "/tmp");
            options.template = template;
            let raw: RawManifest = serde_yaml::from_value(initial_manifest(&options)).unwrap();
            let project = validate(&raw).unwrap();
            assert_eq!(project.name, "demo");
            assert_eq!(project.infrastructure.provider, ProviderKind::Aws);
            assert_eq!(project.agents[0].name, EXAMPLE_AGENT);
        }
    }

    #[test]
    fn test_services_follow_template() {
        let distributed = services(ProjectTemplate::Distributed);
        assert!(distributed.get("coordinator").is_some());
        let basic = services(ProjectTemplate::Basic);
        assert!(basic.get("coordinator").is_none());
        assert_eq!(
            basic["monitoring"]["enabled"].as_bool(),
            Some(true)
        );
    }
}
