//! `docker build` as a [`BuildEngine`].

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{BuildEngine, EngineFailure};

/// Label carrying the build-input digest on every image built by aiswarm.
pub const DIGEST_LABEL: &str = "org.aiswarm.build-digest";

/// Shells out to the docker CLI (or a compatible one such as podman).
#[derive(Debug, Clone)]
pub struct DockerCliEngine {
    binary: String,
}

impl Default for DockerCliEngine {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCliEngine {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Arguments for `docker build`; the tag's own suffix is recorded as a label.
    pub fn build_args(
        context_dir: &Path,
        tag: &str,
        build_args: &BTreeMap<String, String>,
    ) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            "--tag".to_string(),
            tag.to_string(),
            "--label".to_string(),
            format!("{DIGEST_LABEL}={}", tag.rsplit(':').next().unwrap_or(tag)),
        ];
        for (key, value) in build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(context_dir.to_string_lossy().into_owned());
        args
    }
}

#[async_trait]
impl BuildEngine for DockerCliEngine {
    async fn build(
        &self,
        context_dir: &Path,
        tag: &str,
        build_args: &BTreeMap<String, String>,
    ) -> Result<String, EngineFailure> {
        let args = Self::build_args(context_dir, tag, build_args);
        debug!(binary = %self.binary, ?args, "spawning build");
        let output = Command::new(&self.binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EngineFailure::new(format!("cannot run {}: {e}", self.binary), ""))?;

        let log = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if !output.status.success() {
            return Err(EngineFailure::new(
                format!(
                    "{} build exited with code {}",
                    self.binary,
                    output.status.code().unwrap_or(-1)
                ),
                log,
            ));
        }

        let inspect = Command::new(&self.binary)
            .args(["image", "inspect", "--format", "{{.Id}}", tag])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| EngineFailure::new(format!("cannot inspect {tag}: {e}"), log.clone()))?;
        Ok(String::from_utf8_lossy(&inspect.stdout).trim().to_string())
    }

    async fn exists(&self, tag: &str) -> Result<bool, EngineFailure> {
        let status = Command::new(&self.binary)
            .args(["image", "inspect", tag])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| EngineFailure::new(format!("cannot run {}: {e}", self.binary), ""))?;
        Ok(status.success())
    }
}
