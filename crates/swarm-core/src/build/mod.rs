//! Build pipeline: agent source directory to content-addressed image.
//!
//! The pipeline owns tag derivation, caching, the concurrency bound and the
//! per-build timeout. The actual build runs out of process behind the
//! [`BuildEngine`] trait.

pub mod docker;
pub mod source_hash;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use swarm_state::ImageRef;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::domain::digest::build_input_digest;
use crate::domain::manifest::{AgentSpec, Project, RegistryConfig};
use crate::metrics::METRICS;
use crate::obs;
use crate::orchestrator::CancelSignal;

pub use docker::DockerCliEngine;
pub use source_hash::hash_source_tree;

/// Failure reported by a [`BuildEngine`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct EngineFailure {
    pub message: String,
    /// Combined engine output, if any was captured.
    pub log: String,
}

impl EngineFailure {
    pub fn new(message: impl Into<String>, log: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            log: log.into(),
        }
    }
}

/// Container build engine (external collaborator).
#[async_trait]
pub trait BuildEngine: Send + Sync {
    /// Build `context_dir` as `tag`; returns the engine's image id.
    async fn build(
        &self,
        context_dir: &Path,
        tag: &str,
        build_args: &BTreeMap<String, String>,
    ) -> Result<String, EngineFailure>;

    /// Whether an image with `tag` is already present.
    async fn exists(&self, tag: &str) -> Result<bool, EngineFailure>;
}

/// Per-agent build failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("source for agent {agent} unreadable at {path}: {reason}")]
    SourceUnreadable {
        agent: String,
        path: PathBuf,
        reason: String,
    },

    #[error("build of agent {agent} failed: {message}")]
    EngineFailed {
        agent: String,
        message: String,
        /// Bounded tail of the build output.
        log: String,
    },

    #[error("build of agent {agent} timed out after {secs}s")]
    TimedOut { agent: String, secs: u64 },

    #[error("build of agent {agent} was cancelled")]
    Cancelled { agent: String },
}

impl BuildError {
    pub fn agent(&self) -> &str {
        match self {
            BuildError::SourceUnreadable { agent, .. }
            | BuildError::EngineFailed { agent, .. }
            | BuildError::TimedOut { agent, .. }
            | BuildError::Cancelled { agent } => agent,
        }
    }
}

/// A successfully built (or cached) image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    pub image: ImageRef,
    /// Engine image id; `None` when served from the cache.
    pub image_id: Option<String>,
    pub cached: bool,
}

#[derive(Debug, Clone)]
pub struct BuildResult {
    pub agent: String,
    pub duration: Duration,
    pub outcome: Result<BuiltImage, BuildError>,
}

impl BuildResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn image(&self) -> Option<&ImageRef> {
        self.outcome.as_ref().ok().map(|b| &b.image)
    }

    pub fn cached(&self) -> bool {
        self.outcome.as_ref().map(|b| b.cached).unwrap_or(false)
    }
}

/// Project-level inputs shared by every agent build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    pub project: String,
    pub root: PathBuf,
    registry: RegistryConfig,
}

impl BuildContext {
    pub fn for_project(project: &Project) -> Self {
        Self {
            project: project.name.clone(),
            root: project.root.clone(),
            registry: project.registry.clone(),
        }
    }

    pub fn source_dir(&self, agent: &AgentSpec) -> PathBuf {
        if agent.source_path.is_absolute() {
            agent.source_path.clone()
        } else {
            self.root.join(&agent.source_path)
        }
    }

    pub fn repository(&self, agent: &str) -> String {
        self.registry.repository_for(&self.project, agent)
    }
}

#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub max_parallel: usize,
    pub timeout: Duration,
    /// Lines of engine output kept on failure.
    pub log_tail_lines: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_parallel: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            timeout: Duration::from_secs(20 * 60),
            log_tail_lines: 50,
        }
    }
}

/// Last `lines` lines of `log`.
pub fn log_tail(log: &str, lines: usize) -> String {
    let all: Vec<&str> = log.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

pub struct BuildPipeline {
    engine: Arc<dyn BuildEngine>,
    config: BuildConfig,
    permits: Arc<Semaphore>,
    /// Tags known to exist, so repeated builds in one process skip the engine.
    known: Mutex<HashSet<String>>,
}

impl BuildPipeline {
    pub fn new(engine: Arc<dyn BuildEngine>, config: BuildConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_parallel.max(1)));
        Self {
            engine,
            config,
            permits,
            known: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Deterministic image reference for `agent` from its current sources.
    pub async fn derive_image(
        &self,
        agent: &AgentSpec,
        ctx: &BuildContext,
    ) -> Result<ImageRef, BuildError> {
        let dir = ctx.source_dir(agent);
        let hash_dir = dir.clone();
        let tree_hash = tokio::task::spawn_blocking(move || hash_source_tree(&hash_dir))
            .await
            .map_err(|e| BuildError::SourceUnreadable {
                agent: agent.name.clone(),
                path: dir.clone(),
                reason: format!("hashing task failed: {e}"),
            })?
            .map_err(|e| BuildError::SourceUnreadable {
                agent: agent.name.clone(),
                path: e.path.clone(),
                reason: e.source.to_string(),
            })?;

        let digest = build_input_digest(&ctx.project, &agent.name, &tree_hash, &agent.build_args)
            .map_err(|e| BuildError::SourceUnreadable {
                agent: agent.name.clone(),
                path: dir.clone(),
                reason: format!("cannot encode build inputs: {e}"),
            })?;

        Ok(ImageRef::new(
            ctx.repository(&agent.name),
            digest.tag(),
            digest.as_str(),
        ))
    }

    /// Build one agent. Never panics on engine failure; the error is in the result.
    pub async fn build(&self, agent: &AgentSpec, ctx: &BuildContext) -> BuildResult {
        self.build_until(agent, ctx, &CancelSignal::never()).await
    }

    /// Like [`BuildPipeline::build`], but gives up with
    /// [`BuildError::Cancelled`] once `cancel` fires. A build still queued for
    /// a slot never reaches the engine.
    pub async fn build_until(
        &self,
        agent: &AgentSpec,
        ctx: &BuildContext,
        cancel: &CancelSignal,
    ) -> BuildResult {
        let start = Instant::now();
        let outcome = self.build_inner(agent, ctx, cancel).await;
        let duration = start.elapsed();
        match &outcome {
            Ok(built) => obs::emit_build_finished(
                &agent.name,
                &built.image.tagged(),
                built.cached,
                duration.as_millis() as u64,
            ),
            Err(e) => warn!(agent = %agent.name, error = %e, "build failed"),
        }
        BuildResult {
            agent: agent.name.clone(),
            duration,
            outcome,
        }
    }

    async fn build_inner(
        &self,
        agent: &AgentSpec,
        ctx: &BuildContext,
        cancel: &CancelSignal,
    ) -> Result<BuiltImage, BuildError> {
        let cancelled = || BuildError::Cancelled {
            agent: agent.name.clone(),
        };
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            permit = self.permits.acquire() => permit.map_err(|_| cancelled())?,
        };
        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        let image = self.derive_image(agent, ctx).await?;
        let tag = image.tagged();

        if self.known.lock().await.contains(&tag) {
            debug!(agent = %agent.name, image = %tag, "image cached in-process");
            METRICS.inc_build_cache_hits();
            return Ok(BuiltImage {
                image,
                image_id: None,
                cached: true,
            });
        }
        match self.engine.exists(&tag).await {
            Ok(true) => {
                info!(agent = %agent.name, image = %tag, "image already built, skipping");
                METRICS.inc_build_cache_hits();
                self.known.lock().await.insert(tag);
                return Ok(BuiltImage {
                    image,
                    image_id: None,
                    cached: true,
                });
            }
            Ok(false) => {}
            Err(e) => warn!(agent = %agent.name, error = %e, "cache lookup failed, building"),
        }

        METRICS.inc_builds();
        let dir = ctx.source_dir(agent);
        info!(agent = %agent.name, image = %tag, context = %dir.display(), "building image");
        let finished = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            result = tokio::time::timeout(
                self.config.timeout,
                self.engine.build(&dir, &tag, &agent.build_args),
            ) => result,
        };
        let built = finished
            .map_err(|_| BuildError::TimedOut {
                agent: agent.name.clone(),
                secs: self.config.timeout.as_secs(),
            })?
            .map_err(|e| BuildError::EngineFailed {
                agent: agent.name.clone(),
                message: e.message,
                log: log_tail(&e.log, self.config.log_tail_lines),
            })?;

        self.known.lock().await.insert(tag);
        Ok(BuiltImage {
            image,
            image_id: Some(built),
            cached: false,
        })
    }

    /// Build every agent concurrently; results arrive in completion order.
    /// One agent's failure never stops the others. After `cancel` fires no
    /// new engine build starts and the remaining results are `Cancelled`.
    pub fn build_all(
        self: &Arc<Self>,
        agents: Vec<AgentSpec>,
        ctx: BuildContext,
        cancel: CancelSignal,
    ) -> mpsc::Receiver<BuildResult> {
        let (tx, rx) = mpsc::channel(agents.len().max(1));
        let ctx = Arc::new(ctx);
        for agent in agents {
            let pipeline = Arc::clone(self);
            let ctx = Arc::clone(&ctx);
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = pipeline.build_until(&agent, &ctx, &cancel).await;
                // Receiver dropped means nobody is interested any more.
                let _ = tx.send(result).await;
            });
        }
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_tail_keeps_last_lines() {
        let log = "one\ntwo\nthree\nfour";
        assert_eq!(log_tail(log, 2), "three\nfour");
        assert_eq!(log_tail(log, 10), log);
        assert_eq!(log_tail("", 3), "");
    }

    #[test]
    fn test_build_error_agent() {
        let err = BuildError::TimedOut {
            agent: "triage".to_string(),
            secs: 5,
        };
        assert_eq!(err.agent(), "triage");
        assert!(err.to_string().contains("timed out after 5s"));
    }
}
