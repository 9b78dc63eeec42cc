//! Deployment orchestrator: reconcile a project's manifest against what is
//! built, registered and running.
//!
//! Each selected agent runs its own pipeline (`build → push → apply`) as a
//! tokio task over a bounded pool. Dependents wait on a `watch` channel of
//! each dependency's phase. Tasks report their terminal outcome over an
//! `mpsc` channel to a single collector, the only writer of the
//! [`StateTracker`].

pub mod cancel;
pub mod graph;
pub mod phase;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use swarm_state::{
    DeploymentRecord, DeploymentStatus, ImageRef, ProviderKind, SwarmRunState,
};
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::build::{BuildContext, BuildError, BuildPipeline};
use crate::domain::error::{Result, SwarmError};
use crate::domain::manifest::{AgentSpec, Project};
use crate::metrics::METRICS;
use crate::obs;
use crate::provider::{Provider, ProviderError};
use crate::registry::{Credentials, RegistryClient, RegistryEntry, RegistryError, Session};
use crate::retry::RetryPolicy;
use crate::tracker::{DriftReport, StateTracker};

pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use graph::AgentGraph;
pub use phase::{AgentPhase, StageEvent};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Agent pipelines running at once.
    pub max_parallel_agents: usize,
    /// Bound on the whole push stage of one agent.
    pub push_timeout: Duration,
    /// Bound on a single apply attempt.
    pub apply_timeout: Duration,
    /// Apply attempts and backoff while an agent is `Degraded`.
    pub apply_retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_agents: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            push_timeout: Duration::from_secs(10 * 60),
            apply_timeout: Duration::from_secs(10 * 60),
            apply_retry: RetryPolicy::new(4, Duration::from_millis(500)),
        }
    }
}

/// Which agents a run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    /// The named agents plus everything they depend on.
    Agents(Vec<String>),
}

impl Selection {
    /// An empty list selects every agent.
    pub fn from_names(names: Vec<String>) -> Self {
        if names.is_empty() {
            Selection::All
        } else {
            Selection::Agents(names)
        }
    }
}

/// Why an agent ended `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("dependency {dependency} of {agent} did not become healthy")]
    DependencyFailed { agent: String, dependency: String },

    #[error("{agent} did not converge after {attempts} attempts: {detail}")]
    NotConverged {
        agent: String,
        attempts: u32,
        detail: String,
    },

    #[error("run cancelled before {agent} finished {stage}")]
    Cancelled { agent: String, stage: AgentPhase },
}

/// Terminal result of one agent's pipeline.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub agent: String,
    pub phase: AgentPhase,
    pub image: Option<ImageRef>,
    pub cached: bool,
    pub pushed: Option<RegistryEntry>,
    /// Present once apply has been attempted.
    pub record: Option<DeploymentRecord>,
    pub error: Option<StageError>,
    pub apply_attempts: u32,
}

impl AgentOutcome {
    fn planned(agent: &str) -> Self {
        Self {
            agent: agent.to_string(),
            phase: AgentPhase::Planned,
            image: None,
            cached: false,
            pushed: None,
            record: None,
            error: None,
            apply_attempts: 0,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.phase == AgentPhase::Healthy
    }
}

/// Aggregate result of a deploy run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub project: String,
    pub provider: ProviderKind,
    /// One entry per selected agent, in run order.
    pub outcomes: Vec<AgentOutcome>,
    pub cancelled: bool,
    pub duration: Duration,
    /// State writes that failed; the run carried on without them.
    pub persist_errors: Vec<String>,
}

impl RunReport {
    /// True only when every selected agent is healthy and state was saved.
    pub fn success(&self) -> bool {
        !self.cancelled
            && self.persist_errors.is_empty()
            && self.outcomes.iter().all(AgentOutcome::is_healthy)
    }

    pub fn healthy(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_healthy()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.healthy()
    }

    pub fn outcome(&self, agent: &str) -> Option<&AgentOutcome> {
        self.outcomes.iter().find(|o| o.agent == agent)
    }

    /// Consolidated error list, agent errors first.
    pub fn errors(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter_map(|o| o.error.as_ref().map(|e| format!("{}: {e}", o.agent)))
            .chain(self.persist_errors.iter().map(|e| format!("state: {e}")))
            .collect()
    }
}

/// One agent of a build-only run.
#[derive(Debug, Clone)]
pub struct AgentBuild {
    pub agent: String,
    pub image: Option<ImageRef>,
    pub cached: bool,
    pub duration: Duration,
    pub pushed: Option<RegistryEntry>,
    pub error: Option<StageError>,
}

#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub builds: Vec<AgentBuild>,
    pub cancelled: bool,
    pub persist_errors: Vec<String>,
}

impl BuildReport {
    pub fn success(&self) -> bool {
        !self.cancelled
            && self.persist_errors.is_empty()
            && self.builds.iter().all(|b| b.error.is_none())
    }

    pub fn errors(&self) -> Vec<String> {
        self.builds
            .iter()
            .filter_map(|b| b.error.as_ref().map(|e| format!("{}: {e}", b.agent)))
            .chain(self.persist_errors.iter().map(|e| format!("state: {e}")))
            .collect()
    }
}

/// One step of a dry run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub agent: String,
    pub replicas: u32,
    pub depends_on: Vec<String>,
    /// Status recorded by the previous run, if any.
    pub recorded: Option<DeploymentStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub project: String,
    pub provider: ProviderKind,
    pub steps: Vec<PlannedStep>,
    pub drift: DriftReport,
}

impl RunPlan {
    pub fn order(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.agent.as_str()).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    pub removed: Vec<String>,
    /// Nothing was deployed; the record (if any) was dropped anyway.
    pub already_absent: Vec<String>,
    pub failed: Vec<(String, ProviderError)>,
    pub persist_errors: Vec<String>,
}

impl TeardownReport {
    pub fn success(&self) -> bool {
        self.failed.is_empty() && self.persist_errors.is_empty()
    }
}

pub struct Orchestrator {
    project: Arc<Project>,
    pipeline: Arc<BuildPipeline>,
    registry: Arc<RegistryClient>,
    provider: Arc<dyn Provider>,
    tracker: Arc<Mutex<StateTracker>>,
    config: OrchestratorConfig,
    credentials: Option<Credentials>,
    observer: Option<mpsc::UnboundedSender<StageEvent>>,
}

impl Orchestrator {
    pub fn new(
        project: Project,
        pipeline: Arc<BuildPipeline>,
        registry: Arc<RegistryClient>,
        provider: Arc<dyn Provider>,
        tracker: StateTracker,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            project: Arc::new(project),
            pipeline,
            registry,
            provider,
            tracker: Arc::new(Mutex::new(tracker)),
            config,
            credentials: None,
            observer: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Receive every [`StageEvent`] of subsequent runs.
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<StageEvent>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub async fn state(&self) -> SwarmRunState {
        self.tracker.lock().await.snapshot().clone()
    }

    fn resolve(&self, selection: &Selection) -> Result<Vec<String>> {
        let graph = AgentGraph::new(&self.project.agents)?;
        match selection {
            Selection::All => Ok(graph.order().to_vec()),
            Selection::Agents(names) => {
                if let Some(unknown) = names.iter().find(|n| !graph.contains(n)) {
                    return Err(SwarmError::UnknownAgent(unknown.clone()));
                }
                Ok(graph.closure(names.iter().map(String::as_str)))
            }
        }
    }

    /// Dry run: order and drift, without touching build, registry or provider.
    pub async fn plan(&self, selection: &Selection) -> Result<RunPlan> {
        let order = self.resolve(selection)?;
        let tracker = self.tracker.lock().await;
        let steps = order
            .iter()
            .filter_map(|name| self.project.agent(name))
            .map(|agent| PlannedStep {
                agent: agent.name.clone(),
                replicas: agent.replicas,
                depends_on: agent.depends_on.clone(),
                recorded: tracker.record(&agent.name).map(|r| r.status),
            })
            .collect();
        Ok(RunPlan {
            project: self.project.name.clone(),
            provider: self.provider.kind(),
            steps,
            drift: tracker.drift(&self.project),
        })
    }

    /// Build, push and apply every selected agent.
    ///
    /// Fails before any stage runs on an unknown agent or a dependency cycle;
    /// every other failure is reported per agent in the [`RunReport`].
    pub async fn deploy(&self, selection: &Selection, cancel: CancelSignal) -> Result<RunReport> {
        let order = self.resolve(selection)?;
        let run_id = Uuid::new_v4().to_string();
        let span = obs::run_span(&run_id, &self.project.name);
        self.run(run_id, order, cancel).instrument(span).await
    }

    async fn run(&self, run_id: String, order: Vec<String>, cancel: CancelSignal) -> Result<RunReport> {
        let started = Instant::now();
        let provider_kind = self.provider.kind();
        obs::emit_run_started(&run_id, &self.project.name, provider_kind.as_str(), order.len());

        let session = self
            .registry
            .login(&self.project.registry, self.credentials.as_ref())
            .await;
        if let Err(e) = &session {
            warn!(error = %e, "registry login failed; pushes will fail");
        }

        let ctx = Arc::new(RunContext {
            build: BuildContext::for_project(&self.project),
            pipeline: Arc::clone(&self.pipeline),
            registry: Arc::clone(&self.registry),
            provider: Arc::clone(&self.provider),
            session,
            permits: Arc::new(Semaphore::new(self.config.max_parallel_agents.max(1))),
            push_timeout: self.config.push_timeout,
            apply_timeout: self.config.apply_timeout,
            apply_retry: self.config.apply_retry.clone(),
            observer: self.observer.clone(),
        });

        let mut phases: HashMap<String, watch::Sender<AgentPhase>> = order
            .iter()
            .map(|name| (name.clone(), watch::channel(AgentPhase::Planned).0))
            .collect();
        let mut tasks = Vec::with_capacity(order.len());
        for name in &order {
            let Some(agent) = self.project.agent(name).cloned() else {
                continue;
            };
            let deps = agent
                .depends_on
                .iter()
                .filter_map(|d| phases.get(d).map(|tx| (d.clone(), tx.subscribe())))
                .collect();
            tasks.push((agent, deps));
        }

        let (done_tx, mut done_rx) = mpsc::channel::<AgentOutcome>(order.len().max(1));
        for (agent, deps) in tasks {
            let Some(phase) = phases.remove(&agent.name) else {
                continue;
            };
            ctx.publish(&agent.name, &phase, AgentPhase::Planned, None);
            let task = AgentTask {
                agent,
                deps,
                phase,
                cancel: cancel.clone(),
            };
            let ctx = Arc::clone(&ctx);
            let done_tx = done_tx.clone();
            tokio::spawn(
                async move {
                    let outcome = ctx.run_agent(task).await;
                    // Collector gone means the run was abandoned.
                    let _ = done_tx.send(outcome).await;
                }
                .in_current_span(),
            );
        }
        drop(done_tx);

        let mut finished: HashMap<String, AgentOutcome> = HashMap::new();
        let mut persist_errors = Vec::new();
        while let Some(outcome) = done_rx.recv().await {
            let mut tracker = self.tracker.lock().await;
            if let Err(e) =
                tracker.record_outcome(&outcome.agent, outcome.image.clone(), outcome.record.clone())
            {
                obs::emit_state_persist_error(&outcome.agent, &e);
                persist_errors.push(format!("{}: {e}", outcome.agent));
            }
            finished.insert(outcome.agent.clone(), outcome);
        }

        let outcomes: Vec<AgentOutcome> = order
            .iter()
            .map(|name| {
                finished.remove(name).unwrap_or_else(|| {
                    let mut lost = AgentOutcome::planned(name);
                    lost.phase = AgentPhase::Failed;
                    lost.error = Some(StageError::Cancelled {
                        agent: name.clone(),
                        stage: AgentPhase::Planned,
                    });
                    lost
                })
            })
            .collect();

        let report = RunReport {
            run_id,
            project: self.project.name.clone(),
            provider: provider_kind,
            outcomes,
            cancelled: cancel.is_cancelled(),
            duration: started.elapsed(),
            persist_errors,
        };
        obs::emit_run_finished(
            &report.run_id,
            report.duration.as_millis() as u64,
            report.healthy(),
            report.failed(),
            report.success(),
        );
        METRICS.flush();
        Ok(report)
    }

    /// Build the selected agents, optionally pushing them. Nothing is applied.
    pub async fn build_images(
        &self,
        selection: &Selection,
        push: bool,
        cancel: CancelSignal,
    ) -> Result<BuildReport> {
        let names: Vec<String> = match selection {
            Selection::All => self.project.agent_names().map(str::to_string).collect(),
            Selection::Agents(names) => {
                if let Some(unknown) = names.iter().find(|n| self.project.agent(n).is_none()) {
                    return Err(SwarmError::UnknownAgent(unknown.clone()));
                }
                names.clone()
            }
        };
        let agents: Vec<AgentSpec> = names
            .iter()
            .filter_map(|n| self.project.agent(n).cloned())
            .collect();

        let mut results = HashMap::new();
        let mut rx = self
            .pipeline
            .build_all(agents, BuildContext::for_project(&self.project), cancel.clone());
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(result) => {
                        results.insert(result.agent.clone(), result);
                    }
                    None => break,
                },
            }
        }

        let mut report = BuildReport {
            cancelled: cancel.is_cancelled(),
            ..BuildReport::default()
        };
        for name in &names {
            let build = match results.remove(name) {
                Some(result) => {
                    let cached = result.cached();
                    let duration = result.duration;
                    match result.outcome {
                        Ok(built) => AgentBuild {
                            agent: name.clone(),
                            image: Some(built.image),
                            cached,
                            duration,
                            pushed: None,
                            error: None,
                        },
                        Err(e) => AgentBuild {
                            agent: name.clone(),
                            image: None,
                            cached,
                            duration,
                            pushed: None,
                            error: Some(e.into()),
                        },
                    }
                }
                None => AgentBuild {
                    agent: name.clone(),
                    image: None,
                    cached: false,
                    duration: Duration::ZERO,
                    pushed: None,
                    error: Some(StageError::Cancelled {
                        agent: name.clone(),
                        stage: AgentPhase::Building,
                    }),
                },
            };
            report.builds.push(build);
        }

        if push && !report.cancelled {
            self.push_builds(&mut report, &cancel).await;
        }

        let mut tracker = self.tracker.lock().await;
        for build in &report.builds {
            if let Some(image) = &build.image {
                if let Err(e) = tracker.record_image(&build.agent, image.clone()) {
                    obs::emit_state_persist_error(&build.agent, &e);
                    report.persist_errors.push(format!("{}: {e}", build.agent));
                }
            }
        }
        METRICS.flush();
        Ok(report)
    }

    async fn push_builds(&self, report: &mut BuildReport, cancel: &CancelSignal) {
        let session = self
            .registry
            .login(&self.project.registry, self.credentials.as_ref())
            .await;
        for build in report.builds.iter_mut().filter(|b| b.error.is_none()) {
            let Some(image) = build.image.clone() else {
                continue;
            };
            if cancel.is_cancelled() {
                report.cancelled = true;
                build.error = Some(StageError::Cancelled {
                    agent: build.agent.clone(),
                    stage: AgentPhase::Pushing,
                });
                continue;
            }
            let pushed = match &session {
                Ok(session) => self.registry.push(&image, session).await,
                Err(e) => Err(e.clone()),
            };
            match pushed {
                Ok(entry) => build.pushed = Some(entry),
                Err(e) => build.error = Some(e.into()),
            }
        }
    }

    /// Remove `agents` from the provider and forget their records.
    ///
    /// Refuses unless `confirmed`. An agent the provider does not know is
    /// treated as already removed. Records owned by a different provider are
    /// left in place.
    pub async fn teardown(&self, agents: &[String], confirmed: bool) -> Result<TeardownReport> {
        if !confirmed {
            return Err(SwarmError::RemovalNotConfirmed {
                agents: agents.to_vec(),
            });
        }
        let mut report = TeardownReport::default();
        for agent in agents {
            match self.provider.remove(agent).await {
                Ok(()) => report.removed.push(agent.clone()),
                Err(ProviderError::NotFound { .. }) => report.already_absent.push(agent.clone()),
                Err(e) => {
                    warn!(agent = %agent, error = %e, "teardown failed; keeping record");
                    report.failed.push((agent.clone(), e));
                    continue;
                }
            }
            let mut tracker = self.tracker.lock().await;
            if let Some(owner) = tracker.record(agent).map(|r| r.provider) {
                if owner != self.provider.kind() {
                    debug!(agent = %agent, recorded = %owner, "record belongs to another provider; kept");
                    continue;
                }
            }
            if let Err(e) = tracker.forget(agent) {
                obs::emit_state_persist_error(agent, &e);
                report.persist_errors.push(format!("{agent}: {e}"));
            }
        }
        info!(
            removed = report.removed.len(),
            absent = report.already_absent.len(),
            failed = report.failed.len(),
            "teardown finished"
        );
        Ok(report)
    }

    /// Live provider status of every declared agent. Read-only.
    pub async fn live_status(&self) -> BTreeMap<String, std::result::Result<DeploymentRecord, ProviderError>> {
        let mut out = BTreeMap::new();
        for agent in self.project.agent_names() {
            out.insert(agent.to_string(), self.provider.status(agent).await);
        }
        out
    }
}

struct AgentTask {
    agent: AgentSpec,
    deps: Vec<(String, watch::Receiver<AgentPhase>)>,
    phase: watch::Sender<AgentPhase>,
    cancel: CancelSignal,
}

/// Shared, read-only inputs of one run.
struct RunContext {
    build: BuildContext,
    pipeline: Arc<BuildPipeline>,
    registry: Arc<RegistryClient>,
    provider: Arc<dyn Provider>,
    session: std::result::Result<Session, RegistryError>,
    permits: Arc<Semaphore>,
    push_timeout: Duration,
    apply_timeout: Duration,
    apply_retry: RetryPolicy,
    observer: Option<mpsc::UnboundedSender<StageEvent>>,
}

/// Failure of one apply attempt.
#[derive(Debug, thiserror::Error)]
enum ApplyFailure {
    #[error("degraded: {}", .0.last_error.as_deref().unwrap_or("not converged"))]
    Degraded(DeploymentRecord),

    #[error(transparent)]
    Provider(ProviderError),

    #[error("cancelled")]
    Cancelled,
}

impl ApplyFailure {
    fn is_transient(&self) -> bool {
        match self {
            ApplyFailure::Degraded(_) => true,
            ApplyFailure::Provider(e) => !matches!(e, ProviderError::InvalidRequest { .. }),
            ApplyFailure::Cancelled => false,
        }
    }
}

impl RunContext {
    /// Observers hear about a transition before dependents waiting on the
    /// phase channel do.
    fn publish(
        &self,
        agent: &str,
        phase_tx: &watch::Sender<AgentPhase>,
        phase: AgentPhase,
        detail: Option<String>,
    ) {
        obs::emit_stage(agent, phase.as_str(), detail.as_deref());
        if let Some(observer) = &self.observer {
            let _ = observer.send(StageEvent {
                agent: agent.to_string(),
                phase,
                at: chrono::Utc::now(),
                detail,
            });
        }
        phase_tx.send_replace(phase);
    }

    fn fail(&self, task: &AgentTask, mut outcome: AgentOutcome, error: StageError) -> AgentOutcome {
        self.publish(&task.agent.name, &task.phase, AgentPhase::Failed, Some(error.to_string()));
        outcome.phase = AgentPhase::Failed;
        outcome.error = Some(error);
        outcome
    }

    fn cancelled(&self, task: &AgentTask, outcome: AgentOutcome, stage: AgentPhase) -> AgentOutcome {
        let error = StageError::Cancelled {
            agent: task.agent.name.clone(),
            stage,
        };
        self.fail(task, outcome, error)
    }

    async fn run_agent(&self, task: AgentTask) -> AgentOutcome {
        let name = task.agent.name.clone();
        let mut outcome = AgentOutcome::planned(&name);
        let cancel = task.cancel.clone();

        for (dependency, rx) in &task.deps {
            let mut rx = rx.clone();
            let settled = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                phase = rx.wait_for(AgentPhase::is_terminal) => {
                    Some(phase.map(|p| *p).unwrap_or(AgentPhase::Failed))
                }
            };
            match settled {
                None => return self.cancelled(&task, outcome, AgentPhase::Planned),
                Some(AgentPhase::Healthy) => {}
                Some(_) => {
                    let error = StageError::DependencyFailed {
                        agent: name.clone(),
                        dependency: dependency.clone(),
                    };
                    return self.fail(&task, outcome, error);
                }
            }
        }

        // Dependencies are waited on before taking a permit, so a dependent
        // never holds a slot its dependency needs.
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.cancelled(&task, outcome, AgentPhase::Planned),
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
        };

        // Building
        if cancel.is_cancelled() {
            return self.cancelled(&task, outcome, AgentPhase::Planned);
        }
        self.publish(&name, &task.phase, AgentPhase::Building, None);
        let built = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BuildError::Cancelled { agent: name.clone() }),
            result = self.pipeline.build(&task.agent, &self.build) => result.outcome,
        };
        let image = match built {
            Ok(built) => {
                outcome.cached = built.cached;
                outcome.image = Some(built.image.clone());
                built.image
            }
            Err(e) => return self.fail(&task, outcome, e.into()),
        };

        // Pushing
        if cancel.is_cancelled() {
            return self.cancelled(&task, outcome, AgentPhase::Building);
        }
        self.publish(&name, &task.phase, AgentPhase::Pushing, Some(image.tagged()));
        let session = match &self.session {
            Ok(session) => session,
            Err(e) => return self.fail(&task, outcome, e.clone().into()),
        };
        let pushed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.cancelled(&task, outcome, AgentPhase::Pushing),
            result = tokio::time::timeout(self.push_timeout, self.registry.push(&image, session)) => result,
        };
        match pushed {
            Ok(Ok(entry)) => outcome.pushed = Some(entry),
            Ok(Err(e)) => return self.fail(&task, outcome, e.into()),
            Err(_) => {
                let error = RegistryError::transport(format!(
                    "push timed out after {}s",
                    self.push_timeout.as_secs()
                ));
                return self.fail(&task, outcome, error.into());
            }
        }

        // Applying
        if cancel.is_cancelled() {
            return self.cancelled(&task, outcome, AgentPhase::Pushing);
        }
        let desired = DeploymentRecord::desired(
            &name,
            self.provider.kind(),
            task.agent.replicas,
            image,
        );
        self.publish(&name, &task.phase, AgentPhase::Applying, None);
        let mut attempts = 0u32;
        let applied = self
            .apply_retry
            .run(
                "provider.apply",
                |attempt| {
                    attempts = attempt;
                    self.apply_once(&task, &desired, attempt)
                },
                ApplyFailure::is_transient,
                |attempt, err| {
                    METRICS.inc_apply_retries();
                    obs::emit_retry(&name, "apply", attempt, err);
                    self.publish(&name, &task.phase, AgentPhase::Degraded, Some(err.to_string()));
                },
            )
            .await;
        outcome.apply_attempts = attempts;

        match applied {
            Ok(record) => {
                outcome.record = Some(record);
                outcome.phase = AgentPhase::Healthy;
                self.publish(&name, &task.phase, AgentPhase::Healthy, None);
                outcome
            }
            Err(failure) => {
                let (record, error) = match failure {
                    ApplyFailure::Degraded(record) => {
                        let error = StageError::NotConverged {
                            agent: name.clone(),
                            attempts,
                            detail: record
                                .last_error
                                .clone()
                                .unwrap_or_else(|| "not converged".to_string()),
                        };
                        (record, error)
                    }
                    ApplyFailure::Provider(e) => {
                        let mut record = desired.clone();
                        record.last_error = Some(e.to_string());
                        (record, e.into())
                    }
                    ApplyFailure::Cancelled => {
                        let mut record = desired.clone();
                        record.last_error = Some("cancelled".to_string());
                        let error = StageError::Cancelled {
                            agent: name.clone(),
                            stage: AgentPhase::Applying,
                        };
                        (record, error)
                    }
                };
                outcome.record = Some(DeploymentRecord {
                    status: DeploymentStatus::Failed,
                    ..record
                });
                self.fail(&task, outcome, error)
            }
        }
    }

    async fn apply_once(
        &self,
        task: &AgentTask,
        desired: &DeploymentRecord,
        attempt: u32,
    ) -> std::result::Result<DeploymentRecord, ApplyFailure> {
        if attempt > 1 {
            if task.cancel.is_cancelled() {
                return Err(ApplyFailure::Cancelled);
            }
            self.publish(
                &task.agent.name,
                &task.phase,
                AgentPhase::Applying,
                Some(format!("attempt {attempt}")),
            );
        }
        match tokio::time::timeout(self.apply_timeout, self.provider.apply(desired)).await {
            Err(_) => Err(ApplyFailure::Provider(ProviderError::TimedOut {
                agent: task.agent.name.clone(),
                secs: self.apply_timeout.as_secs(),
            })),
            Ok(Err(e)) => Err(ApplyFailure::Provider(e)),
            Ok(Ok(record)) if record.status == DeploymentStatus::Healthy => Ok(record),
            Ok(Ok(record)) => Err(ApplyFailure::Degraded(record)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(agent: &str, phase: AgentPhase) -> AgentOutcome {
        AgentOutcome {
            phase,
            ..AgentOutcome::planned(agent)
        }
    }

    fn report(outcomes: Vec<AgentOutcome>) -> RunReport {
        RunReport {
            run_id: "run-1".to_string(),
            project: "demo".to_string(),
            provider: ProviderKind::Local,
            outcomes,
            cancelled: false,
            duration: Duration::ZERO,
            persist_errors: Vec::new(),
        }
    }

    #[test]
    fn test_report_success_requires_every_agent_healthy() {
        let ok = report(vec![
            outcome("a", AgentPhase::Healthy),
            outcome("b", AgentPhase::Healthy),
        ]);
        assert!(ok.success());

        let mut failed_b = outcome("b", AgentPhase::Failed);
        failed_b.error = Some(StageError::DependencyFailed {
            agent: "b".to_string(),
            dependency: "a".to_string(),
        });
        let partial = report(vec![outcome("a", AgentPhase::Healthy), failed_b]);
        assert!(!partial.success());
        assert_eq!(partial.healthy(), 1);
        assert_eq!(partial.failed(), 1);
        assert_eq!(partial.errors().len(), 1);
        assert!(partial.errors()[0].starts_with("b: dependency a"));
    }

    #[test]
    fn test_persist_error_fails_the_run() {
        let mut r = report(vec![outcome("a", AgentPhase::Healthy)]);
        r.persist_errors.push("a: disk full".to_string());
        assert!(!r.success());
        assert_eq!(r.errors(), vec!["state: a: disk full".to_string()]);
    }

    #[test]
    fn test_selection_from_empty_names_is_all() {
        assert_eq!(Selection::from_names(Vec::new()), Selection::All);
        assert_eq!(
            Selection::from_names(vec!["a".to_string()]),
            Selection::Agents(vec!["a".to_string()])
        );
    }

    #[test]
    fn test_apply_failure_transience() {
        assert!(ApplyFailure::Provider(ProviderError::unavailable("503")).is_transient());
        assert!(!ApplyFailure::Provider(ProviderError::InvalidRequest {
            agent: "a".to_string(),
            reason: "no image".to_string(),
        })
        .is_transient());
        assert!(!ApplyFailure::Cancelled.is_transient());
    }
}
