//! aiswarm CLI
//!
//! Command-line interface for building, registering and deploying agent
//! swarms described by an `aiswarm.yaml` manifest.

mod render;

use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use swarm_core::provider::ComposeRuntime;
use swarm_core::scaffold::{
    active_agent, create_agent, init_project, set_active_agent, AgentTemplate, InitOptions,
    ProjectTemplate,
};
use swarm_core::{
    cancel_pair, create_provider, load_state, smoke_test, BuildContext, BuildPipeline,
    CancelSignal, CloudApi, Credentials, DockerCliEngine, DockerComposeRuntime,
    DockerRegistryBackend, HttpControlPlane, ListFilter, Orchestrator, Project, Provider,
    ProviderDeps, RegistryClient, Selection, Session, StateTracker, SwarmConfig, SwarmError,
    MANIFEST_FILE,
};
use swarm_state::{FsStateStore, ImageRef, ProviderKind, StateStore};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn, Level};

use render::OutputFormat;

#[derive(Parser)]
#[command(name = "aiswarm")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build, register and deploy containerized AI agent swarms", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    /// Report format on stdout
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    /// Project directory (default: the project enclosing the working directory)
    #[arg(short = 'C', long, global = true)]
    project: Option<PathBuf>,

    /// State directory (overrides AISWARM_STATE_DIR)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Agents processed in parallel (overrides AISWARM_MAX_PARALLEL_BUILDS)
    #[arg(long, global = true)]
    max_parallel: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new swarm project
    Init {
        /// Project name
        name: String,

        /// Directory the project is created in
        #[arg(short, long, default_value = ".")]
        path: PathBuf,

        /// Container registry URL
        #[arg(short, long)]
        registry: Option<String>,

        /// Deployment provider (local, aws, gcp, azure)
        #[arg(long, default_value = "aws")]
        provider: ProviderKind,

        /// Project template (basic, distributed, monitoring)
        #[arg(short, long, default_value = "basic")]
        template: ProjectTemplate,

        /// Initialize even if the target directory is not empty
        #[arg(short, long)]
        force: bool,
    },

    /// Manage the agents of the project
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },

    /// Build agent images
    Build {
        /// Push built images to the registry
        #[arg(long)]
        push: bool,

        /// Agent to build (repeatable; default: the active agent, else all)
        #[arg(short, long = "agent")]
        agents: Vec<String>,

        /// Build every agent, ignoring the active agent
        #[arg(long, conflicts_with = "agents")]
        all: bool,
    },

    /// Build, push and deploy the swarm
    Deploy {
        /// Deploy to the local compose runtime
        #[arg(long, conflicts_with = "provider")]
        local: bool,

        /// Deployment provider (default: the manifest's infrastructure.provider)
        #[arg(long)]
        provider: Option<ProviderKind>,

        /// Print the plan without building or deploying anything
        #[arg(long)]
        dry_run: bool,

        /// Agent to deploy, with its dependencies (repeatable; default: all)
        #[arg(short, long = "agent")]
        agents: Vec<String>,
    },

    /// Interact with the container registry
    Registry {
        #[command(subcommand)]
        action: RegistryAction,
    },

    /// Show recorded and live deployment status
    Status {
        /// Query the provider for live state
        #[arg(long)]
        live: bool,

        /// Provider to query with --live
        #[arg(long)]
        provider: Option<ProviderKind>,
    },

    /// Remove deployed agents
    Teardown {
        /// Agent to remove (repeatable; default: every deployed agent)
        #[arg(short, long = "agent")]
        agents: Vec<String>,

        /// Provider to remove from
        #[arg(long)]
        provider: Option<ProviderKind>,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum AgentAction {
    /// Scaffold a new agent and add it to the manifest
    Create {
        /// Agent name
        name: String,

        /// Agent template (basic, worker)
        #[arg(short, long, default_value = "basic")]
        template: AgentTemplate,
    },
    /// List declared agents with their recorded status
    List,
    /// Build an agent and run one local test replica
    Test {
        /// Agent name (default: the active agent)
        name: Option<String>,
    },
    /// Set the active agent used when a command omits one
    Use {
        /// Agent name
        name: String,
    },
}

#[derive(Subcommand)]
enum RegistryAction {
    /// Authenticate against the project's registry
    Login {
        /// Registry user (default: AISWARM_REGISTRY_USERNAME)
        #[arg(short, long)]
        username: Option<String>,

        /// Read the password from stdin
        #[arg(long, requires = "username")]
        password_stdin: bool,
    },
    /// Push an agent's last built image
    Push {
        /// Agent name (default: the active agent)
        agent: Option<String>,
    },
    /// Pull an image into the local engine
    Pull {
        /// Image reference, e.g. registry.example.com/demo/triage:0123456789ab
        reference: String,
    },
    /// List pushed images
    List {
        /// Only this agent's repository (default: every agent)
        agent: Option<String>,

        /// Only tags starting with this prefix
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Publish an agent's last built image publicly under a semantic tag
    Publish {
        /// Semantic tag, e.g. v1.2.0
        tag: String,

        /// Agent name (default: the active agent)
        #[arg(short, long)]
        agent: Option<String>,
    },
}

/// Flags that apply to every command.
struct Globals {
    output: OutputFormat,
    project: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    max_parallel: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    swarm_core::init_tracing(cli.json, level);

    let globals = Globals {
        output: cli.output,
        project: cli.project,
        state_dir: cli.state_dir,
        max_parallel: cli.max_parallel,
    };

    match cli.command {
        Commands::Init {
            name,
            path,
            registry,
            provider,
            template,
            force,
        } => {
            let mut options = InitOptions::new(name, path);
            options.registry = registry;
            options.provider = provider;
            options.template = template;
            options.force = force;
            cmd_init(&options)
        }
        Commands::Agent { action } => match action {
            AgentAction::Create { name, template } => {
                cmd_agent_create(&globals, &name, template)
            }
            AgentAction::List => cmd_agent_list(&Workspace::open(&globals)?),
            AgentAction::Test { name } => cmd_agent_test(&Workspace::open(&globals)?, name).await,
            AgentAction::Use { name } => cmd_agent_use(&Workspace::open(&globals)?, &name),
        },
        Commands::Build { push, agents, all } => {
            cmd_build(&Workspace::open(&globals)?, agents, all, push).await
        }
        Commands::Deploy {
            local,
            provider,
            dry_run,
            agents,
        } => {
            let ws = Workspace::open(&globals)?;
            let kind = ws.provider_kind(local, provider);
            cmd_deploy(&ws, kind, dry_run, agents).await
        }
        Commands::Registry { action } => {
            let ws = Workspace::open(&globals)?;
            match action {
                RegistryAction::Login {
                    username,
                    password_stdin,
                } => cmd_registry_login(&ws, username, password_stdin).await,
                RegistryAction::Push { agent } => cmd_registry_push(&ws, agent, None).await,
                RegistryAction::Publish { tag, agent } => {
                    cmd_registry_push(&ws, agent, Some(&tag)).await
                }
                RegistryAction::Pull { reference } => cmd_registry_pull(&ws, &reference).await,
                RegistryAction::List { agent, prefix } => {
                    cmd_registry_list(&ws, agent, prefix).await
                }
            }
        }
        Commands::Status { live, provider } => {
            let ws = Workspace::open(&globals)?;
            let kind = ws.provider_kind(false, provider);
            cmd_status(&ws, live.then_some(kind)).await
        }
        Commands::Teardown {
            agents,
            provider,
            yes,
        } => {
            let ws = Workspace::open(&globals)?;
            let kind = ws.provider_kind(false, provider);
            cmd_teardown(&ws, kind, agents, yes).await
        }
    }
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Nearest directory at or above `start` holding a manifest.
fn find_manifest_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(MANIFEST_FILE).is_file())
        .map(Path::to_path_buf)
}

fn project_root(globals: &Globals) -> Result<PathBuf> {
    let start = match &globals.project {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    find_manifest_root(&start).ok_or_else(|| {
        anyhow!(
            "No {} found in {} or any parent directory (run `aiswarm init` first)",
            MANIFEST_FILE,
            start.display()
        )
    })
}

// ---------------------------------------------------------------------------
// Workspace wiring
// ---------------------------------------------------------------------------

/// A loaded project plus the collaborators every command is built from.
struct Workspace {
    project: Project,
    config: SwarmConfig,
    state_dir: PathBuf,
    output: OutputFormat,
}

impl Workspace {
    fn open(globals: &Globals) -> Result<Self> {
        let root = project_root(globals)?;
        let project = Project::load(&root)
            .with_context(|| format!("Failed to load {}", root.join(MANIFEST_FILE).display()))?;

        let mut config = SwarmConfig::from_env();
        if let Some(dir) = &globals.state_dir {
            config.state_dir = Some(dir.clone());
        }
        if let Some(n) = globals.max_parallel.filter(|n| *n > 0) {
            config.max_parallel_builds = n;
        }
        let state_dir = config
            .state_dir
            .clone()
            .unwrap_or_else(|| project.state_dir());

        info!(project = %project.name, agents = project.agents.len(), "project loaded");
        Ok(Self {
            project,
            config,
            state_dir,
            output: globals.output,
        })
    }

    fn provider_kind(&self, local: bool, provider: Option<ProviderKind>) -> ProviderKind {
        if local {
            ProviderKind::Local
        } else {
            provider.unwrap_or(self.project.infrastructure.provider)
        }
    }

    fn store(&self) -> Arc<dyn StateStore> {
        Arc::new(FsStateStore::new(&self.state_dir))
    }

    fn pipeline(&self) -> Arc<BuildPipeline> {
        Arc::new(BuildPipeline::new(
            Arc::new(DockerCliEngine::default()),
            self.config.build_config(),
        ))
    }

    fn registry(&self) -> Arc<RegistryClient> {
        Arc::new(
            RegistryClient::new(
                Arc::new(DockerRegistryBackend::default()),
                self.config.push_retry(),
            )
            .with_timeout(self.config.registry_attempt_timeout()),
        )
    }

    fn compose(&self) -> Arc<dyn ComposeRuntime> {
        Arc::new(DockerComposeRuntime::new(self.state_dir.join("compose")))
    }

    fn provider(&self, kind: ProviderKind) -> Result<Arc<dyn Provider>> {
        let cloud = match &self.config.control_plane_url {
            Some(url) => Some(Arc::new(
                HttpControlPlane::new(url).context("Invalid control-plane URL")?,
            ) as Arc<dyn CloudApi>),
            None => None,
        };
        let deps = ProviderDeps {
            compose: self.compose(),
            cloud,
        };
        create_provider(&self.project, kind, deps).with_context(|| {
            format!("Provider '{kind}' is not available (is AISWARM_CONTROL_PLANE_URL set?)")
        })
    }

    fn orchestrator(&self, kind: ProviderKind) -> Result<Orchestrator> {
        let tracker = StateTracker::open(self.store(), &self.project.name)
            .context("Failed to open swarm state")?;
        Ok(Orchestrator::new(
            self.project.clone(),
            self.pipeline(),
            self.registry(),
            self.provider(kind)?,
            tracker,
            self.config.orchestrator_config(),
        )
        .with_credentials(self.config.credentials.clone()))
    }

    fn active_agent(&self) -> Result<Option<String>> {
        Ok(active_agent(&self.state_dir)?)
    }

    /// `name`, else the active agent.
    fn agent_or_active(&self, name: Option<String>) -> Result<String> {
        match name {
            Some(name) => Ok(name),
            None => self.active_agent()?.ok_or_else(|| {
                anyhow!("No agent given and no active agent set (run `aiswarm agent use <name>`)")
            }),
        }
    }

    async fn login(&self, registry: &RegistryClient) -> Result<Session> {
        registry
            .login(&self.project.registry, self.config.credentials.as_ref())
            .await
            .context("Registry login failed")
    }

    /// The image `aiswarm build` last recorded for `agent`.
    fn recorded_image(&self, agent: &str) -> Result<ImageRef> {
        if self.project.agent(agent).is_none() {
            return Err(SwarmError::UnknownAgent(agent.to_string()).into());
        }
        let state = load_state(self.store().as_ref(), &self.project.name)?;
        state.images.get(agent).cloned().ok_or_else(|| {
            anyhow!("No image built for '{agent}' yet (run `aiswarm build --agent {agent}`)")
        })
    }
}

/// Cancel the returned signal on Ctrl-C.
fn cancel_on_interrupt() -> CancelSignal {
    let (handle, signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            handle.cancel();
        }
    });
    signal
}

/// Print stage events to stderr while a run is in progress.
fn attach_progress(
    orchestrator: Orchestrator,
    output: OutputFormat,
) -> (Orchestrator, Option<JoinHandle<()>>) {
    if output != OutputFormat::Text {
        return (orchestrator, None);
    }
    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            render::stage_event(&event);
        }
    });
    (orchestrator.with_observer(tx), Some(printer))
}

async fn finish_progress(orchestrator: Orchestrator, printer: Option<JoinHandle<()>>) {
    drop(orchestrator);
    if let Some(printer) = printer {
        printer.await.ok();
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_init(options: &InitOptions) -> Result<ExitCode> {
    let dir = init_project(options)
        .with_context(|| format!("Failed to initialize project '{}'", options.name))?;

    println!("Initialized swarm project '{}' at {}", options.name, dir.display());
    println!("  provider: {}", options.provider);
    println!("  template: {}", options.template);
    println!();
    println!("Next steps:");
    println!("  cd {}", dir.display());
    println!("  aiswarm agent create <name>");
    println!("  aiswarm deploy --local");
    Ok(ExitCode::SUCCESS)
}

fn cmd_agent_create(globals: &Globals, name: &str, template: AgentTemplate) -> Result<ExitCode> {
    let root = project_root(globals)?;
    let dir = create_agent(&root, name, template)
        .with_context(|| format!("Failed to create agent '{name}'"))?;
    println!("Created agent '{}' at {}", name, dir.display());
    Ok(ExitCode::SUCCESS)
}

fn cmd_agent_list(ws: &Workspace) -> Result<ExitCode> {
    let state = load_state(ws.store().as_ref(), &ws.project.name)?;
    let active = ws.active_agent()?;
    render::agent_list(ws.output, &ws.project, &state, active.as_deref())?;
    Ok(ExitCode::SUCCESS)
}

async fn cmd_agent_test(ws: &Workspace, name: Option<String>) -> Result<ExitCode> {
    let agent = ws.agent_or_active(name)?;
    let pipeline = ws.pipeline();
    let report = smoke_test(&ws.project, &agent, &pipeline, ws.compose())
        .await
        .with_context(|| format!("Agent test for '{agent}' failed"))?;
    render::smoke(ws.output, &report)?;
    Ok(exit_code(report.passed()))
}

fn cmd_agent_use(ws: &Workspace, name: &str) -> Result<ExitCode> {
    set_active_agent(&ws.project, &ws.state_dir, name)?;
    println!("Active agent: {name}");
    Ok(ExitCode::SUCCESS)
}

async fn cmd_build(ws: &Workspace, agents: Vec<String>, all: bool, push: bool) -> Result<ExitCode> {
    let selection = if all {
        Selection::All
    } else if agents.is_empty() {
        match ws.active_agent()? {
            Some(agent) => Selection::Agents(vec![agent]),
            None => Selection::All,
        }
    } else {
        Selection::Agents(agents)
    };

    // Building never reaches a provider; the local one needs no credentials.
    let orchestrator = ws.orchestrator(ProviderKind::Local)?;
    let report = orchestrator
        .build_images(&selection, push, cancel_on_interrupt())
        .await?;
    render::build_report(ws.output, &report)?;
    Ok(exit_code(report.success()))
}

async fn cmd_deploy(
    ws: &Workspace,
    kind: ProviderKind,
    dry_run: bool,
    agents: Vec<String>,
) -> Result<ExitCode> {
    let selection = Selection::from_names(agents);
    let orchestrator = ws.orchestrator(kind)?;

    if dry_run {
        let plan = orchestrator.plan(&selection).await?;
        render::plan(ws.output, &plan)?;
        return Ok(ExitCode::SUCCESS);
    }

    let (orchestrator, printer) = attach_progress(orchestrator, ws.output);
    let report = orchestrator.deploy(&selection, cancel_on_interrupt()).await;
    finish_progress(orchestrator, printer).await;
    let report = report?;

    render::run_report(ws.output, &report)?;
    Ok(exit_code(report.success()))
}

async fn cmd_registry_login(
    ws: &Workspace,
    username: Option<String>,
    password_stdin: bool,
) -> Result<ExitCode> {
    let credentials = match username {
        Some(username) if password_stdin => {
            let mut password = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut password)
                .context("Failed to read password from stdin")?;
            Some(Credentials::new(username, password.trim_end_matches(['\r', '\n'])))
        }
        Some(username) => match &ws.config.credentials {
            Some(env) => Some(Credentials::new(username, env.password())),
            None => bail!("No password given (use --password-stdin or AISWARM_REGISTRY_PASSWORD)"),
        },
        None => ws.config.credentials.clone(),
    };

    let registry = ws.registry();
    let session = registry
        .login(&ws.project.registry, credentials.as_ref())
        .await
        .context("Registry login failed")?;
    match &session.credentials {
        Some(c) => println!("Logged in to {} as {}", session.display_registry(), c.username),
        None => println!("Using {} anonymously", session.display_registry()),
    }
    Ok(ExitCode::SUCCESS)
}

/// Push (or, with `semantic_tag`, publish) an agent's last built image.
async fn cmd_registry_push(
    ws: &Workspace,
    agent: Option<String>,
    semantic_tag: Option<&str>,
) -> Result<ExitCode> {
    let agent = ws.agent_or_active(agent)?;
    let image = ws.recorded_image(&agent)?;
    let registry = ws.registry();
    let session = ws.login(&registry).await?;

    let entry = match semantic_tag {
        Some(tag) => registry
            .publish(&image, &session, tag)
            .await
            .with_context(|| format!("Failed to publish {image} as {tag}"))?,
        None => registry
            .push(&image, &session)
            .await
            .with_context(|| format!("Failed to push {image}"))?,
    };
    render::registry_entries(ws.output, std::slice::from_ref(&entry))?;
    Ok(ExitCode::SUCCESS)
}

async fn cmd_registry_pull(ws: &Workspace, reference: &str) -> Result<ExitCode> {
    let registry = ws.registry();
    let session = ws.login(&registry).await?;
    let image = registry
        .pull(reference, &session)
        .await
        .with_context(|| format!("Failed to pull {reference}"))?;
    println!("Pulled {} ({})", image.reference, image.image_id);
    Ok(ExitCode::SUCCESS)
}

async fn cmd_registry_list(
    ws: &Workspace,
    agent: Option<String>,
    prefix: Option<String>,
) -> Result<ExitCode> {
    let agents: Vec<String> = match agent {
        Some(agent) if ws.project.agent(&agent).is_none() => {
            return Err(SwarmError::UnknownAgent(agent).into())
        }
        Some(agent) => vec![agent],
        None => ws.project.agent_names().map(str::to_string).collect(),
    };

    let registry = ws.registry();
    let session = ws.login(&registry).await?;
    let ctx = BuildContext::for_project(&ws.project);

    let mut entries = Vec::new();
    for agent in &agents {
        let mut filter = ListFilter::repository(ctx.repository(agent));
        if let Some(prefix) = &prefix {
            filter = filter.with_tag_prefix(prefix.clone());
        }
        let mut found: Vec<_> = registry
            .list(&session, filter)
            .try_collect()
            .await
            .with_context(|| format!("Failed to list images of '{agent}'"))?;
        entries.append(&mut found);
    }
    render::registry_entries(ws.output, &entries)?;
    Ok(ExitCode::SUCCESS)
}

async fn cmd_status(ws: &Workspace, live: Option<ProviderKind>) -> Result<ExitCode> {
    let tracker = StateTracker::open(ws.store(), &ws.project.name)
        .context("Failed to read swarm state")?;
    let drift = tracker.drift(&ws.project);

    let live = match live {
        Some(kind) => Some(ws.orchestrator(kind)?.live_status().await),
        None => None,
    };
    render::status(ws.output, &ws.project, tracker.snapshot(), &drift, live.as_ref())?;
    Ok(ExitCode::SUCCESS)
}

async fn cmd_teardown(
    ws: &Workspace,
    kind: ProviderKind,
    agents: Vec<String>,
    yes: bool,
) -> Result<ExitCode> {
    let orchestrator = ws.orchestrator(kind)?;
    let agents = if agents.is_empty() {
        // Dependents first, then anything recorded on this provider but no
        // longer declared.
        let plan = orchestrator.plan(&Selection::All).await?;
        let state = orchestrator.state().await;
        plan.order()
            .into_iter()
            .rev()
            .filter(|a| state.record(a).is_some_and(|r| r.provider == kind))
            .map(str::to_string)
            .chain(
                plan.drift
                    .undeclared
                    .iter()
                    .filter(|a| state.record(a).is_some_and(|r| r.provider == kind))
                    .cloned(),
            )
            .collect::<Vec<_>>()
    } else {
        agents
    };

    if agents.is_empty() {
        println!("Nothing to tear down");
        return Ok(ExitCode::SUCCESS);
    }

    let confirmed = yes || confirm(&format!("Remove {} from {kind}?", agents.join(", ")))?;
    match orchestrator.teardown(&agents, confirmed).await {
        Ok(report) => {
            render::teardown(ws.output, &report)?;
            Ok(exit_code(report.success()))
        }
        Err(SwarmError::RemovalNotConfirmed { .. }) => {
            eprintln!("Aborted; nothing was removed (pass --yes to skip this prompt)");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}

/// Ask on the terminal; anything but `y`/`yes` declines. Never asks when
/// stdin is not a terminal.
fn confirm(question: &str) -> Result<bool> {
    let stdin = std::io::stdin();
    if !stdin.is_terminal() {
        return Ok(false);
    }
    eprint!("{question} [y/N] ");
    std::io::stderr().flush().ok();
    let mut answer = String::new();
    stdin
        .lock()
        .read_line(&mut answer)
        .context("Failed to read confirmation")?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
