//! AI Swarm core library
//!
//! Builds, registers and deploys containerized agent swarms described by a
//! single `aiswarm.yaml` manifest.
//!
//! ## Layers
//!
//! - `domain`: manifest model, quantities, digests and errors
//! - `build`, `registry`, `provider`: the three external stages of a run
//! - `orchestrator`: dependency-ordered, cancellable runs over those stages
//! - `tracker`: the single writer of persisted run state
//! - `scaffold`: `init` and `agent create`
//! - `smoke`: `agent test` against a throwaway local replica

pub mod build;
pub mod config;
pub mod domain;
pub mod fakes;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod scaffold;
pub mod smoke;
pub mod telemetry;
pub mod tracker;

pub use domain::{
    validate, AgentSpec, ContentDigest, CpuQuantity, DependencyCycleError, ManifestError,
    MemoryQuantity, Project, RegistryConfig, RegistryKind, ResourceRequest, Result, SwarmError,
    Violation, MANIFEST_FILE,
};

pub use build::{
    BuildConfig, BuildContext, BuildEngine, BuildError, BuildPipeline, BuildResult, BuiltImage,
    DockerCliEngine,
};

pub use registry::{
    Credentials, DockerRegistryBackend, ListFilter, RegistryBackend, RegistryClient,
    RegistryEntry, RegistryError, Session, Visibility,
};

pub use provider::{
    create_provider, CloudApi, DockerComposeRuntime, HttpControlPlane, Provider, ProviderDeps,
    ProviderError, ReconcilingProvider, TargetSpec,
};

pub use orchestrator::{
    cancel_pair, AgentOutcome, AgentPhase, BuildReport, CancelHandle, CancelSignal, Orchestrator,
    OrchestratorConfig, RunPlan, RunReport, Selection, StageError, StageEvent, TeardownReport,
};

pub use smoke::{smoke_test, SmokeReport};
pub use tracker::{load_state, DriftReport, StateTracker};

pub use config::SwarmConfig;
pub use retry::RetryPolicy;
pub use telemetry::init_tracing;

/// Crate version, shared by every workspace member.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
