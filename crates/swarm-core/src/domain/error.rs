//! Domain-level error taxonomy for aiswarm.

use std::fmt;
use std::path::PathBuf;

use crate::build::BuildError;
use crate::provider::ProviderError;
use crate::registry::RegistryError;

/// One problem found while validating a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Dotted path of the offending field, e.g. `agents[2].resources.cpu`.
    pub field: String,
    pub reason: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// Manifest validation failure carrying every violation found.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct ManifestError {
    pub violations: Vec<Violation>,
}

impl ManifestError {
    pub fn single(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            violations: vec![Violation::new(field, reason)],
        }
    }

    /// Violations whose field path starts with `prefix`.
    pub fn for_field<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a Violation> + 'a {
        self.violations
            .iter()
            .filter(move |v| v.field.starts_with(prefix))
    }
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid manifest ({} violation", self.violations.len())?;
        if self.violations.len() != 1 {
            f.write_str("s")?;
        }
        f.write_str(")")?;
        for v in &self.violations {
            write!(f, "\n  - {v}")?;
        }
        Ok(())
    }
}

/// A dependency cycle among agents; fatal for the whole run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("dependency cycle detected involving agents: {agents:?}")]
pub struct DependencyCycleError {
    pub agents: Vec<String>,
}

/// aiswarm domain errors.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    DependencyCycle(#[from] DependencyCycleError),

    #[error("build error: {0}")]
    Build(#[from] BuildError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("state error: {0}")]
    State(#[from] swarm_state::StateError),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("removal of {agents:?} requires explicit confirmation")]
    RemovalNotConfirmed { agents: Vec<String> },

    #[error("{0} is already a swarm project")]
    ProjectExists(PathBuf),

    #[error("project initialization failed: {0}")]
    ProjectInit(String),

    #[error("manifest parse error: {0}")]
    ManifestParse(#[from] serde_yaml::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for aiswarm domain operations.
pub type Result<T> = std::result::Result<T, SwarmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_error_lists_every_violation() {
        let err = ManifestError {
            violations: vec![
                Violation::new("agents[1].name", "duplicate agent name 'triage'"),
                Violation::new("agents[3].replicas", "must be >= 0, got -2"),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 violations"));
        assert!(msg.contains("agents[1].name: duplicate agent name 'triage'"));
        assert!(msg.contains("agents[3].replicas"));
    }

    #[test]
    fn test_for_field_filters_by_prefix() {
        let err = ManifestError {
            violations: vec![
                Violation::new("agents[0].resources.cpu", "bad"),
                Violation::new("registry.type", "bad"),
            ],
        };
        assert_eq!(err.for_field("agents[0]").count(), 1);
        assert_eq!(err.for_field("registry").count(), 1);
    }

    #[test]
    fn test_dependency_cycle_error_displays_agent_names() {
        let err = DependencyCycleError {
            agents: vec!["planner".to_string(), "executor".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("planner"));
        assert!(msg.contains("executor"));
    }

    #[test]
    fn test_swarm_error_wraps_cycle_transparently() {
        let err: SwarmError = DependencyCycleError {
            agents: vec!["a".to_string()],
        }
        .into();
        assert!(err.to_string().starts_with("dependency cycle"));
    }
}
