//! Per-agent pipeline phases and the events published on each transition.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where one agent is in its build → push → apply pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Planned,
    Building,
    Pushing,
    Applying,
    /// Partial convergence or a provider error; apply will be retried.
    Degraded,
    Healthy,
    Failed,
}

impl AgentPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentPhase::Planned => "planned",
            AgentPhase::Building => "building",
            AgentPhase::Pushing => "pushing",
            AgentPhase::Applying => "applying",
            AgentPhase::Degraded => "degraded",
            AgentPhase::Healthy => "healthy",
            AgentPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentPhase::Healthy | AgentPhase::Failed)
    }

    /// Legal transitions of the per-agent state machine.
    pub fn can_transition_to(&self, next: AgentPhase) -> bool {
        use AgentPhase::*;
        matches!(
            (self, next),
            (Planned, Building)
                | (Planned, Failed)
                | (Building, Pushing)
                | (Building, Failed)
                | (Pushing, Applying)
                | (Pushing, Failed)
                | (Applying, Healthy)
                | (Applying, Degraded)
                | (Applying, Failed)
                | (Degraded, Applying)
                | (Degraded, Failed)
        )
    }
}

impl fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published on every phase transition of every agent in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEvent {
    pub agent: String,
    pub phase: AgentPhase,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_is_legal() {
        let path = [
            AgentPhase::Planned,
            AgentPhase::Building,
            AgentPhase::Pushing,
            AgentPhase::Applying,
            AgentPhase::Degraded,
            AgentPhase::Applying,
            AgentPhase::Healthy,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_terminal_phases_are_final() {
        for next in [AgentPhase::Building, AgentPhase::Applying, AgentPhase::Planned] {
            assert!(!AgentPhase::Healthy.can_transition_to(next));
            assert!(!AgentPhase::Failed.can_transition_to(next));
        }
        assert!(!AgentPhase::Building.can_transition_to(AgentPhase::Healthy));
    }

    #[test]
    fn test_phase_serializes_snake_case() {
        let json = serde_json::to_string(&AgentPhase::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
    }
}
