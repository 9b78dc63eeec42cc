//! State tracker: the orchestrator's single-writer view of `SwarmRunState`.
//!
//! Every mutation is committed as a whole-document replace through the
//! [`StateStore`]. A commit that would not change the content is skipped, so
//! a converged re-run leaves the persisted state untouched.

use std::sync::Arc;

use chrono::Utc;
use swarm_state::{DeploymentRecord, ImageRef, StateError, StateStore, SwarmRunState};
use tracing::{debug, warn};

use crate::domain::manifest::Project;

/// Difference between the persisted state and the current manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriftReport {
    /// Recorded agents the manifest no longer declares. Removal candidates.
    pub undeclared: Vec<String>,
    /// Declared agents with no deployment record yet.
    pub unrecorded: Vec<String>,
}

impl DriftReport {
    pub fn is_empty(&self) -> bool {
        self.undeclared.is_empty() && self.unrecorded.is_empty()
    }
}

pub struct StateTracker {
    store: Arc<dyn StateStore>,
    prior: SwarmRunState,
    state: SwarmRunState,
    /// Set when the last save failed, so the next commit retries it.
    dirty: bool,
}

impl StateTracker {
    /// Load the persisted state for `project`, starting empty if none exists.
    pub fn open(store: Arc<dyn StateStore>, project: &str) -> Result<Self, StateError> {
        let prior = match store.load()? {
            Some(state) if state.project == project => state,
            Some(state) => {
                warn!(
                    recorded = %state.project,
                    manifest = %project,
                    "state belongs to a different project name; keeping its records"
                );
                SwarmRunState {
                    project: project.to_string(),
                    ..state
                }
            }
            None => SwarmRunState::new(project),
        };
        Ok(Self {
            store,
            state: prior.clone(),
            prior,
            dirty: false,
        })
    }

    /// State as it was when the tracker was opened.
    pub fn prior(&self) -> &SwarmRunState {
        &self.prior
    }

    pub fn snapshot(&self) -> &SwarmRunState {
        &self.state
    }

    pub fn record(&self, agent: &str) -> Option<&DeploymentRecord> {
        self.state.record(agent)
    }

    /// Record an agent's terminal outcome. Returns whether anything was written.
    pub fn record_outcome(
        &mut self,
        agent: &str,
        image: Option<ImageRef>,
        record: Option<DeploymentRecord>,
    ) -> Result<bool, StateError> {
        let mut next = self.state.clone();
        if let Some(image) = image {
            next.images.insert(agent.to_string(), image);
        }
        if let Some(record) = record {
            if let Some(previous) = next.records.get(agent) {
                if previous.provider != record.provider {
                    warn!(
                        agent,
                        previous = %previous.provider,
                        current = %record.provider,
                        "agent moved providers; the earlier deployment is no longer tracked"
                    );
                }
            }
            next.records.insert(agent.to_string(), record);
        }
        self.commit(next)
    }

    pub fn record_image(&mut self, agent: &str, image: ImageRef) -> Result<bool, StateError> {
        self.record_outcome(agent, Some(image), None)
    }

    /// Drop everything recorded for `agent`.
    pub fn forget(&mut self, agent: &str) -> Result<bool, StateError> {
        let mut next = self.state.clone();
        next.records.remove(agent);
        next.images.remove(agent);
        self.commit(next)
    }

    pub fn drift(&self, project: &Project) -> DriftReport {
        DriftReport {
            undeclared: self.state.drifted(project.agent_names()),
            unrecorded: project
                .agent_names()
                .filter(|a| self.state.record(a).is_none())
                .map(str::to_string)
                .collect(),
        }
    }

    fn commit(&mut self, mut next: SwarmRunState) -> Result<bool, StateError> {
        if !self.dirty && next.same_content(&self.state) {
            debug!(project = %next.project, "state unchanged, skipping write");
            return Ok(false);
        }
        next.updated_at = Some(Utc::now());
        self.state = next;
        match self.store.save(&self.state) {
            Ok(()) => {
                self.dirty = false;
                Ok(true)
            }
            Err(e) => {
                self.dirty = true;
                Err(e)
            }
        }
    }
}

/// Read-only load for status and listing commands.
pub fn load_state(store: &dyn StateStore, project: &str) -> Result<SwarmRunState, StateError> {
    Ok(store
        .load()?
        .unwrap_or_else(|| SwarmRunState::new(project)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_state::fakes::MemoryStateStore;
    use swarm_state::{DeploymentStatus, ProviderKind};

    fn healthy(agent: &str) -> DeploymentRecord {
        DeploymentRecord {
            agent: agent.to_string(),
            provider: ProviderKind::Local,
            desired_replicas: 1,
            observed_replicas: 1,
            image: Some(ImageRef::new(format!("demo/{agent}"), "abc", "sha256:abc")),
            status: DeploymentStatus::Healthy,
            last_error: None,
        }
    }

    #[test]
    fn test_identical_outcome_is_not_rewritten() {
        let store = Arc::new(MemoryStateStore::new());
        let mut tracker = StateTracker::open(store.clone(), "demo").unwrap();
        assert!(tracker.record_outcome("a", None, Some(healthy("a"))).unwrap());
        assert!(!tracker.record_outcome("a", None, Some(healthy("a"))).unwrap());
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn test_forget_removes_record_and_image() {
        let store = Arc::new(MemoryStateStore::new());
        let mut tracker = StateTracker::open(store.clone(), "demo").unwrap();
        let image = ImageRef::new("demo/a", "abc", "sha256:abc");
        tracker
            .record_outcome("a", Some(image), Some(healthy("a")))
            .unwrap();
        assert!(tracker.forget("a").unwrap());
        let saved = store.snapshot().unwrap();
        assert!(saved.records.is_empty());
        assert!(saved.images.is_empty());
        assert!(!tracker.forget("a").unwrap());
    }

    #[test]
    fn test_prior_is_kept_from_open() {
        let mut seeded = SwarmRunState::new("demo");
        seeded.records.insert("old".to_string(), healthy("old"));
        let store = Arc::new(MemoryStateStore::with_state(seeded));
        let mut tracker = StateTracker::open(store, "demo").unwrap();
        tracker.forget("old").unwrap();
        assert!(tracker.prior().record("old").is_some());
        assert!(tracker.snapshot().record("old").is_none());
    }
}
