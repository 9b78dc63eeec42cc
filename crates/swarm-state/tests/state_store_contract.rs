//! Contract tests that every `StateStore` backend must satisfy.

use swarm_state::fakes::MemoryStateStore;
use swarm_state::{
    DeploymentRecord, DeploymentStatus, FsStateStore, ImageRef, ProviderKind, StateStore,
    SwarmRunState,
};

fn record(agent: &str, status: DeploymentStatus) -> DeploymentRecord {
    DeploymentRecord {
        agent: agent.to_string(),
        provider: ProviderKind::Aws,
        desired_replicas: 3,
        observed_replicas: if status == DeploymentStatus::Healthy { 3 } else { 1 },
        image: Some(ImageRef::new(
            format!("registry.example.com/demo/{agent}"),
            "5f2b7c9e01aa",
            "sha256:5f2b7c9e01aa",
        )),
        status,
        last_error: None,
    }
}

fn assert_contract(store: &dyn StateStore) {
    assert!(store.load().expect("load empty").is_none());

    let mut state = SwarmRunState::new("contract");
    state
        .records
        .insert("alpha".to_string(), record("alpha", DeploymentStatus::Healthy));
    state
        .records
        .insert("beta".to_string(), record("beta", DeploymentStatus::Degraded));
    store.save(&state).expect("save");

    let loaded = store.load().expect("load").expect("present");
    assert_eq!(loaded, state);

    state.records.remove("beta");
    store.save(&state).expect("save again");
    let loaded = store.load().expect("load").expect("present");
    assert_eq!(loaded.records.len(), 1);
    assert!(loaded.record("beta").is_none());
}

#[test]
fn memory_store_satisfies_contract() {
    let store = MemoryStateStore::new();
    assert_contract(&store);
    assert_eq!(store.save_count(), 2);
}

#[test]
fn fs_store_satisfies_contract() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FsStateStore::new(dir.path().join(".aiswarm"));
    assert_contract(&store);
}

#[test]
fn fs_store_reads_state_from_older_writer() {
    // A document written before `images` and `last_error` existed.
    let dir = tempfile::tempdir().expect("tempdir");
    let state_dir = dir.path().join(".aiswarm");
    std::fs::create_dir_all(&state_dir).expect("mkdir");
    std::fs::write(
        state_dir.join("state.json"),
        r#"{
  "project": "legacy",
  "records": {
    "alpha": {
      "agent": "alpha",
      "provider": "gcp",
      "desired_replicas": 1,
      "status": "healthy"
    }
  }
}"#,
    )
    .expect("write legacy state");

    let store = FsStateStore::new(&state_dir);
    let state = store.load().expect("load").expect("present");
    assert_eq!(state.schema_version, swarm_state::STATE_SCHEMA_VERSION);
    let alpha = state.record("alpha").expect("alpha");
    assert_eq!(alpha.provider, ProviderKind::Gcp);
    assert_eq!(alpha.observed_replicas, 0);
    assert!(alpha.image.is_none());
}
