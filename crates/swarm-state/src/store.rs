//! State store trait and the filesystem backend.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::StateError;
use crate::records::{SwarmRunState, STATE_SCHEMA_VERSION};
use crate::Result;

/// File name of the state document inside the state directory.
pub const STATE_FILE: &str = "state.json";

/// Durable storage for a project's [`SwarmRunState`].
///
/// Guarantees:
/// - `save` replaces the whole document atomically; readers observe either
///   the previous or the new state, never a mix.
/// - `load` returns `None` when nothing has been saved yet.
pub trait StateStore: Send + Sync {
    /// Load the persisted state, if any.
    fn load(&self) -> Result<Option<SwarmRunState>>;

    /// Atomically replace the persisted state.
    fn save(&self, state: &SwarmRunState) -> Result<()>;
}

/// Filesystem-backed store writing `<dir>/state.json`.
#[derive(Debug, Clone)]
pub struct FsStateStore {
    dir: PathBuf,
}

impl FsStateStore {
    /// Create a store rooted at `dir`. The directory is created on first save.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }
}

impl StateStore for FsStateStore {
    fn load(&self) -> Result<Option<SwarmRunState>> {
        let path = self.path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::io(path, e)),
        };

        let state: SwarmRunState =
            serde_json::from_slice(&bytes).map_err(|e| StateError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        if state.schema_version > STATE_SCHEMA_VERSION {
            warn!(
                path = %path.display(),
                found = state.schema_version,
                supported = STATE_SCHEMA_VERSION,
                "state written by a newer aiswarm; unknown fields are ignored"
            );
        }
        Ok(Some(state))
    }

    fn save(&self, state: &SwarmRunState) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| StateError::io(&self.dir, e))?;
        let path = self.path();

        let mut body = serde_json::to_vec_pretty(state)?;
        body.push(b'\n');

        // Atomic write: temp file in the same directory, then rename over.
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| StateError::io(&self.dir, e))?;
        tmp.write_all(&body)
            .map_err(|e| StateError::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| StateError::io(tmp.path(), e))?;
        tmp.persist(&path)
            .map_err(|e| StateError::io(&path, e.error))?;

        debug!(path = %path.display(), records = state.records.len(), "state saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{DeploymentRecord, DeploymentStatus, ImageRef, ProviderKind};

    fn make_store() -> (tempfile::TempDir, FsStateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStateStore::new(dir.path().join(".aiswarm"));
        (dir, store)
    }

    fn sample_state() -> SwarmRunState {
        let mut state = SwarmRunState::new("demo");
        state.records.insert(
            "alpha".to_string(),
            DeploymentRecord {
                agent: "alpha".to_string(),
                provider: ProviderKind::Local,
                desired_replicas: 2,
                observed_replicas: 2,
                image: Some(ImageRef::new("demo/alpha", "0123456789ab", "sha256:00")),
                status: DeploymentStatus::Healthy,
                last_error: None,
            },
        );
        state
    }

    #[test]
    fn load_missing_returns_none() {
        let (_dir, store) = make_store();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_then_load_roundtrip() {
        let (_dir, store) = make_store();
        let state = sample_state();
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), Some(state));
    }

    #[test]
    fn save_replaces_whole_document() {
        let (_dir, store) = make_store();
        store.save(&sample_state()).unwrap();

        let empty = SwarmRunState::new("demo");
        store.save(&empty).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert!(loaded.records.is_empty());
    }

    #[test]
    fn save_leaves_no_temp_files() {
        let (dir, store) = make_store();
        store.save(&sample_state()).unwrap();
        store.save(&sample_state()).unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path().join(".aiswarm"))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn corrupt_document_is_reported() {
        let (dir, store) = make_store();
        std::fs::create_dir_all(dir.path().join(".aiswarm")).unwrap();
        std::fs::write(store.path(), b"{ not json").unwrap();
        match store.load() {
            Err(StateError::Corrupt { path, .. }) => assert_eq!(path, store.path()),
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }
}
