//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryStateStore`, which satisfies the `StateStore` contract
//! without touching the filesystem and counts writes so tests can assert
//! that a converged re-run does not rewrite state.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::records::SwarmRunState;
use crate::store::StateStore;
use crate::error::StateError;
use crate::Result;

/// In-memory state store backed by a single `Option<SwarmRunState>` slot.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    slot: Mutex<Option<SwarmRunState>>,
    saves: AtomicUsize,
    failing_saves: AtomicU32,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed the store, as if a previous run had saved `state`.
    pub fn with_state(state: SwarmRunState) -> Self {
        Self {
            slot: Mutex::new(Some(state)),
            saves: AtomicUsize::new(0),
            failing_saves: AtomicU32::new(0),
        }
    }

    /// The next `n` saves fail as if the disk were full.
    pub fn fail_next_saves(&self, n: u32) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    /// Number of successful `save` calls.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Option<SwarmRunState> {
        self.slot.lock().unwrap().clone()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<Option<SwarmRunState>> {
        Ok(self.slot.lock().unwrap().clone())
    }

    fn save(&self, state: &SwarmRunState) -> Result<()> {
        let failing = self
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StateError::io(
                PathBuf::from("memory://state.json"),
                std::io::Error::new(std::io::ErrorKind::Other, "no space left on device"),
            ));
        }
        *self.slot.lock().unwrap() = Some(state.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
