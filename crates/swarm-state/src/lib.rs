//! Swarm-State: durable run state for aiswarm
//!
//! This crate is the persistence layer of the swarm lifecycle manager. It
//! owns the records that survive between CLI invocations.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: crash-safe writes, forward-compatible reads.
//!
//! ## Key Components
//!
//! - `DeploymentRecord`: desired vs. observed state of one deployed agent
//! - `SwarmRunState`: every record of a project, persisted as one document
//! - `StateStore`: load/save contract with a filesystem and an in-memory backend

mod error;
pub mod fakes;
pub mod records;
pub mod store;

pub use error::StateError;
pub use records::{
    DeploymentRecord, DeploymentStatus, ImageRef, ProviderKind, SwarmRunState,
    STATE_SCHEMA_VERSION,
};
pub use store::{FsStateStore, StateStore};

/// Result type for swarm-state operations
pub type Result<T> = std::result::Result<T, StateError>;
