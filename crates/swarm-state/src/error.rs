//! Error types for swarm-state

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in the state persistence layer
#[derive(Error, Debug)]
pub enum StateError {
    /// Filesystem error while reading or replacing the state document
    #[error("state io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The state document exists but is not valid JSON for this schema
    #[error("corrupt state document at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unknown provider name in a persisted record or on the command line
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

impl StateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StateError::Io {
            path: path.into(),
            source,
        }
    }
}
