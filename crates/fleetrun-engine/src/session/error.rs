//! Session errors.

use std::path::{Path, PathBuf};

use super::SessionStatus;

/// Errors from session store and manager operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found: {name}")]
    NotFound { name: String },

    #[error("Session '{name}' is already running")]
    AlreadyRunning { name: String },

    #[error("Session '{name}' already exists")]
    AlreadyExists { name: String },

    #[error("Session '{name}' is not running (status: {status})")]
    NotRunning { name: String, status: SessionStatus },

    #[error("Session '{name}' is not paused (status: {status})")]
    NotPaused { name: String, status: SessionStatus },

    #[error("Session '{name}' is still running; stop it first")]
    StillRunning { name: String },

    #[error("cannot replay a running session '{name}'")]
    CannotReplayRunning { name: String },

    #[error("Invalid session name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Session command must not be empty")]
    EmptyCommand,

    #[error("Session '{name}' has no {which} commit recorded")]
    MissingCommit { name: String, which: &'static str },

    #[error("Failed to spawn session '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal session '{name}': {source}")]
    Signal {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed session archive {path}: {reason}")]
    MalformedArchive { path: PathBuf, reason: String },

    #[error("Session archive error on {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("Corrupt session record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Git(#[from] fleetrun_core::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl SessionError {
    /// Attach the path an I/O operation failed on.
    pub fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
