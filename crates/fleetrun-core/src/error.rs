//! Error types for the fleetrun core library.

use thiserror::Error;

/// Result type alias using the fleetrun core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for configuration and capability calls.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The agent command could not be run or reported failure
    #[error("Agent error: {0}")]
    Agent(String),

    /// A git invocation failed
    #[error("git {command} failed: {message}")]
    Git { command: String, message: String },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
