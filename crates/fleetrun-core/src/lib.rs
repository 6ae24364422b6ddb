//! fleetrun Core Library
//!
//! Shared functionality for fleetrun components:
//! - Configuration resolution and hierarchy
//! - Tracing initialisation
//! - The `Agent` and `Git` capabilities the engine consumes
//! - Common error types

pub mod agent;
pub mod config;
pub mod error;
pub mod git;
pub mod tracing_init;

pub use agent::{Agent, AgentState, CommandAgent};
pub use config::Config;
pub use error::{Error, Result};
pub use git::{Git, GitCli};
