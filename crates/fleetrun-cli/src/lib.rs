//! Fleetrun CLI Library
//!
//! Subcommands for managing agent sessions and running feature sprints.

pub mod fmt;
pub mod session_cmd;
pub mod sprint_cmd;
