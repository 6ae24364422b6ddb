//! Fleetrun CLI
//!
//! Run, inspect and replay agent sessions, and drive feature sprints
//! through the dependency executor.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use fleetrun_cli::session_cmd::{self, SessionAction};
use fleetrun_cli::sprint_cmd::{self, SprintAction};
use fleetrun_core::config::load_config;
use fleetrun_core::tracing_init::{default_filter, init_tracing};
use fleetrun_core::{Config, GitCli};
use fleetrun_engine::session::{SessionManager, SessionOptions, SessionStore};

#[derive(Parser, Debug)]
#[command(name = "fleetrun")]
#[command(version, about = "Run and supervise coding agents", long_about = None)]
struct Cli {
    /// Project directory whose .fleetrun/settings.json is layered over the global settings
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    /// Session store directory
    #[arg(long, global = true, env = "FLEETRUN_SESSIONS_DIR")]
    sessions_dir: Option<PathBuf>,

    /// Log level for fleetrun crates (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "FLEETRUN_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage agent sessions
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Plan or run a feature list
    Sprint {
        #[command(subcommand)]
        action: SprintAction,
    },
}

fn resolve_config(cli: &Cli) -> anyhow::Result<Config> {
    let project_dir = match &cli.project_dir {
        Some(dir) => Some(dir.clone()),
        None => std::env::current_dir().ok(),
    };
    let mut config = load_config(project_dir.as_deref())?;
    if let Some(dir) = &cli.sessions_dir {
        config.store.sessions_dir = Some(dir.clone());
    }
    if let Some(level) = &cli.log_level {
        config.log_level.clone_from(level);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    init_tracing(&default_filter(&config.log_level), cli.log_json);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting fleetrun");

    match cli.command {
        Commands::Session { action } => {
            let manager = SessionManager::new(
                SessionStore::new(config.sessions_dir()),
                Arc::new(GitCli::new()),
                SessionOptions::from(&config.sessions),
            );
            session_cmd::run(&manager, &config, action).await
        }
        Commands::Sprint { action } => sprint_cmd::run(&config, action).await,
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::parse_from([
            "fleetrun",
            "session",
            "list",
            "--sessions-dir",
            "/tmp/store",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.sessions_dir, Some(PathBuf::from("/tmp/store")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(
            cli.command,
            Commands::Session {
                action: SessionAction::List { .. }
            }
        ));
    }

    #[test]
    fn cli_flags_override_config() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::parse_from([
            "fleetrun",
            "--project-dir",
            dir.path().to_str().unwrap(),
            "--sessions-dir",
            "/tmp/elsewhere",
            "--log-level",
            "trace",
            "sprint",
            "plan",
            "features.json",
        ]);
        let config = resolve_config(&cli).unwrap();
        assert_eq!(config.sessions_dir(), PathBuf::from("/tmp/elsewhere"));
        assert_eq!(config.log_level, "trace");
    }
}
