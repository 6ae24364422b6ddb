//! CLI session management subcommands.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::Subcommand;
use tokio_util::sync::CancellationToken;

use fleetrun_core::Config;
use fleetrun_engine::session::{
    Session, SessionManager, SessionStatus, StartRequest, unix_timestamp,
};

use crate::fmt::{write_comparison, write_session_detail, write_session_table};

/// Lines of log shown by `show` without `--full-logs`.
const SHOW_LOG_LINES: usize = 20;

/// Session subcommand actions.
#[derive(Subcommand, Debug)]
pub enum SessionAction {
    /// Start a detached session running a command
    Start {
        /// Session name
        name: String,
        /// What the session is meant to achieve
        #[arg(short, long)]
        goal: Option<String>,
        /// Directory the command runs in (defaults to the current directory)
        #[arg(short, long)]
        workspace: Option<PathBuf>,
        /// Command and arguments, after `--`
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// List sessions
    List {
        /// Only show sessions with this status
        #[arg(short, long)]
        status: Option<SessionStatus>,
        /// List archived sessions instead
        #[arg(long)]
        archived: bool,
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a session's details and recent output
    Show {
        name: String,
        /// Print the whole log instead of the last lines
        #[arg(long)]
        full_logs: bool,
    },
    /// Stop a running or paused session
    Stop { name: String },
    /// Suspend a running session
    Pause { name: String },
    /// Continue a paused session
    Resume { name: String },
    /// Delete a session and its log
    Rm {
        name: String,
        /// Stop the session first if it is still running
        #[arg(short, long)]
        force: bool,
    },
    /// Rename a finished session
    Rename { old: String, new: String },
    /// Print a session's log
    Logs {
        name: String,
        /// Only the last N lines
        #[arg(short = 'n', long)]
        lines: Option<usize>,
    },
    /// Follow a session's output until it ends (Ctrl-C detaches)
    Attach { name: String },
    /// Re-run a finished session's command under a new name
    Replay {
        name: String,
        /// Name for the new session
        #[arg(long = "as")]
        as_name: Option<String>,
    },
    /// Export a session to a zip archive
    Export {
        name: String,
        /// Archive path (defaults to `<name>.zip`)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Import a session from a zip archive
    Import {
        archive: PathBuf,
        /// Import under a different name
        name: Option<String>,
    },
    /// Compare two sessions' metadata and logs
    Diff {
        a: String,
        b: String,
        /// Print the comparison as JSON
        #[arg(long)]
        json: bool,
    },
    /// Git diff between the final commits of two sessions
    Workdiff { a: String, b: String },
    /// Move a finished session into the archive
    Archive { name: String },
    /// Restore an archived session
    Unarchive { name: String },
    /// Print session status changes until Ctrl-C
    Watch {
        /// Seconds between polls
        #[arg(short, long)]
        interval: Option<u64>,
    },
}

/// Execute a session subcommand.
pub async fn run(
    manager: &SessionManager,
    config: &Config,
    action: SessionAction,
) -> anyhow::Result<()> {
    let mut out = io::stdout();
    match action {
        SessionAction::Start {
            name,
            goal,
            workspace,
            command,
        } => {
            let workspace = match workspace {
                Some(dir) => dir,
                None => std::env::current_dir()?,
            };
            let mut request = StartRequest::new(name, command, workspace);
            if let Some(goal) = goal {
                request = request.with_goal(goal);
            }
            let session = manager.start_session(request).await?;
            writeln!(
                out,
                "Session {} started (pid {}).",
                session.name,
                session.pid.unwrap_or_default()
            )?;
            writeln!(out, "  Log: {}", session.log_file.display())?;
        }
        SessionAction::List {
            status,
            archived,
            json,
        } => {
            let mut sessions = if archived {
                manager.list_archived_sessions().await?
            } else {
                manager.list_sessions().await?
            };
            if let Some(status) = status {
                sessions.retain(|s| s.status == status);
            }
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&sessions)?)?;
            } else if sessions.is_empty() {
                writeln!(out, "No sessions found.")?;
            } else {
                write_session_table(&mut out, &sessions, unix_timestamp())?;
            }
        }
        SessionAction::Show { name, full_logs } => {
            let session = manager.load_session(&name).await?;
            let state = manager.session_agent_state(&name).await?;
            write_session_detail(&mut out, &session, state.as_ref(), unix_timestamp())?;
            match manager.session_git_diff_stat(&name).await {
                Ok(Some(stat)) if !stat.trim().is_empty() => {
                    writeln!(out, "\nChanges:")?;
                    write!(out, "{stat}")?;
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(session = %name, error = %e, "No diff stat"),
            }
            let lines = (!full_logs).then_some(SHOW_LOG_LINES);
            let log = manager.session_logs(&name, lines).await?;
            if !log.is_empty() {
                writeln!(out, "\nOutput:")?;
                write!(out, "{log}")?;
            }
        }
        SessionAction::Stop { name } => {
            let session = manager.stop_session(&name).await?;
            writeln!(out, "Session {name} {}.", session.status)?;
        }
        SessionAction::Pause { name } => {
            manager.pause_session(&name).await?;
            writeln!(out, "Session {name} paused.")?;
        }
        SessionAction::Resume { name } => {
            manager.resume_session(&name).await?;
            writeln!(out, "Session {name} resumed.")?;
        }
        SessionAction::Rm { name, force } => {
            manager.remove_session(&name, force).await?;
            writeln!(out, "Session {name} deleted.")?;
        }
        SessionAction::Rename { old, new } => {
            manager.rename_session(&old, &new).await?;
            writeln!(out, "Session {old} renamed to {new}.")?;
        }
        SessionAction::Logs { name, lines } => {
            let log = manager.session_logs(&name, lines).await?;
            write!(out, "{log}")?;
        }
        SessionAction::Attach { name } => {
            let cancel = cancel_on_ctrl_c();
            let mut stdout = tokio::io::stdout();
            manager.attach_to_session(&name, &mut stdout, &cancel).await?;
        }
        SessionAction::Replay { name, as_name } => {
            let session = manager.replay_session(&name, as_name.as_deref()).await?;
            writeln!(
                out,
                "Replaying {name} as {} (pid {}).",
                session.name,
                session.pid.unwrap_or_default()
            )?;
        }
        SessionAction::Export { name, output } => {
            let output = output.unwrap_or_else(|| PathBuf::from(format!("{name}.zip")));
            manager.export_session(&name, &output).await?;
            writeln!(out, "Session {name} exported to {}.", output.display())?;
        }
        SessionAction::Import { archive, name } => {
            let session = manager.import_session(&archive, name.as_deref()).await?;
            writeln!(out, "Imported session {} ({}).", session.name, session.status)?;
        }
        SessionAction::Diff { a, b, json } => {
            let comparison = manager.compare_sessions(&a, &b).await?;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&comparison)?)?;
            } else {
                write_comparison(&mut out, &comparison)?;
            }
        }
        SessionAction::Workdiff { a, b } => {
            let diff = manager.session_work_diff(&a, &b).await?;
            if diff.is_empty() {
                writeln!(out, "No changes between {a} and {b}.")?;
            } else {
                write!(out, "{diff}")?;
            }
        }
        SessionAction::Archive { name } => {
            manager.archive_session(&name).await?;
            writeln!(out, "Session {name} archived.")?;
        }
        SessionAction::Unarchive { name } => {
            manager.unarchive_session(&name).await?;
            writeln!(out, "Session {name} restored.")?;
        }
        SessionAction::Watch { interval } => {
            let secs = interval.unwrap_or(config.sessions.watch_interval_secs).max(1);
            watch(manager, &mut out, Duration::from_secs(secs), &cancel_on_ctrl_c()).await?;
        }
    }
    Ok(())
}

/// Poll the store and print status transitions until cancelled.
async fn watch(
    manager: &SessionManager,
    out: &mut impl Write,
    interval: Duration,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let mut known = HashMap::new();
    loop {
        let sessions = manager.list_sessions().await?;
        for line in status_changes(&known, &sessions) {
            writeln!(out, "{line}")?;
        }
        out.flush()?;
        known = sessions.into_iter().map(|s| (s.name, s.status)).collect();

        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            () = tokio::time::sleep(interval) => {}
        }
    }
}

/// Lines describing sessions that appeared, changed status or vanished.
pub fn status_changes(
    previous: &HashMap<String, SessionStatus>,
    current: &[Session],
) -> Vec<String> {
    let mut lines = Vec::new();
    for session in current {
        match previous.get(&session.name) {
            None => lines.push(format!("{}: {}", session.name, session.status)),
            Some(old) if *old != session.status => {
                lines.push(format!("{}: {old} -> {}", session.name, session.status));
            }
            Some(_) => {}
        }
    }
    let mut gone: Vec<&String> = previous
        .keys()
        .filter(|name| !current.iter().any(|s| &&s.name == name))
        .collect();
    gone.sort();
    lines.extend(gone.into_iter().map(|name| format!("{name}: removed")));
    lines
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    token
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::Parser;
    use fleetrun_engine::session::SessionKind;

    /// Test wrapper to parse CLI arguments.
    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(subcommand)]
        action: SessionAction,
    }

    #[test]
    fn parse_start_with_trailing_command() {
        let cli = TestCli::parse_from([
            "test", "start", "api", "--goal", "refactor", "--", "agent", "--name", "api", "-v",
        ]);
        match cli.action {
            SessionAction::Start {
                name,
                goal,
                workspace,
                command,
            } => {
                assert_eq!(name, "api");
                assert_eq!(goal.as_deref(), Some("refactor"));
                assert!(workspace.is_none());
                assert_eq!(command, vec!["agent", "--name", "api", "-v"]);
            }
            other => panic!("Expected Start, got {other:?}"),
        }
    }

    #[test]
    fn start_requires_command() {
        assert!(TestCli::try_parse_from(["test", "start", "api"]).is_err());
    }

    #[test]
    fn parse_list_status_filter() {
        let cli = TestCli::parse_from(["test", "list", "--status", "Paused"]);
        match cli.action {
            SessionAction::List {
                status,
                archived,
                json,
            } => {
                assert_eq!(status, Some(SessionStatus::Paused));
                assert!(!archived);
                assert!(!json);
            }
            other => panic!("Expected List, got {other:?}"),
        }
        assert!(TestCli::try_parse_from(["test", "list", "--status", "bogus"]).is_err());
    }

    #[test]
    fn parse_json_flags() {
        let cli = TestCli::parse_from(["test", "list", "--archived", "--json"]);
        assert!(matches!(
            cli.action,
            SessionAction::List {
                archived: true,
                json: true,
                ..
            }
        ));

        let cli = TestCli::parse_from(["test", "diff", "a", "b", "--json"]);
        match cli.action {
            SessionAction::Diff { a, b, json } => {
                assert_eq!((a.as_str(), b.as_str()), ("a", "b"));
                assert!(json);
            }
            other => panic!("Expected Diff, got {other:?}"),
        }
    }

    #[test]
    fn parse_replay_as() {
        let cli = TestCli::parse_from(["test", "replay", "api", "--as", "api-2"]);
        match cli.action {
            SessionAction::Replay { name, as_name } => {
                assert_eq!(name, "api");
                assert_eq!(as_name.as_deref(), Some("api-2"));
            }
            other => panic!("Expected Replay, got {other:?}"),
        }
    }

    #[test]
    fn parse_rm_force_and_logs_lines() {
        let cli = TestCli::parse_from(["test", "rm", "api", "--force"]);
        assert!(matches!(cli.action, SessionAction::Rm { force: true, .. }));

        let cli = TestCli::parse_from(["test", "logs", "api", "-n", "15"]);
        match cli.action {
            SessionAction::Logs { name, lines } => {
                assert_eq!(name, "api");
                assert_eq!(lines, Some(15));
            }
            other => panic!("Expected Logs, got {other:?}"),
        }
    }

    #[test]
    fn parse_import_optional_name() {
        let cli = TestCli::parse_from(["test", "import", "run.zip"]);
        match cli.action {
            SessionAction::Import { archive, name } => {
                assert_eq!(archive, PathBuf::from("run.zip"));
                assert!(name.is_none());
            }
            other => panic!("Expected Import, got {other:?}"),
        }
    }

    fn session(name: &str, status: SessionStatus) -> Session {
        Session {
            name: name.to_string(),
            status,
            pid: None,
            kind: SessionKind::Detached,
            goal: String::new(),
            start_time: 0,
            end_time: None,
            workspace: PathBuf::from("/w"),
            command: vec!["agent".to_string()],
            log_file: PathBuf::from("/s/x.log"),
            agent_state_file: None,
            start_commit_sha: None,
            end_commit_sha: None,
            error: None,
        }
    }

    #[test]
    fn watch_reports_transitions() {
        let previous: HashMap<String, SessionStatus> = [
            ("a".to_string(), SessionStatus::Running),
            ("b".to_string(), SessionStatus::Running),
            ("gone".to_string(), SessionStatus::Stopped),
        ]
        .into_iter()
        .collect();
        let current = [
            session("a", SessionStatus::Running),
            session("b", SessionStatus::Completed),
            session("new", SessionStatus::Running),
        ];
        assert_eq!(
            status_changes(&previous, &current),
            vec!["b: running -> completed", "new: running", "gone: removed"]
        );
    }
}
