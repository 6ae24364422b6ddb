//! Output formatting helpers.

use std::io::{self, Write};

use fleetrun_core::AgentState;
use fleetrun_engine::session::{LineChange, Session, SessionComparison, SessionSummary};

pub fn write_session_table(w: &mut impl Write, sessions: &[Session], now: i64) -> io::Result<()> {
    writeln!(
        w,
        "{:<24}  {:<9}  {:>7}  {:>9}  GOAL",
        "NAME", "STATUS", "PID", "DURATION"
    )?;
    for s in sessions {
        let pid = s.pid.map_or_else(|| "-".to_string(), |pid| pid.to_string());
        writeln!(
            w,
            "{:<24}  {:<9}  {:>7}  {:>9}  {}",
            truncate(&s.name, 24),
            s.status,
            pid,
            format_duration(s.duration_secs(now)),
            truncate(&s.goal, 40),
        )?;
    }
    Ok(())
}

pub fn write_session_detail(
    w: &mut impl Write,
    session: &Session,
    state: Option<&AgentState>,
    now: i64,
) -> io::Result<()> {
    writeln!(w, "  Name:      {}", session.name)?;
    writeln!(w, "  Status:    {}", session.status)?;
    if let Some(pid) = session.pid {
        writeln!(w, "  PID:       {pid}")?;
    }
    if !session.goal.is_empty() {
        writeln!(w, "  Goal:      {}", session.goal)?;
    }
    writeln!(w, "  Workspace: {}", session.workspace.display())?;
    writeln!(w, "  Command:   {}", session.command.join(" "))?;
    writeln!(w, "  Duration:  {}", format_duration(session.duration_secs(now)))?;
    writeln!(w, "  Log:       {}", session.log_file.display())?;
    if let Some(sha) = &session.start_commit_sha {
        writeln!(w, "  Start:     {}", short_sha(sha))?;
    }
    if let Some(sha) = &session.end_commit_sha {
        writeln!(w, "  End:       {}", short_sha(sha))?;
    }
    if let Some(state) = state {
        if !state.model.is_empty() {
            writeln!(w, "  Model:     {}", state.model)?;
        }
        let usage = state.token_usage;
        writeln!(
            w,
            "  Tokens:    {} ({} prompt, {} response)",
            usage.total_tokens, usage.prompt_tokens, usage.response_tokens
        )?;
    }
    if let Some(error) = &session.error {
        writeln!(w, "  Error:     {error}")?;
    }
    Ok(())
}

pub fn write_comparison(w: &mut impl Write, comparison: &SessionComparison) -> io::Result<()> {
    let (left, right) = (&comparison.left, &comparison.right);
    writeln!(w, "{:<12}  {:<24}  {:<24}", "", truncate(&left.name, 24), truncate(&right.name, 24))?;
    let rows: [(&str, fn(&SessionSummary) -> String); 5] = [
        ("status", |s| s.status.to_string()),
        ("duration", |s| format_duration(s.duration_secs)),
        ("model", |s| s.model.clone().unwrap_or_else(|| "-".to_string())),
        ("tokens", |s| s.total_tokens.map_or_else(|| "-".to_string(), |t| t.to_string())),
        ("error", |s| s.error.clone().unwrap_or_else(|| "-".to_string())),
    ];
    for (label, field) in rows {
        writeln!(
            w,
            "{label:<12}  {:<24}  {:<24}",
            truncate(&field(left), 24),
            truncate(&field(right), 24)
        )?;
    }

    let changed = comparison.changed_lines();
    writeln!(w)?;
    if changed == 0 {
        writeln!(w, "Logs are identical.")?;
        return Ok(());
    }
    writeln!(w, "Log differences ({changed} line(s)):")?;
    for change in &comparison.log_diff {
        match change {
            LineChange::Same(_) => {}
            LineChange::Removed(line) => writeln!(w, "- {line}")?,
            LineChange::Added(line) => writeln!(w, "+ {line}")?,
        }
    }
    Ok(())
}

/// `1h 02m 03s`, `4m 05s` or `9s`.
pub fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h {minutes:02}m {seconds:02}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

pub fn short_sha(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}

pub fn truncate(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        s.to_string()
    } else {
        format!("{}…", s.chars().take(max.saturating_sub(1)).collect::<String>())
    }
}
