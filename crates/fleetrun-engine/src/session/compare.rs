//! Side-by-side comparison of two sessions.

use serde::Serialize;

use fleetrun_core::AgentState;

use super::{Session, SessionStatus};

/// The fields shown per session when comparing runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub name: String,
    pub status: SessionStatus,
    pub duration_secs: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionSummary {
    /// `state` is the agent state file contents, if it could be read.
    pub fn new(session: &Session, state: Option<&AgentState>, now: i64) -> Self {
        Self {
            name: session.name.clone(),
            status: session.status,
            duration_secs: session.duration_secs(now),
            model: state
                .map(|s| s.model.clone())
                .filter(|model| !model.is_empty()),
            total_tokens: state.map(|s| s.token_usage.total_tokens),
            error: session.error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "line", rename_all = "lowercase")]
pub enum LineChange {
    Same(String),
    Removed(String),
    Added(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionComparison {
    pub left: SessionSummary,
    pub right: SessionSummary,
    pub log_diff: Vec<LineChange>,
}

impl SessionComparison {
    pub fn changed_lines(&self) -> usize {
        self.log_diff
            .iter()
            .filter(|c| !matches!(c, LineChange::Same(_)))
            .count()
    }
}

/// Compare two logs line by line at equal positions.
///
/// Lines that differ at the same index yield a removal followed by an
/// addition; trailing lines of the longer log are all removals or additions.
pub fn positional_line_diff(left: &str, right: &str) -> Vec<LineChange> {
    let mut left_lines = left.lines();
    let mut right_lines = right.lines();
    let mut changes = Vec::new();
    loop {
        match (left_lines.next(), right_lines.next()) {
            (None, None) => break,
            (Some(l), Some(r)) if l == r => changes.push(LineChange::Same(l.to_string())),
            (Some(l), Some(r)) => {
                changes.push(LineChange::Removed(l.to_string()));
                changes.push(LineChange::Added(r.to_string()));
            }
            (Some(l), None) => changes.push(LineChange::Removed(l.to_string())),
            (None, Some(r)) => changes.push(LineChange::Added(r.to_string())),
        }
    }
    changes
}
