//! Session records and name validation.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::SessionError;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Running,
    Completed,
    Error,
    Stopped,
    Paused,
}

impl SessionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Stopped => "stopped",
            Self::Paused => "paused",
        }
    }

    /// Running or paused: a process may still exist.
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub const fn is_terminal(self) -> bool {
        !self.is_live()
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "stopped" => Ok(Self::Stopped),
            "paused" => Ok(Self::Paused),
            other => Err(format!("unknown session status '{other}'")),
        }
    }
}

/// How the session was launched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Runs in the background with output captured to the log file.
    #[default]
    Detached,
    Interactive,
}

/// One supervised subprocess and its persisted metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub name: String,
    pub status: SessionStatus,
    /// Set while the process may be alive (running or paused).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(rename = "type", default)]
    pub kind: SessionKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub goal: String,
    /// Unix seconds.
    pub start_time: i64,
    /// Unix seconds, set once the status is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    pub workspace: PathBuf,
    pub command: Vec<String>,
    pub log_file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_state_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Session {
    /// Move to a terminal status, clearing the pid.
    ///
    /// An end commit that is already recorded is kept.
    pub fn finish(&mut self, status: SessionStatus, end_time: i64, end_sha: Option<String>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.pid = None;
        self.end_time = Some(end_time);
        if self.end_commit_sha.is_none() {
            self.end_commit_sha = end_sha;
        }
    }

    /// Seconds between start and end, or between start and `now` while live.
    pub fn duration_secs(&self, now: i64) -> i64 {
        (self.end_time.unwrap_or(now) - self.start_time).max(0)
    }
}

/// Returns the current time as a Unix timestamp (seconds since epoch).
#[allow(clippy::cast_possible_wrap)]
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Session names become file names inside the store, so they must be a
/// single plain path component.
pub fn validate_session_name(name: &str) -> Result<(), SessionError> {
    let invalid = |reason: &str| SessionError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.trim().is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if name == "." || name == ".." {
        return Err(invalid("name must not be a relative path"));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(invalid("name must not contain path separators"));
    }
    if name.starts_with('-') || name.starts_with('.') {
        return Err(invalid("name must not start with '-' or '.'"));
    }
    if Path::new(name).file_name().and_then(|n| n.to_str()) != Some(name) {
        return Err(invalid("name must be a single path component"));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample() -> Session {
        Session {
            name: "api-refactor".to_string(),
            status: SessionStatus::Running,
            pid: Some(4242),
            kind: SessionKind::Detached,
            goal: String::new(),
            start_time: 1_700_000_000,
            end_time: None,
            workspace: PathBuf::from("/work/api"),
            command: vec!["agent".to_string(), "--goal".to_string(), "x".to_string()],
            log_file: PathBuf::from("/store/api-refactor.log"),
            agent_state_file: Some(PathBuf::from("/work/api/.agent_state.json")),
            start_commit_sha: Some("abc123".to_string()),
            end_commit_sha: None,
            error: None,
        }
    }

    #[test]
    fn record_uses_snake_case_keys() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["type"], "detached");
        assert_eq!(json["status"], "running");
        assert_eq!(json["start_commit_sha"], "abc123");
        assert_eq!(json["agent_state_file"], "/work/api/.agent_state.json");
        assert!(json.get("end_time").is_none());
        assert!(json.get("goal").is_none());
    }

    #[test]
    fn record_survives_json() {
        let session = sample();
        let text = serde_json::to_string_pretty(&session).unwrap();
        let back: Session = serde_json::from_str(&text).unwrap();
        assert_eq!(back, session);
    }

    #[test]
    fn finish_clears_pid_and_keeps_existing_end_commit() {
        let mut session = sample();
        session.end_commit_sha = Some("first".to_string());
        session.finish(SessionStatus::Stopped, 1_700_000_060, Some("second".to_string()));
        assert_eq!(session.status, SessionStatus::Stopped);
        assert_eq!(session.pid, None);
        assert_eq!(session.end_time, Some(1_700_000_060));
        assert_eq!(session.end_commit_sha.as_deref(), Some("first"));
        assert_eq!(session.duration_secs(0), 60);
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("Paused".parse::<SessionStatus>(), Ok(SessionStatus::Paused));
        assert!("gone".parse::<SessionStatus>().is_err());
        assert!(SessionStatus::Paused.is_live());
        assert!(SessionStatus::Error.is_terminal());
    }

    #[test]
    fn accepts_plain_names() {
        for name in ["api", "api-refactor", "run_2", "feature.v2"] {
            assert!(validate_session_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn rejects_traversal_and_separators() {
        for name in ["", "  ", ".", "..", "../evil", "a/b", "a\\b", "-rf", ".hidden"] {
            assert!(
                matches!(
                    validate_session_name(name),
                    Err(SessionError::InvalidName { .. })
                ),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn unix_timestamp_is_reasonable() {
        assert!(unix_timestamp() > 1_704_067_200);
    }
}
