//! Session lifecycle: start, supervise, stop, replay, export and import.

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleetrun_core::config::SessionConfig;
use fleetrun_core::{AgentState, Git};

use super::archive::SessionArchive;
use super::compare::{SessionComparison, SessionSummary, positional_line_diff};
use super::process::{self, ExitReport, ProcessHandle, Signal, send_signal, supervise};
use super::store::remove_if_exists;
use super::{
    Session, SessionError, SessionKind, SessionStatus, SessionStore, unix_timestamp,
    validate_session_name,
};

/// File in the workspace where agents record model and token usage.
pub const AGENT_STATE_FILE: &str = ".agent_state.json";

/// Environment variable carrying the session name into the subprocess.
pub const SESSION_ENV: &str = "FLEETRUN_SESSION";

/// Environment variable carrying the agent state file path.
pub const AGENT_STATE_ENV: &str = "FLEETRUN_AGENT_STATE_FILE";

const NAME_FLAGS: [&str; 2] = ["--name", "--session"];
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const KILL_GRACE: Duration = Duration::from_secs(2);

type SuffixFn = Arc<dyn Fn() -> String + Send + Sync>;

/// Tunables for the session manager.
#[derive(Clone)]
pub struct SessionOptions {
    /// How long a stop waits after SIGINT before sending SIGKILL.
    pub terminate_timeout: Duration,
    /// Log polling interval while attached.
    pub attach_poll_interval: Duration,
    /// Produces the suffix of generated replay names.
    pub replay_suffix: SuffixFn,
}

impl SessionOptions {
    #[must_use]
    pub fn with_replay_suffix(
        mut self,
        suffix: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        self.replay_suffix = Arc::new(suffix);
        self
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            terminate_timeout: Duration::from_secs(5),
            attach_poll_interval: Duration::from_millis(250),
            replay_suffix: Arc::new(|| unix_timestamp().to_string()),
        }
    }
}

impl From<&SessionConfig> for SessionOptions {
    fn from(config: &SessionConfig) -> Self {
        Self {
            terminate_timeout: Duration::from_secs(config.terminate_timeout_secs),
            attach_poll_interval: Duration::from_millis(config.attach_poll_ms.max(1)),
            ..Self::default()
        }
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("terminate_timeout", &self.terminate_timeout)
            .field("attach_poll_interval", &self.attach_poll_interval)
            .finish_non_exhaustive()
    }
}

/// Parameters for [`SessionManager::start_session`].
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub name: String,
    pub command: Vec<String>,
    pub workspace: PathBuf,
    pub goal: String,
    pub kind: SessionKind,
}

impl StartRequest {
    pub fn new(
        name: impl Into<String>,
        command: Vec<String>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            command,
            workspace: workspace.into(),
            goal: String::new(),
            kind: SessionKind::Detached,
        }
    }

    #[must_use]
    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = goal.into();
        self
    }
}

/// Starts and tracks named sessions backed by a [`SessionStore`].
pub struct SessionManager {
    store: Arc<SessionStore>,
    git: Arc<dyn Git>,
    handles: Arc<Handles>,
    options: SessionOptions,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("store", &self.store.dir())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    pub fn new(store: SessionStore, git: Arc<dyn Git>, options: SessionOptions) -> Self {
        Self {
            store: Arc::new(store),
            git,
            handles: Arc::new(RwLock::new(HashMap::new())),
            options,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub const fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Spawn a detached session and return its persisted record.
    ///
    /// A finished session with the same name is replaced only once the new
    /// process has been spawned; any earlier failure leaves it untouched.
    pub async fn start_session(&self, request: StartRequest) -> Result<Session, SessionError> {
        validate_session_name(&request.name)?;
        let Some(program) = request.command.first() else {
            return Err(SessionError::EmptyCommand);
        };
        let name = request.name.clone();

        self.store.ensure_dir().await?;
        let previous = self.store.try_load(&name).await?;
        if let Some(existing) = &previous {
            if existing.status.is_live() && self.session_is_live(existing).await {
                return Err(SessionError::AlreadyRunning { name });
            }
        }

        let workspace = tokio::fs::canonicalize(&request.workspace)
            .await
            .map_err(SessionError::io(&request.workspace))?;
        check_program(&name, program)?;

        let start_commit_sha = capture_commit(self.git.as_ref(), &workspace).await;
        let pending_log = self.store.pending_log_path(&name);
        remove_if_exists(&pending_log).await?;
        let stdout_log = create_log(&pending_log)?;
        let stderr_log = stdout_log.try_clone().map_err(SessionError::io(&pending_log))?;
        let agent_state_file = workspace.join(AGENT_STATE_FILE);

        let mut cmd = Command::new(program);
        cmd.args(&request.command[1..])
            .current_dir(&workspace)
            .env(SESSION_ENV, &name)
            .env(AGENT_STATE_ENV, &agent_state_file)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_log))
            .stderr(Stdio::from(stderr_log));
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                let _ = remove_if_exists(&pending_log).await;
                return Err(SessionError::Spawn { name, source });
            }
        };
        let Some(pid) = child.id() else {
            let _ = remove_if_exists(&pending_log).await;
            return Err(SessionError::Spawn {
                name,
                source: std::io::Error::other("process exited before its pid was read"),
            });
        };

        let session = Session {
            name: name.clone(),
            status: SessionStatus::Running,
            pid: Some(pid),
            kind: request.kind,
            goal: request.goal,
            start_time: unix_timestamp(),
            end_time: None,
            workspace,
            command: request.command,
            log_file: self.store.log_path(&name),
            agent_state_file: Some(agent_state_file),
            start_commit_sha,
            end_commit_sha: None,
            error: None,
        };

        if let Err(e) = self.commit_start(&session, previous.is_some(), &pending_log).await {
            warn!(session = %name, pid, error = %e, "Failed to persist session, killing process");
            let _ = child.start_kill();
            let _ = child.wait().await;
            let _ = remove_if_exists(&pending_log).await;
            let _ = remove_if_exists(&session.log_file).await;
            return Err(e);
        }

        // Held across `supervise` so a fast exit cannot prune before the insert.
        let mut handles = self.handles.write().await;
        let store = Arc::clone(&self.store);
        let git = Arc::clone(&self.git);
        let exit_handles = Arc::clone(&self.handles);
        let exit_name = name.clone();
        let exit_workspace = session.workspace.clone();
        let handle = supervise(pid, child, move |report| async move {
            record_exit(&store, git.as_ref(), &exit_name, pid, &exit_workspace, report).await;
            forget_handle(&exit_handles, &exit_name, pid).await;
        });
        handles.insert(name.clone(), handle);
        drop(handles);

        info!(
            session = %name,
            pid,
            workspace = %session.workspace.display(),
            "Session started"
        );
        Ok(session)
    }

    /// Replace any finished record and move the pending log into place.
    async fn commit_start(
        &self,
        session: &Session,
        replaces: bool,
        pending_log: &Path,
    ) -> Result<(), SessionError> {
        if replaces {
            debug!(session = %session.name, "Replacing finished session");
            self.store.remove(&session.name).await?;
        }
        tokio::fs::rename(pending_log, &session.log_file)
            .await
            .map_err(SessionError::io(pending_log))?;
        self.store.save(session).await
    }

    pub async fn load_session(&self, name: &str) -> Result<Session, SessionError> {
        let session = self.store.load(name).await?;
        self.reconcile(session).await
    }

    pub async fn save_session(&self, session: &Session) -> Result<(), SessionError> {
        self.store.save(session).await
    }

    pub async fn update<F>(&self, name: &str, f: F) -> Result<Session, SessionError>
    where
        F: FnOnce(&mut Session) + Send,
    {
        self.store.update(name, f).await
    }

    /// Every session in the store with stale live records reconciled.
    pub async fn list_sessions(&self) -> Result<Vec<Session>, SessionError> {
        let mut sessions = Vec::new();
        for session in self.store.list().await? {
            sessions.push(self.reconcile(session).await?);
        }
        Ok(sessions)
    }

    /// Whether `pid` is alive. A running supervised handle answers
    /// directly; anything else is probed.
    pub async fn is_process_running(&self, pid: u32) -> bool {
        let supervised = self
            .handles
            .read()
            .await
            .values()
            .any(|h| h.pid() == pid && h.is_running());
        supervised || process::is_process_running(pid)
    }

    async fn session_is_live(&self, session: &Session) -> bool {
        let Some(pid) = session.pid else {
            return false;
        };
        match self.handle_for(&session.name, pid).await {
            Some(handle) => handle.is_running(),
            None => process::is_process_running(pid),
        }
    }

    /// Number of sessions this manager is still supervising.
    pub async fn supervised_count(&self) -> usize {
        self.handles.read().await.len()
    }

    async fn handle_for(&self, name: &str, pid: u32) -> Option<ProcessHandle> {
        self.handles
            .read()
            .await
            .get(name)
            .filter(|h| h.pid() == pid)
            .cloned()
    }

    /// Settle a live record whose process has gone away.
    ///
    /// Running becomes completed, paused becomes stopped.
    pub async fn reconcile(&self, session: Session) -> Result<Session, SessionError> {
        if !session.status.is_live() || self.session_is_live(&session).await {
            return Ok(session);
        }

        let status = if session.status == SessionStatus::Paused {
            SessionStatus::Stopped
        } else {
            SessionStatus::Completed
        };
        let end_sha = capture_commit(self.git.as_ref(), &session.workspace).await;
        let pid = session.pid;
        let updated = self
            .store
            .update(&session.name, |s| {
                if s.status.is_live() && s.pid == pid {
                    s.finish(status, unix_timestamp(), end_sha);
                }
            })
            .await?;
        info!(session = %updated.name, status = %updated.status, "Reconciled stale session");
        Ok(updated)
    }

    /// Interrupt a session, escalating to SIGKILL after the terminate timeout.
    pub async fn stop_session(&self, name: &str) -> Result<Session, SessionError> {
        let session = self.store.load(name).await?;
        let Some(pid) = session.pid.filter(|_| session.status.is_live()) else {
            return Err(SessionError::NotRunning {
                name: name.to_string(),
                status: session.status,
            });
        };
        if !self.session_is_live(&session).await {
            let reconciled = self.reconcile(session).await?;
            return Err(SessionError::NotRunning {
                name: name.to_string(),
                status: reconciled.status,
            });
        }

        let handle = self.handle_for(name, pid).await;
        if let Some(handle) = &handle {
            handle.request_stop();
        }
        if session.status == SessionStatus::Paused {
            if let Err(e) = send_signal(pid, Signal::Continue) {
                warn!(session = name, pid, error = %e, "Failed to continue paused session");
            }
        }

        info!(session = name, pid, "Stopping session");
        if let Err(e) = send_signal(pid, Signal::Interrupt) {
            warn!(session = name, pid, error = %e, "Failed to send SIGINT");
        }
        if !wait_for_exit(handle.as_ref(), pid, self.options.terminate_timeout).await {
            warn!(session = name, pid, "Timeout waiting for graceful shutdown, killing");
            if let Err(e) = send_signal(pid, Signal::Kill) {
                warn!(session = name, pid, error = %e, "Failed to send SIGKILL");
            }
            wait_for_exit(handle.as_ref(), pid, KILL_GRACE).await;
        }

        let end_sha = capture_commit(self.git.as_ref(), &session.workspace).await;
        let stopped = self
            .store
            .update(name, |s| {
                if s.status.is_live() {
                    s.finish(SessionStatus::Stopped, unix_timestamp(), end_sha);
                }
            })
            .await?;
        forget_handle(&self.handles, name, pid).await;
        info!(session = name, status = %stopped.status, "Session stopped");
        Ok(stopped)
    }

    /// Suspend a running session with SIGSTOP.
    pub async fn pause_session(&self, name: &str) -> Result<Session, SessionError> {
        let session = self.store.load(name).await?;
        let pid = self.live_pid(session, SessionStatus::Running).await?;
        send_signal(pid, Signal::Stop).map_err(|source| SessionError::Signal {
            name: name.to_string(),
            source,
        })?;
        let paused = self
            .store
            .update(name, |s| s.status = SessionStatus::Paused)
            .await?;
        info!(session = name, pid, "Session paused");
        Ok(paused)
    }

    /// Continue a paused session with SIGCONT.
    pub async fn resume_session(&self, name: &str) -> Result<Session, SessionError> {
        let session = self.store.load(name).await?;
        let pid = self.live_pid(session, SessionStatus::Paused).await?;
        send_signal(pid, Signal::Continue).map_err(|source| SessionError::Signal {
            name: name.to_string(),
            source,
        })?;
        let resumed = self
            .store
            .update(name, |s| s.status = SessionStatus::Running)
            .await?;
        info!(session = name, pid, "Session resumed");
        Ok(resumed)
    }

    /// The pid of a session in `expected` status whose process is alive.
    async fn live_pid(
        &self,
        session: Session,
        expected: SessionStatus,
    ) -> Result<u32, SessionError> {
        let wrong_status = |session: &Session| {
            let name = session.name.clone();
            let status = session.status;
            if expected == SessionStatus::Paused {
                SessionError::NotPaused { name, status }
            } else {
                SessionError::NotRunning { name, status }
            }
        };
        if session.status != expected {
            return Err(wrong_status(&session));
        }
        match session.pid {
            Some(pid) if self.session_is_live(&session).await => Ok(pid),
            _ => {
                let reconciled = self.reconcile(session).await?;
                Err(SessionError::NotRunning {
                    name: reconciled.name,
                    status: reconciled.status,
                })
            }
        }
    }

    /// Copy the session log to `writer`, following it while the session is
    /// live, until the process ends or `cancel` fires.
    pub async fn attach_to_session<W>(
        &self,
        name: &str,
        writer: &mut W,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let session = self.load_session(name).await?;
        let path = session.log_file.clone();
        let mut log = tokio::fs::File::open(&path)
            .await
            .map_err(SessionError::io(&path))?;
        let mut buf = vec![0u8; 8192];

        loop {
            copy_available(&mut log, writer, &mut buf, &path).await?;
            if !self.session_is_live(&session).await {
                // Output written between the last read and the exit.
                copy_available(&mut log, writer, &mut buf, &path).await?;
                debug!(session = name, "Attached session ended");
                return Ok(());
            }
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(session = name, "Detached from session");
                    return Ok(());
                }
                () = tokio::time::sleep(self.options.attach_poll_interval) => {}
            }
        }
    }

    /// The whole log, or its last `lines` lines.
    pub async fn session_logs(
        &self,
        name: &str,
        lines: Option<usize>,
    ) -> Result<String, SessionError> {
        let session = self.store.load(name).await?;
        let text = read_log(&session.log_file).await?;
        Ok(match lines {
            Some(n) => tail_lines(&text, n),
            None => text,
        })
    }

    /// Agent state recorded by the session's subprocess, if readable.
    pub async fn session_agent_state(
        &self,
        name: &str,
    ) -> Result<Option<AgentState>, SessionError> {
        let session = self.store.load(name).await?;
        Ok(load_agent_state(&session).await)
    }

    /// Start a fresh run of a finished session under a new name.
    pub async fn replay_session(
        &self,
        name: &str,
        new_name: Option<&str>,
    ) -> Result<Session, SessionError> {
        let original = self.store.load(name).await?;
        if original.status == SessionStatus::Running && self.session_is_live(&original).await {
            return Err(SessionError::CannotReplayRunning {
                name: name.to_string(),
            });
        }

        let new_name = new_name.map_or_else(
            || format!("{name}-replay-{}", (self.options.replay_suffix)()),
            str::to_string,
        );
        validate_session_name(&new_name)?;
        let current_exe = std::env::current_exe().ok();
        let command =
            rewrite_replay_command(&original.command, name, &new_name, current_exe.as_deref());

        info!(session = name, replay = %new_name, "Replaying session");
        self.start_session(StartRequest {
            name: new_name,
            command,
            workspace: original.workspace,
            goal: original.goal,
            kind: original.kind,
        })
        .await
    }

    /// Write the session record, log and work diff to a zip at `dest`.
    pub async fn export_session(&self, name: &str, dest: &Path) -> Result<(), SessionError> {
        let session = self.load_session(name).await?;
        let log = match tokio::fs::read(&session.log_file).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(SessionError::io(&session.log_file)(e)),
        };
        let diff = self.work_diff(&session).await.map(String::into_bytes);

        SessionArchive { session, log, diff }
            .write(dest.to_path_buf())
            .await?;
        info!(session = name, dest = %dest.display(), "Session exported");
        Ok(())
    }

    /// Materialize an exported session in this store.
    ///
    /// The name and collision checks run before anything is written; a
    /// failure after that removes whatever was written.
    pub async fn import_session(
        &self,
        archive: &Path,
        new_name: Option<&str>,
    ) -> Result<Session, SessionError> {
        let SessionArchive {
            mut session,
            log,
            diff,
        } = SessionArchive::read(archive.to_path_buf()).await?;

        let name = new_name.map_or_else(|| session.name.clone(), str::to_string);
        validate_session_name(&name)?;
        self.store.ensure_dir().await?;
        if self.store.exists(&name).await {
            return Err(SessionError::AlreadyExists { name });
        }

        session.name.clone_from(&name);
        if session.status.is_live() {
            session.status = SessionStatus::Stopped;
            session.end_time = Some(session.end_time.unwrap_or_else(unix_timestamp));
        }
        session.pid = None;
        session.log_file = self.store.log_path(&name);

        write_new(&session.log_file, &log).await?;
        let diff_path = self.store.diff_path(&name);
        if let Some(diff) = &diff {
            if let Err(e) = write_new(&diff_path, diff).await {
                let _ = remove_if_exists(&session.log_file).await;
                return Err(e);
            }
        }
        if let Err(e) = self.store.save(&session).await {
            let _ = remove_if_exists(&session.log_file).await;
            let _ = remove_if_exists(&diff_path).await;
            return Err(e);
        }

        info!(session = %name, archive = %archive.display(), "Session imported");
        Ok(session)
    }

    /// `git diff --stat` over the session's commits, `None` without a start commit.
    pub async fn session_git_diff_stat(&self, name: &str) -> Result<Option<String>, SessionError> {
        let session = self.load_session(name).await?;
        let Some(start) = session.start_commit_sha.as_deref() else {
            return Ok(None);
        };
        let end = session.end_commit_sha.as_deref().unwrap_or("HEAD");
        Ok(Some(self.git.diff_stat(&session.workspace, start, end).await?))
    }

    /// Diff of the session's work: from git when possible, else the diff
    /// materialized by an import.
    async fn work_diff(&self, session: &Session) -> Option<String> {
        if let Some(start) = session.start_commit_sha.as_deref() {
            let end = session.end_commit_sha.as_deref().unwrap_or("HEAD");
            match self.git.diff(&session.workspace, start, end).await {
                Ok(diff) if !diff.trim().is_empty() => return Some(diff),
                Ok(_) => return None,
                Err(e) => debug!(session = %session.name, error = %e, "Git diff unavailable"),
            }
        }
        tokio::fs::read_to_string(self.store.diff_path(&session.name))
            .await
            .ok()
            .filter(|diff| !diff.trim().is_empty())
    }

    /// Delete a session. A live one is stopped first when `force` is set.
    pub async fn remove_session(&self, name: &str, force: bool) -> Result<(), SessionError> {
        let session = self.load_session(name).await?;
        if session.status.is_live() {
            if !force {
                return Err(SessionError::StillRunning {
                    name: name.to_string(),
                });
            }
            match self.stop_session(name).await {
                Ok(_) | Err(SessionError::NotRunning { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        self.store.remove(name).await?;
        if let Some(pid) = session.pid {
            forget_handle(&self.handles, name, pid).await;
        }
        info!(session = name, "Session removed");
        Ok(())
    }

    pub async fn rename_session(&self, old: &str, new: &str) -> Result<Session, SessionError> {
        self.ensure_finished(old).await?;
        let renamed = self.store.rename(old, new).await?;
        info!(session = old, new_name = new, "Session renamed");
        Ok(renamed)
    }

    /// Move a finished session into the archived store.
    pub async fn archive_session(&self, name: &str) -> Result<Session, SessionError> {
        self.ensure_finished(name).await?;
        let archived = self.store.transfer(name, &self.store.archived()).await?;
        info!(session = name, "Session archived");
        Ok(archived)
    }

    pub async fn unarchive_session(&self, name: &str) -> Result<Session, SessionError> {
        self.store.ensure_dir().await?;
        let restored = self.store.archived().transfer(name, &self.store).await?;
        info!(session = name, "Session restored from archive");
        Ok(restored)
    }

    pub async fn list_archived_sessions(&self) -> Result<Vec<Session>, SessionError> {
        self.store.archived().list().await
    }

    async fn ensure_finished(&self, name: &str) -> Result<(), SessionError> {
        let session = self.load_session(name).await?;
        if session.status.is_live() {
            return Err(SessionError::StillRunning {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Metadata of two sessions side by side plus a positional log diff.
    pub async fn compare_sessions(
        &self,
        a: &str,
        b: &str,
    ) -> Result<SessionComparison, SessionError> {
        let left = self.load_session(a).await?;
        let right = self.load_session(b).await?;
        let now = unix_timestamp();

        let left_log = read_log(&left.log_file).await?;
        let right_log = read_log(&right.log_file).await?;
        let left_state = load_agent_state(&left).await;
        let right_state = load_agent_state(&right).await;

        Ok(SessionComparison {
            left: SessionSummary::new(&left, left_state.as_ref(), now),
            right: SessionSummary::new(&right, right_state.as_ref(), now),
            log_diff: positional_line_diff(&left_log, &right_log),
        })
    }

    /// Git diff between the end commits of two sessions.
    pub async fn session_work_diff(&self, a: &str, b: &str) -> Result<String, SessionError> {
        let left = self.load_session(a).await?;
        let right = self.load_session(b).await?;
        let end_commit = |session: &Session| {
            session
                .end_commit_sha
                .clone()
                .ok_or_else(|| SessionError::MissingCommit {
                    name: session.name.clone(),
                    which: "end",
                })
        };
        let from = end_commit(&left)?;
        let to = end_commit(&right)?;
        Ok(self.git.diff(&left.workspace, &from, &to).await?)
    }
}

async fn record_exit(
    store: &SessionStore,
    git: &dyn Git,
    name: &str,
    pid: u32,
    workspace: &Path,
    report: ExitReport,
) {
    if report.stop_requested {
        debug!(session = name, pid, "Exit after stop request, leaving status to stopper");
        return;
    }
    let end_sha = capture_commit(git, workspace).await;
    let result = store
        .update(name, |s| {
            if s.pid != Some(pid) || !s.status.is_live() {
                return;
            }
            let now = unix_timestamp();
            if report.success() {
                s.finish(SessionStatus::Completed, now, end_sha);
            } else {
                s.finish(SessionStatus::Error, now, end_sha);
                s.error.get_or_insert_with(|| report.describe());
            }
        })
        .await;
    match result {
        Ok(session) => info!(session = name, status = %session.status, "Session exited"),
        Err(e) => warn!(session = name, error = %e, "Failed to record session exit"),
    }
}

type Handles = RwLock<HashMap<String, ProcessHandle>>;

/// Drop the handle of `name` if it still belongs to `pid`.
async fn forget_handle(handles: &Handles, name: &str, pid: u32) {
    let mut handles = handles.write().await;
    if handles.get(name).is_some_and(|h| h.pid() == pid) {
        handles.remove(name);
    }
}

/// Wait for a process to exit; unsupervised ones are polled.
async fn wait_for_exit(handle: Option<&ProcessHandle>, pid: u32, timeout: Duration) -> bool {
    if let Some(handle) = handle {
        return handle.wait_exit(timeout).await.is_some();
    }
    let deadline = tokio::time::Instant::now() + timeout;
    while process::is_process_running(pid) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
    true
}

async fn capture_commit(git: &dyn Git, workspace: &Path) -> Option<String> {
    if !git.is_repository(workspace).await {
        return None;
    }
    match git.current_commit_sha(workspace).await {
        Ok(sha) => Some(sha),
        Err(e) => {
            warn!(workspace = %workspace.display(), error = %e, "Failed to read commit");
            None
        }
    }
}

async fn load_agent_state(session: &Session) -> Option<AgentState> {
    let path = session.agent_state_file.as_deref()?;
    match AgentState::load(path).await {
        Ok(state) => Some(state),
        Err(e) => {
            debug!(session = %session.name, path = %path.display(), error = %e, "No agent state");
            None
        }
    }
}

/// A program given as a path must exist and be executable.
fn check_program(name: &str, program: &str) -> Result<(), SessionError> {
    if !program.contains(std::path::MAIN_SEPARATOR) && !program.contains('/') {
        return Ok(());
    }
    let not_runnable = |reason: &str| SessionError::Spawn {
        name: name.to_string(),
        source: std::io::Error::new(ErrorKind::NotFound, format!("{program}: {reason}")),
    };
    let metadata = std::fs::metadata(program).map_err(|_| not_runnable("no such file"))?;
    if !metadata.is_file() {
        return Err(not_runnable("not a file"));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(not_runnable("not executable"));
        }
    }
    Ok(())
}

/// Create the log exclusively, owner read/write only.
fn create_log(path: &Path) -> Result<std::fs::File, SessionError> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path).map_err(SessionError::io(path))
}

async fn write_new(path: &Path, bytes: &[u8]) -> Result<(), SessionError> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await.map_err(SessionError::io(path))?;
    file.write_all(bytes).await.map_err(SessionError::io(path))?;
    file.sync_all().await.map_err(SessionError::io(path))
}

async fn read_log(path: &Path) -> Result<String, SessionError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(SessionError::io(path)(e)),
    }
}

async fn copy_available<W>(
    log: &mut tokio::fs::File,
    writer: &mut W,
    buf: &mut [u8],
    path: &Path,
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        let n = log.read(buf).await.map_err(SessionError::io(path))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(SessionError::io(path))?;
    }
    writer.flush().await.map_err(SessionError::io(path))
}

/// The last `n` lines of `text`, newline terminated.
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().fold(String::new(), |mut out, line| {
        out.push_str(line);
        out.push('\n');
        out
    })
}

/// Point a replayed command at its new session name.
///
/// `--name`/`--session` values equal to `old` become `new` (both the
/// separate and the `=` form), and an `argv[0]` naming the running binary
/// is replaced by `current_exe`.
pub fn rewrite_replay_command(
    command: &[String],
    old: &str,
    new: &str,
    current_exe: Option<&Path>,
) -> Vec<String> {
    let mut rewritten = Vec::with_capacity(command.len());
    let mut value_follows = false;

    for (i, arg) in command.iter().enumerate() {
        if i == 0 {
            let self_reference = current_exe.filter(|exe| {
                exe.file_name().is_some() && Path::new(arg).file_name() == exe.file_name()
            });
            rewritten.push(
                self_reference.map_or_else(|| arg.clone(), |exe| exe.display().to_string()),
            );
            continue;
        }
        if value_follows {
            value_follows = false;
            rewritten.push(if arg == old { new.to_string() } else { arg.clone() });
            continue;
        }
        if NAME_FLAGS.contains(&arg.as_str()) {
            value_follows = true;
            rewritten.push(arg.clone());
            continue;
        }
        match arg.split_once('=') {
            Some((flag, value)) if NAME_FLAGS.contains(&flag) && value == old => {
                rewritten.push(format!("{flag}={new}"));
            }
            _ => rewritten.push(arg.clone()),
        }
    }
    rewritten
}
