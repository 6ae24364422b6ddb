//! Process supervision and signalling.
//!
//! Every session started by this process gets one supervisor task that owns
//! the `Child`, waits for it and publishes its state over a watch channel.
//! Sessions started elsewhere are probed with `kill(pid, 0)` instead.

use std::future::Future;
use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Observed state of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Spawned,
    Running,
    /// Exit code, `None` when terminated by a signal.
    Exited(Option<i32>),
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// A stop was requested through [`ProcessHandle::request_stop`] before exit.
    pub stop_requested: bool,
}

impl ExitReport {
    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("process exited with code {code}"),
            (None, Some(signal)) => format!("process killed by signal {signal}"),
            (None, None) => "process exited abnormally".to_string(),
        }
    }
}

/// Read side of a supervised process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    state: watch::Receiver<ProcessState>,
    stop_requested: Arc<AtomicBool>,
}

impl ProcessHandle {
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.state(), ProcessState::Exited(_))
    }

    /// Mark the coming exit as requested so the supervisor leaves the
    /// final status to the stopper.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Wait up to `timeout` for the process to exit.
    ///
    /// Returns `Some(code)` once exited, `None` on timeout.
    pub async fn wait_exit(&self, timeout: Duration) -> Option<Option<i32>> {
        let mut rx = self.state.clone();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| matches!(s, ProcessState::Exited(_))),
        )
        .await;
        match waited {
            Ok(Ok(state)) => match *state {
                ProcessState::Exited(code) => Some(code),
                _ => None,
            },
            // Supervisor gone: the child was reaped or dropped.
            Ok(Err(_)) => Some(None),
            Err(_) => None,
        }
    }
}

/// Spawn the supervisor for `child`.
///
/// `on_exit` runs before `Exited` is published, so anyone observing the
/// exit through the handle also sees what `on_exit` persisted.
pub fn supervise<F, Fut>(pid: u32, mut child: Child, on_exit: F) -> ProcessHandle
where
    F: FnOnce(ExitReport) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = watch::channel(ProcessState::Spawned);
    let stop_requested = Arc::new(AtomicBool::new(false));
    let handle = ProcessHandle {
        pid,
        state: rx,
        stop_requested: Arc::clone(&stop_requested),
    };

    tokio::spawn(async move {
        tx.send_replace(ProcessState::Running);
        let report = match child.wait().await {
            Ok(status) => exit_report(status, stop_requested.load(Ordering::SeqCst)),
            Err(e) => {
                warn!(pid, error = %e, "Failed to wait for session process");
                ExitReport {
                    code: None,
                    signal: None,
                    stop_requested: stop_requested.load(Ordering::SeqCst),
                }
            }
        };
        debug!(pid, ?report, "Session process exited");
        on_exit(report).await;
        tx.send_replace(ProcessState::Exited(report.code));
    });

    handle
}

fn exit_report(status: ExitStatus, stop_requested: bool) -> ExitReport {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ExitReport {
        code: status.code(),
        signal,
        stop_requested,
    }
}

/// Signals the manager sends to session processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Kill,
    Stop,
    Continue,
}

#[cfg(unix)]
impl Signal {
    const fn as_raw(self) -> libc::c_int {
        match self {
            Self::Interrupt => libc::SIGINT,
            Self::Terminate => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
            Self::Stop => libc::SIGSTOP,
            Self::Continue => libc::SIGCONT,
        }
    }
}

fn checked_pid(pid: u32) -> io::Result<i32> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(raw),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid pid {pid}"),
        )),
    }
}

/// Signal the process group led by `pid`, falling back to the process.
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: Signal) -> io::Result<()> {
    let raw = checked_pid(pid)?;
    // SAFETY: kill(2) has no memory-safety preconditions. `raw` is positive,
    // so neither call can address every process on the system.
    #[allow(unsafe_code)]
    let group = unsafe { libc::kill(-raw, signal.as_raw()) };
    if group == 0 {
        return Ok(());
    }
    // SAFETY: as above.
    #[allow(unsafe_code)]
    let single = unsafe { libc::kill(raw, signal.as_raw()) };
    if single == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn send_signal(pid: u32, _signal: Signal) -> io::Result<()> {
    checked_pid(pid)?;
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process signals require a unix platform",
    ))
}

/// Liveness probe via the null signal. EPERM means the process exists.
#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    let Ok(raw) = checked_pid(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(raw, 0) };
    ret == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub const fn is_process_running(_pid: u32) -> bool {
    false
}
