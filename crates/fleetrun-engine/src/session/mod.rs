//! Named, supervised subprocess sessions persisted to a store directory.

mod archive;
mod compare;
mod error;
mod manager;
mod process;
mod store;
mod types;

pub use archive::{DIFF_ENTRY, LOG_ENTRY, METADATA_ENTRY, SessionArchive};
pub use compare::{LineChange, SessionComparison, SessionSummary, positional_line_diff};
pub use error::SessionError;
pub use manager::{
    AGENT_STATE_ENV, AGENT_STATE_FILE, SESSION_ENV, SessionManager, SessionOptions, StartRequest,
    rewrite_replay_command, tail_lines,
};
pub use process::{
    ExitReport, ProcessHandle, ProcessState, Signal, is_process_running, send_signal, supervise,
};
pub use store::{ARCHIVE_DIR, SessionStore};
pub use types::{
    Session, SessionKind, SessionStatus, unix_timestamp, validate_session_name,
};
