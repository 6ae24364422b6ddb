//! On-disk session store.
//!
//! Layout of a store directory:
//!
//! ```text
//! <dir>/<name>.json      session record
//! <dir>/<name>.log       captured stdout+stderr
//! <dir>/<name>.diff      work diff materialized by import
//! <dir>/archived/        a nested store for archived sessions
//! ```
//!
//! Records are replaced atomically (write to a hidden temp file, fsync,
//! rename). Read-modify-write cycles within one process are serialized by
//! an async mutex; concurrent processes are last-writer-wins.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Session, SessionError, validate_session_name};

/// Name of the nested store holding archived sessions.
pub const ARCHIVE_DIR: &str = "archived";

#[derive(Debug)]
pub struct SessionStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The nested store for archived sessions.
    pub fn archived(&self) -> Self {
        Self::new(self.dir.join(ARCHIVE_DIR))
    }

    pub fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub fn log_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.log"))
    }

    pub fn diff_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.diff"))
    }

    /// Log written by a starting session until its record is committed.
    pub fn pending_log_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!(".{name}.log.starting"))
    }

    /// Create the store directory (mode 0700 on unix).
    pub async fn ensure_dir(&self) -> Result<(), SessionError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(SessionError::io(&self.dir))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o700))
                .await
                .map_err(SessionError::io(&self.dir))?;
        }
        Ok(())
    }

    pub async fn exists(&self, name: &str) -> bool {
        tokio::fs::try_exists(self.record_path(name))
            .await
            .unwrap_or(false)
    }

    pub async fn load(&self, name: &str) -> Result<Session, SessionError> {
        validate_session_name(name)?;
        self.read_record(name).await
    }

    /// Like [`SessionStore::load`] but a missing record is `Ok(None)`.
    pub async fn try_load(&self, name: &str) -> Result<Option<Session>, SessionError> {
        match self.load(name).await {
            Ok(session) => Ok(Some(session)),
            Err(SessionError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn save(&self, session: &Session) -> Result<(), SessionError> {
        validate_session_name(&session.name)?;
        let _guard = self.lock.lock().await;
        self.write_record(session).await
    }

    /// Load, modify and save a record while holding the store lock.
    pub async fn update<F>(&self, name: &str, f: F) -> Result<Session, SessionError>
    where
        F: FnOnce(&mut Session) + Send,
    {
        validate_session_name(name)?;
        let _guard = self.lock.lock().await;
        let mut session = self.read_record(name).await?;
        f(&mut session);
        self.write_record(&session).await?;
        Ok(session)
    }

    /// All readable records, oldest first. Unparsable records are skipped.
    pub async fn list(&self) -> Result<Vec<Session>, SessionError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SessionError::io(&self.dir)(e)),
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(SessionError::io(&self.dir))?
        {
            let path = entry.path();
            let is_record = path.extension().is_some_and(|ext| ext == "json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_record {
                continue;
            }
            match read_json(&path).await {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable session record");
                }
            }
        }
        sessions.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(sessions)
    }

    /// Delete a record together with its store-owned log and diff.
    pub async fn remove(&self, name: &str) -> Result<(), SessionError> {
        validate_session_name(name)?;
        let _guard = self.lock.lock().await;
        if let Ok(session) = self.read_record(name).await {
            if session.log_file.starts_with(&self.dir) {
                remove_if_exists(&session.log_file).await?;
            }
        }
        remove_if_exists(&self.log_path(name)).await?;
        remove_if_exists(&self.diff_path(name)).await?;
        remove_if_exists(&self.record_path(name)).await?;
        debug!(session = name, "Removed session record");
        Ok(())
    }

    /// Move a session (record, log, diff) into another store.
    pub async fn transfer(&self, name: &str, dest: &Self) -> Result<Session, SessionError> {
        validate_session_name(name)?;
        let _guard = self.lock.lock().await;
        let mut session = self.read_record(name).await?;
        dest.ensure_dir().await?;
        if dest.exists(name).await {
            return Err(SessionError::AlreadyExists {
                name: name.to_string(),
            });
        }

        if session.log_file == self.log_path(name) {
            let target = dest.log_path(name);
            move_if_exists(&session.log_file, &target).await?;
            session.log_file = target;
        }
        move_if_exists(&self.diff_path(name), &dest.diff_path(name)).await?;
        dest.save(&session).await?;
        remove_if_exists(&self.record_path(name)).await?;
        debug!(
            session = name,
            from = %self.dir.display(),
            to = %dest.dir.display(),
            "Transferred session"
        );
        Ok(session)
    }

    /// Rename a session and the store-owned files that carry its name.
    pub async fn rename(&self, old: &str, new: &str) -> Result<Session, SessionError> {
        validate_session_name(old)?;
        validate_session_name(new)?;
        let _guard = self.lock.lock().await;
        if self.exists(new).await {
            return Err(SessionError::AlreadyExists {
                name: new.to_string(),
            });
        }
        let mut session = self.read_record(old).await?;

        let old_log = session.log_file.clone();
        let moved_log = old_log == self.log_path(old);
        if moved_log {
            move_if_exists(&old_log, &self.log_path(new)).await?;
            session.log_file = self.log_path(new);
        }
        session.name = new.to_string();

        if let Err(e) = self.write_record(&session).await {
            if moved_log {
                let _ = move_if_exists(&self.log_path(new), &old_log).await;
            }
            return Err(e);
        }
        move_if_exists(&self.diff_path(old), &self.diff_path(new)).await?;
        remove_if_exists(&self.record_path(old)).await?;
        Ok(session)
    }

    async fn read_record(&self, name: &str) -> Result<Session, SessionError> {
        let path = self.record_path(name);
        match read_json(&path).await {
            Err(SessionError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
                Err(SessionError::NotFound {
                    name: name.to_string(),
                })
            }
            other => other,
        }
    }

    async fn write_record(&self, session: &Session) -> Result<(), SessionError> {
        let path = self.record_path(&session.name);
        let tmp = self.dir.join(format!(".{}.json.tmp", session.name));
        let json = serde_json::to_vec_pretty(session).map_err(|source| SessionError::Corrupt {
            path: path.clone(),
            source,
        })?;

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(SessionError::io(&tmp))?;
        file.write_all(&json).await.map_err(SessionError::io(&tmp))?;
        file.sync_all().await.map_err(SessionError::io(&tmp))?;
        drop(file);

        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(SessionError::io(&path))
    }
}

async fn read_json(path: &Path) -> Result<Session, SessionError> {
    let bytes = tokio::fs::read(path).await.map_err(SessionError::io(path))?;
    serde_json::from_slice(&bytes).map_err(|source| SessionError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) async fn remove_if_exists(path: &Path) -> Result<(), SessionError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SessionError::io(path)(e)),
    }
}

async fn move_if_exists(from: &Path, to: &Path) -> Result<(), SessionError> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SessionError::io(from)(e)),
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::session::{SessionKind, SessionStatus};

    fn session(store: &SessionStore, name: &str, start_time: i64) -> Session {
        Session {
            name: name.to_string(),
            status: SessionStatus::Stopped,
            pid: None,
            kind: SessionKind::Detached,
            goal: String::new(),
            start_time,
            end_time: Some(start_time + 5),
            workspace: PathBuf::from("/tmp"),
            command: vec!["true".to_string()],
            log_file: store.log_path(name),
            agent_state_file: None,
            start_commit_sha: None,
            end_commit_sha: None,
            error: None,
        }
    }

    async fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions"));
        store.ensure_dir().await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn save_then_load() {
        let (_dir, store) = store().await;
        let record = session(&store, "alpha", 10);
        store.save(&record).await.unwrap();
        assert_eq!(store.load("alpha").await.unwrap(), record);
        assert!(store.exists("alpha").await);
    }

    #[tokio::test]
    async fn save_leaves_no_temp_files() {
        let (_dir, store) = store().await;
        store.save(&session(&store, "alpha", 10)).await.unwrap();
        let names: Vec<String> = std::fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["alpha.json"]);
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let (_dir, store) = store().await;
        assert!(matches!(
            store.load("ghost").await,
            Err(SessionError::NotFound { .. })
        ));
        assert!(store.try_load("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn load_rejects_traversal() {
        let (_dir, store) = store().await;
        assert!(matches!(
            store.load("../secrets").await,
            Err(SessionError::InvalidName { .. })
        ));
    }

    #[tokio::test]
    async fn list_is_sorted_and_skips_junk() {
        let (_dir, store) = store().await;
        store.save(&session(&store, "late", 30)).await.unwrap();
        store.save(&session(&store, "early", 10)).await.unwrap();
        std::fs::write(store.dir().join("broken.json"), "{").unwrap();
        std::fs::write(store.dir().join(".partial.json.tmp"), "{}").unwrap();
        std::fs::write(store.dir().join("early.log"), "output").unwrap();

        let names: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn list_of_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("nope"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_applies_change() {
        let (_dir, store) = store().await;
        store.save(&session(&store, "alpha", 10)).await.unwrap();
        let updated = store
            .update("alpha", |s| s.error = Some("exit 1".to_string()))
            .await
            .unwrap();
        assert_eq!(updated.error.as_deref(), Some("exit 1"));
        assert_eq!(
            store.load("alpha").await.unwrap().error.as_deref(),
            Some("exit 1")
        );
    }

    #[tokio::test]
    async fn remove_deletes_owned_files() {
        let (_dir, store) = store().await;
        store.save(&session(&store, "alpha", 10)).await.unwrap();
        std::fs::write(store.log_path("alpha"), "out").unwrap();
        std::fs::write(store.diff_path("alpha"), "diff").unwrap();

        store.remove("alpha").await.unwrap();
        assert!(!store.exists("alpha").await);
        assert!(!store.log_path("alpha").exists());
        assert!(!store.diff_path("alpha").exists());
    }

    #[tokio::test]
    async fn rename_moves_record_and_log() {
        let (_dir, store) = store().await;
        store.save(&session(&store, "old", 10)).await.unwrap();
        std::fs::write(store.log_path("old"), "out").unwrap();

        let renamed = store.rename("old", "new").await.unwrap();
        assert_eq!(renamed.name, "new");
        assert_eq!(renamed.log_file, store.log_path("new"));
        assert!(!store.exists("old").await);
        assert_eq!(std::fs::read_to_string(store.log_path("new")).unwrap(), "out");
    }

    #[tokio::test]
    async fn rename_refuses_existing_target() {
        let (_dir, store) = store().await;
        store.save(&session(&store, "a", 10)).await.unwrap();
        store.save(&session(&store, "b", 11)).await.unwrap();
        assert!(matches!(
            store.rename("a", "b").await,
            Err(SessionError::AlreadyExists { .. })
        ));
        assert!(store.exists("a").await);
    }

    #[tokio::test]
    async fn transfer_moves_into_archive_and_back() {
        let (_dir, store) = store().await;
        store.save(&session(&store, "alpha", 10)).await.unwrap();
        std::fs::write(store.log_path("alpha"), "out").unwrap();
        let archive = store.archived();

        let moved = store.transfer("alpha", &archive).await.unwrap();
        assert_eq!(moved.log_file, archive.log_path("alpha"));
        assert!(!store.exists("alpha").await);
        assert!(archive.exists("alpha").await);
        // The archive directory is not listed as a session.
        assert!(store.list().await.unwrap().is_empty());

        archive.transfer("alpha", &store).await.unwrap();
        assert!(store.exists("alpha").await);
        assert_eq!(std::fs::read_to_string(store.log_path("alpha")).unwrap(), "out");
    }
}
