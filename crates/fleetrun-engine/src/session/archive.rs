//! Portable session archives.
//!
//! A zip holding `metadata.json` (the session record), `session.log` and an
//! optional `work.diff`.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::{Session, SessionError};

pub const METADATA_ENTRY: &str = "metadata.json";
pub const LOG_ENTRY: &str = "session.log";
pub const DIFF_ENTRY: &str = "work.diff";

/// In-memory contents of an exported session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionArchive {
    pub session: Session,
    pub log: Vec<u8>,
    pub diff: Option<Vec<u8>>,
}

impl SessionArchive {
    pub async fn write(self, path: PathBuf) -> Result<(), SessionError> {
        tokio::task::spawn_blocking(move || self.write_to(&path)).await?
    }

    pub async fn read(path: PathBuf) -> Result<Self, SessionError> {
        tokio::task::spawn_blocking(move || Self::read_from(&path)).await?
    }

    /// Write the archive next to `path` and rename it into place.
    pub fn write_to(&self, path: &Path) -> Result<(), SessionError> {
        let Some(file_name) = path.file_name() else {
            return Err(SessionError::io(path)(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "archive path has no file name",
            )));
        };
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(".tmp");
        let tmp = path.with_file_name(tmp_name);

        let result = self
            .write_zip(&tmp)
            .and_then(|()| std::fs::rename(&tmp, path).map_err(SessionError::io(path)));
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp);
        }
        result
    }

    fn write_zip(&self, path: &Path) -> Result<(), SessionError> {
        let archive_err = |source| SessionError::Archive {
            path: path.to_path_buf(),
            source,
        };
        let metadata = serde_json::to_vec_pretty(&self.session).map_err(|source| {
            SessionError::Corrupt {
                path: path.to_path_buf(),
                source,
            }
        })?;

        let file = File::create(path).map_err(SessionError::io(path))?;
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        let mut entries = vec![
            (METADATA_ENTRY, metadata.as_slice()),
            (LOG_ENTRY, self.log.as_slice()),
        ];
        if let Some(diff) = &self.diff {
            entries.push((DIFF_ENTRY, diff.as_slice()));
        }
        for (name, bytes) in entries {
            zip.start_file(name, options).map_err(archive_err)?;
            zip.write_all(bytes).map_err(SessionError::io(path))?;
        }

        let file = zip.finish().map_err(archive_err)?;
        file.sync_all().map_err(SessionError::io(path))
    }

    /// Read every entry into memory. Only `metadata.json` is required.
    pub fn read_from(path: &Path) -> Result<Self, SessionError> {
        let malformed = |reason: String| SessionError::MalformedArchive {
            path: path.to_path_buf(),
            reason,
        };

        let file = File::open(path).map_err(SessionError::io(path))?;
        let mut zip = ZipArchive::new(file).map_err(|e| malformed(e.to_string()))?;

        let metadata = read_entry(&mut zip, METADATA_ENTRY, path)?
            .ok_or_else(|| malformed(format!("missing {METADATA_ENTRY}")))?;
        let session: Session = serde_json::from_slice(&metadata)
            .map_err(|e| malformed(format!("invalid {METADATA_ENTRY}: {e}")))?;
        let log = read_entry(&mut zip, LOG_ENTRY, path)?.unwrap_or_default();
        let diff = read_entry(&mut zip, DIFF_ENTRY, path)?;

        Ok(Self { session, log, diff })
    }
}

fn read_entry(
    zip: &mut ZipArchive<File>,
    name: &str,
    path: &Path,
) -> Result<Option<Vec<u8>>, SessionError> {
    let mut entry = match zip.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(source) => {
            return Err(SessionError::Archive {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let mut bytes = Vec::new();
    entry
        .read_to_end(&mut bytes)
        .map_err(SessionError::io(path))?;
    Ok(Some(bytes))
}
