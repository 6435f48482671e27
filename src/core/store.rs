//! Durable store: every submission ever captured, as one JSON array file.
//!
//! JSON text has no native append-to-array, so each persist is a
//! read-modify-write of the whole list followed by an atomic rename. An
//! unreadable existing file is quarantined next to the original instead of
//! being overwritten.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::Submission;

/// Errors that can occur while persisting
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store file {path} is not a JSON array: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// Result of the fault-tolerant read that precedes every persist
#[derive(Debug)]
enum LoadOutcome {
    /// No file, or an empty one
    Empty,

    /// Existing records, in stored order
    Loaded(Vec<Value>),

    /// The file was unreadable and has been moved aside
    Quarantined { backup: PathBuf },
}

/// What a persist did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistReport {
    /// Records in the store after the write
    pub count: usize,

    /// Backup location, if the previous file had to be quarantined
    pub quarantined: Option<PathBuf>,
}

/// Append-style JSON list of submissions
pub struct DurableStore {
    /// Path to the JSON list file
    path: PathBuf,

    /// Serialises read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl DurableStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a submission to the store.
    ///
    /// A corrupted existing file never fails this call; only I/O errors on
    /// the new write do.
    pub async fn persist(&self, submission: &Submission) -> Result<PersistReport, StoreError> {
        let _guard = self.lock.lock().await;

        if let Some(parent) = non_empty_parent(&self.path) {
            fs::create_dir_all(parent).await?;
        }

        let (mut records, quarantined) = match self.load_or_quarantine().await? {
            LoadOutcome::Empty => (Vec::new(), None),
            LoadOutcome::Loaded(records) => (records, None),
            LoadOutcome::Quarantined { backup } => (Vec::new(), Some(backup)),
        };
        records.push(serde_json::to_value(submission)?);
        let count = records.len();

        let encoded = serde_json::to_vec_pretty(&records)?;
        write_atomic(&self.path, encoded).await?;

        debug!(path = %self.path.display(), count, "Persisted submission");
        Ok(PersistReport { count, quarantined })
    }

    /// Read every stored submission without modifying the file
    pub async fn read_all(&self) -> Result<Vec<Submission>, StoreError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    async fn load_or_quarantine(&self) -> Result<LoadOutcome, StoreError> {
        let content = match fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LoadOutcome::Empty),
            Err(e) => return Err(e.into()),
        };

        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(LoadOutcome::Empty);
        }

        let reason = match serde_json::from_slice::<Value>(&content) {
            Ok(Value::Array(records)) => return Ok(LoadOutcome::Loaded(records)),
            Ok(_) => "root is not an array".to_string(),
            Err(e) => e.to_string(),
        };

        let backup = quarantine_path(&self.path, Utc::now().timestamp());
        fs::rename(&self.path, &backup).await?;

        warn!(
            path = %self.path.display(),
            backup = %backup.display(),
            %reason,
            "Store file unreadable, quarantined and starting fresh"
        );

        Ok(LoadOutcome::Quarantined { backup })
    }
}

/// Backup name for an unreadable file: `<stem>.corrupt.<unix-ts>.json`.
///
/// Falls back to a numbered variant when that name is already taken.
pub fn quarantine_path(path: &Path, unix_ts: i64) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());

    let candidate = path.with_file_name(format!("{}.corrupt.{}.json", stem, unix_ts));
    if !candidate.exists() {
        return candidate;
    }

    (1u32..)
        .map(|n| path.with_file_name(format!("{}.corrupt.{}.{}.json", stem, unix_ts, n)))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Replace `path` with `contents` via a temporary sibling and a rename, so
/// readers never observe a partially written file.
pub(crate) async fn write_atomic(path: &Path, contents: Vec<u8>) -> io::Result<()> {
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let dir = non_empty_parent(&path).unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&contents)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

pub(crate) fn non_empty_parent(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| !p.as_os_str().is_empty())
}
