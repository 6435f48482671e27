//! Dead-letter queue for submissions whose delivery retries ran out.
//!
//! Stored as newline-delimited JSON, one submission per line. A flush pass
//! retries every line and rewrites the file with exactly the lines that
//! still fail; lines that do not parse are kept byte for byte. The file is
//! handled as raw bytes throughout, so one undecodable line never blocks
//! the rest of the queue.
//!
//! The queue lock is held only while the file is read or replaced, never
//! during delivery. Records appended while a pass is delivering land after
//! the offset the pass read up to and are carried into the rewrite.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::domain::Submission;

use super::delivery::TransportError;
use super::retry::{DeliveryOutcome, RetryController};
use super::store::{non_empty_parent, write_atomic};

/// Errors reading or writing the queue file itself
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Why a queued line was kept during a flush
#[derive(Debug, Error)]
pub enum QueueReplayError {
    #[error("line {line}: not a submission: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("line {line}: delivery failed after {attempts} attempts: {source}")]
    Delivery {
        line: usize,
        attempts: u32,
        #[source]
        source: TransportError,
    },
}

impl QueueReplayError {
    pub fn line(&self) -> usize {
        match self {
            Self::Parse { line, .. } | Self::Delivery { line, .. } => *line,
        }
    }
}

/// Summary of one flush pass
#[derive(Debug, Default)]
pub struct FlushReport {
    /// Records delivered and removed from the queue
    pub delivered: usize,

    /// Records from this pass still queued afterwards
    pub remaining: usize,

    /// Records appended by other writers while the pass was delivering
    pub appended: usize,

    /// Why each remaining record was kept
    pub failures: Vec<QueueReplayError>,
}

impl FlushReport {
    /// Remaining lines that could not be parsed at all
    pub fn unparseable(&self) -> usize {
        self.failures
            .iter()
            .filter(|f| matches!(f, QueueReplayError::Parse { .. }))
            .count()
    }

    pub fn is_drained(&self) -> bool {
        self.remaining == 0 && self.appended == 0
    }
}

/// One line currently in the queue
#[derive(Debug, Clone)]
pub struct PendingRecord {
    /// 1-indexed line number in the file
    pub line: usize,

    /// The line exactly as stored, which need not be valid UTF-8
    pub raw: Vec<u8>,

    /// Parsed submission, if the line is valid
    pub submission: Option<Submission>,
}

impl PendingRecord {
    /// The stored line for display, with invalid bytes replaced
    pub fn raw_lossy(&self) -> String {
        String::from_utf8_lossy(&self.raw).into_owned()
    }
}

/// JSONL dead-letter queue
pub struct DeadLetterQueue {
    /// Path to the queue JSONL file
    path: PathBuf,

    /// Guards every read or replacement of the file within this process
    lock: Mutex<()>,

    /// Keeps flush passes from overlapping
    pass: Mutex<()>,
}

impl DeadLetterQueue {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
            pass: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a submission to the queue
    pub async fn enqueue(&self, submission: &Submission) -> Result<(), QueueError> {
        let mut line = serde_json::to_vec(submission)?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;

        if let Some(parent) = non_empty_parent(&self.path) {
            fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        debug!(path = %self.path.display(), "Submission queued for redelivery");
        Ok(())
    }

    /// Retry every queued record once through `retry`
    #[instrument(skip(self, retry), fields(path = %self.path.display()))]
    pub async fn flush(&self, retry: &RetryController) -> Result<FlushReport, QueueError> {
        let _pass = self.pass.lock().await;

        let snapshot = {
            let _guard = self.lock.lock().await;
            match read_bytes(&self.path).await? {
                Some(content) => content,
                None => return Ok(FlushReport::default()),
            }
        };

        let mut report = FlushReport::default();
        let mut kept: Vec<&[u8]> = Vec::new();

        for (line_no, line) in queue_lines(&snapshot) {
            let submission: Submission = match serde_json::from_slice(line) {
                Ok(submission) => submission,
                Err(source) => {
                    warn!(line = line_no, error = %source, "Queued record does not parse, keeping it");
                    kept.push(line);
                    report.failures.push(QueueReplayError::Parse {
                        line: line_no,
                        source,
                    });
                    continue;
                }
            };

            match retry.deliver_with_retry(&submission).await {
                DeliveryOutcome::Delivered { .. } => report.delivered += 1,
                DeliveryOutcome::Exhausted { attempts, error } => {
                    kept.push(line);
                    report.failures.push(QueueReplayError::Delivery {
                        line: line_no,
                        attempts,
                        source: error,
                    });
                }
            }
        }
        report.remaining = kept.len();

        let _guard = self.lock.lock().await;

        let current = read_bytes(&self.path).await?.unwrap_or_default();
        let Some(tail) = current.strip_prefix(snapshot.as_slice()) else {
            warn!("Queue file was replaced during the flush, leaving it untouched");
            return Ok(report);
        };
        report.appended = queue_lines(tail).count();

        let mut rewritten = Vec::with_capacity(snapshot.len() + tail.len());
        for line in &kept {
            rewritten.extend_from_slice(line);
            rewritten.push(b'\n');
        }
        rewritten.extend_from_slice(tail);

        if rewritten.iter().all(u8::is_ascii_whitespace) {
            match fs::remove_file(&self.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        } else if report.delivered > 0 || rewritten.len() != current.len() {
            write_atomic(&self.path, rewritten).await?;
        }

        if report.delivered > 0 || report.remaining > 0 {
            info!(
                delivered = report.delivered,
                remaining = report.remaining,
                appended = report.appended,
                "Dead-letter flush complete"
            );
        }

        Ok(report)
    }

    /// List queued records without attempting delivery
    pub async fn pending(&self) -> Result<Vec<PendingRecord>, QueueError> {
        let content = {
            let _guard = self.lock.lock().await;
            match read_bytes(&self.path).await? {
                Some(content) => content,
                None => return Ok(Vec::new()),
            }
        };

        Ok(queue_lines(&content)
            .map(|(line, raw)| PendingRecord {
                line,
                raw: raw.to_vec(),
                submission: serde_json::from_slice(raw).ok(),
            })
            .collect())
    }
}

/// Whole file as bytes; `None` when it does not exist
async fn read_bytes(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Non-blank lines with their 1-indexed line numbers
fn queue_lines(content: &[u8]) -> impl Iterator<Item = (usize, &[u8])> {
    content
        .split(|b| *b == b'\n')
        .enumerate()
        .filter(|(_, line)| !line.iter().all(u8::is_ascii_whitespace))
        .map(|(idx, line)| (idx + 1, line))
}
