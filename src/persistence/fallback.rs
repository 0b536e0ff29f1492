//! Local append-only fallback log.
//!
//! Points that could not reach the backend are appended as JSON lines. The
//! log is bounded: once it holds `capacity` records, further appends are
//! refused and counted. A replay hands every logged point to the caller and
//! rewrites the file with whatever the caller gives back, through a temporary
//! file and a rename so a crash mid-replay leaves either the old or the new
//! log.

use super::backend::Point;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

#[derive(Error, Debug)]
pub enum FallbackError {
    #[error("fallback log I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode fallback record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// How an append went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppendReport {
    pub appended: usize,
    /// Points refused because the log is at capacity.
    pub refused: usize,
}

pub struct FallbackLog {
    path: PathBuf,
    capacity: usize,
    // Number of records currently in the file.
    records: Mutex<usize>,
    // Readable without waiting on a running replay.
    records_hint: AtomicUsize,
}

impl FallbackLog {
    /// Opens (or prepares to create) the log and counts existing records.
    pub async fn open(path: impl Into<PathBuf>, capacity: usize) -> Result<Self, FallbackError> {
        let path = path.into();
        let records = match fs::read_to_string(&path).await {
            Ok(contents) => contents.lines().filter(|l| !l.trim().is_empty()).count(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if records > 0 {
            warn!(path = %path.display(), records, "Fallback log holds records from a previous run.");
        }
        Ok(Self {
            path,
            capacity,
            records: Mutex::new(records),
            records_hint: AtomicUsize::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn pending(&self) -> usize {
        *self.records.lock().await
    }

    /// Like [`pending`](Self::pending) but never waits on a running replay;
    /// during a replay it reports the count from before the replay.
    pub fn pending_hint(&self) -> usize {
        self.records_hint.load(Ordering::Relaxed)
    }

    fn set_records(&self, records: &mut usize, value: usize) {
        *records = value;
        self.records_hint.store(value, Ordering::Relaxed);
    }

    /// Appends as many points as fit.
    pub async fn append(&self, points: &[Point]) -> Result<AppendReport, FallbackError> {
        if points.is_empty() {
            return Ok(AppendReport::default());
        }
        let mut records = self.records.lock().await;
        let room = self.capacity.saturating_sub(*records);
        let accepted = &points[..room.min(points.len())];
        let refused = points.len() - accepted.len();

        if !accepted.is_empty() {
            let mut body = String::new();
            for point in accepted {
                body.push_str(&serde_json::to_string(point)?);
                body.push('\n');
            }
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(body.as_bytes()).await?;
            file.flush().await?;
            let total = *records + accepted.len();
            self.set_records(&mut records, total);
            metrics::counter!("fallback_records_total").increment(accepted.len() as u64);
            debug!(appended = accepted.len(), total = *records, "Points written to fallback log.");
        }
        if refused > 0 {
            metrics::counter!("fallback_refused_total").increment(refused as u64);
            error!(
                refused,
                capacity = self.capacity,
                path = %self.path.display(),
                "Fallback log is full, points discarded."
            );
        }

        Ok(AppendReport {
            appended: accepted.len(),
            refused,
        })
    }

    /// Reads every logged point, passes them to `send`, and keeps only the
    /// points `send` returns. Appends wait until the replay finishes.
    pub async fn replay<F, Fut>(&self, send: F) -> Result<usize, FallbackError>
    where
        F: FnOnce(Vec<Point>) -> Fut,
        Fut: Future<Output = Vec<Point>>,
    {
        let mut records = self.records.lock().await;
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.set_records(&mut records, 0);
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let mut points = Vec::new();
        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Point>(line) {
                Ok(point) => points.push(point),
                Err(e) => warn!(line = line_no + 1, error = %e, "Skipping unreadable fallback record."),
            }
        }
        if points.is_empty() {
            fs::remove_file(&self.path).await.or_else(ignore_missing)?;
            self.set_records(&mut records, 0);
            return Ok(0);
        }

        let remaining = send(points).await;

        if remaining.is_empty() {
            fs::remove_file(&self.path).await.or_else(ignore_missing)?;
        } else {
            let mut body = String::new();
            for point in &remaining {
                body.push_str(&serde_json::to_string(point)?);
                body.push('\n');
            }
            let tmp = self.path.with_extension("jsonl.tmp");
            fs::write(&tmp, body).await?;
            fs::rename(&tmp, &self.path).await?;
        }
        self.set_records(&mut records, remaining.len());
        Ok(remaining.len())
    }
}

fn ignore_missing(e: std::io::Error) -> Result<(), std::io::Error> {
    if e.kind() == std::io::ErrorKind::NotFound {
        Ok(())
    } else {
        Err(e)
    }
}
