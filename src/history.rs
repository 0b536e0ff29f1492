//! Snapshot history log.
//!
//! Every published snapshot is appended to a local file as one JSON line,
//! domains nested and leaf kinds kept. The `export` subcommand reads the log
//! back and renders it as a JSON array or as CSV.

use crate::codec::Codec;
use crate::console;
use crate::core::MetricSnapshot;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("history log I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to render CSV: {0}")]
    Csv(String),
}

/// Append-only JSON lines file of published snapshots.
pub struct SnapshotLog {
    path: PathBuf,
}

impl SnapshotLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one snapshot. Snapshots without any domain are skipped.
    pub async fn append(&self, snapshot: &MetricSnapshot) -> Result<bool, HistoryError> {
        if snapshot.domains.is_empty() {
            return Ok(false);
        }
        let mut line = serde_json::to_string(snapshot)?;
        line.push('\n');

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(true)
    }

    /// Reads every logged snapshot in order. Lines that do not parse are
    /// skipped with a warning; a missing file reads as empty.
    pub async fn read_all(&self) -> Result<Vec<MetricSnapshot>, HistoryError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut snapshots = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = index + 1,
                    error = %e,
                    "Skipping unreadable history record."
                ),
            }
        }
        Ok(snapshots)
    }

    /// Appends every newly published snapshot until shutdown.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub async fn follow(
        self,
        mut snapshots: watch::Receiver<Arc<MetricSnapshot>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("History log writer started.");
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = snapshots.borrow_and_update().clone();
                    match self.append(&snapshot).await {
                        Ok(true) => {
                            metrics::counter!("history_records_total").increment(1);
                            debug!(domains = snapshot.domains.len(), "Snapshot appended to history log.");
                        }
                        Ok(false) => {}
                        Err(e) => {
                            metrics::counter!("history_errors_total").increment(1);
                            error!(error = %e, "Failed to append snapshot to history log.");
                        }
                    }
                }
            }
        }
        info!("History log writer finished.");
    }
}

/// The whole history as a pretty JSON array.
pub fn export_json(snapshots: &[MetricSnapshot]) -> Result<String, HistoryError> {
    Ok(serde_json::to_string_pretty(snapshots)?)
}

/// The whole history as CSV, one row per snapshot.
pub fn export_csv(snapshots: &[MetricSnapshot], codec: &Codec) -> Result<String, HistoryError> {
    console::render_csv_rows(snapshots, codec).map_err(|e| HistoryError::Csv(e.to_string()))
}
