//! The time-series backend seam.

use crate::codec::FlatRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// One write unit: a domain's flattened fields at its capture time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub measurement: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    pub fields: FlatRecord,
    pub timestamp: DateTime<Utc>,
}

/// One row returned by a range query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRow {
    pub time: DateTime<Utc>,
    pub fields: FlatRecord,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// Network or availability failure. Worth retrying.
    #[error("backend unavailable: {0}")]
    Transient(String),
    /// A field was written with a kind the backend already stores differently.
    #[error("field type conflict: {0}")]
    SchemaConflict(String),
    /// Any other permanent refusal of the request.
    #[error("write rejected: {0}")]
    Rejected(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            BackendError::Transient(_) => "transient",
            BackendError::SchemaConflict(_) => "schema_conflict",
            BackendError::Rejected(_) => "rejected",
        }
    }
}

/// A remote store that accepts typed field writes and answers range queries.
#[async_trait]
pub trait TimeSeriesBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Writes a batch. On a permanent error nothing in the batch is assumed to
    /// have been stored.
    async fn write(&self, points: &[Point]) -> Result<(), BackendError>;

    /// Returns every row of `measurement` from the last `range`, oldest first.
    async fn query(&self, measurement: &str, range: Duration)
        -> Result<Vec<QueryRow>, BackendError>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), BackendError>;
}
