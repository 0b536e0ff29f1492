use super::backend::{BackendError, Point, QueryRow, TimeSeriesBackend};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory backend for tests.
///
/// Writes succeed and are stored unless the backend is marked unreachable,
/// a queued failure is pending, or a point carries a field registered as
/// conflicting (which rejects the whole batch with a schema conflict, like a
/// real server would).
#[derive(Clone, Default)]
pub struct FakeBackend {
    written: Arc<Mutex<Vec<Point>>>,
    queued_failures: Arc<Mutex<VecDeque<BackendError>>>,
    conflicting_fields: Arc<Mutex<HashSet<String>>>,
    unreachable: Arc<AtomicBool>,
    stalled_writes: Arc<AtomicUsize>,
    write_calls: Arc<AtomicUsize>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// The next write calls fail with these errors, in order.
    pub fn fail_next(&self, error: BackendError) {
        self.queued_failures.lock().unwrap().push_back(error);
    }

    /// The next `count` write calls never complete.
    pub fn stall_writes(&self, count: usize) {
        self.stalled_writes.store(count, Ordering::SeqCst);
    }

    pub fn reject_field(&self, key: &str) {
        self.conflicting_fields.lock().unwrap().insert(key.to_string());
    }

    pub fn written(&self) -> Vec<Point> {
        self.written.lock().unwrap().clone()
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TimeSeriesBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    async fn write(&self, points: &[Point]) -> Result<(), BackendError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let stalled = self
            .stalled_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if stalled {
            std::future::pending::<()>().await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BackendError::Transient("connection refused".to_string()));
        }
        if let Some(error) = self.queued_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        {
            let conflicting = self.conflicting_fields.lock().unwrap();
            if let Some(key) = points
                .iter()
                .flat_map(|p| p.fields.keys())
                .find(|k| conflicting.contains(*k))
            {
                return Err(BackendError::SchemaConflict(format!(
                    "field type conflict on '{}'",
                    key
                )));
            }
        }
        self.written.lock().unwrap().extend_from_slice(points);
        Ok(())
    }

    async fn query(
        &self,
        measurement: &str,
        _range: Duration,
    ) -> Result<Vec<QueryRow>, BackendError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BackendError::Transient("connection refused".to_string()));
        }
        let mut rows: Vec<QueryRow> = self
            .written
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.measurement == measurement)
            .map(|p| QueryRow {
                time: p.timestamp,
                fields: p.fields.clone(),
            })
            .collect();
        rows.sort_by_key(|row| row.time);
        Ok(rows)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(BackendError::Transient("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}
