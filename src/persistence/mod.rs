//! Persistence of snapshots to a time-series backend.
//!
//! The feeder task turns each newly published domain sample into a [`Point`]
//! and queues it in a bounded [`PersistenceBuffer`]. A separate drain task
//! writes batches to the backend, so a slow backend never stalls sampling.
//!
//! Transient failures are retried with exponential backoff and jitter; points
//! that still fail go to the [`FallbackLog`]. Permanent failures (a schema
//! conflict or other rejection) are isolated to the offending points, which
//! are logged and dropped. While the backend is unreachable, batches go
//! straight to the fallback log and a periodic probe waits for recovery,
//! after which the log is replayed automatically.

pub mod backend;
pub mod buffer;
pub mod fallback;
pub mod health;
pub mod influx;
pub mod line_protocol;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use backend::{BackendError, Point, QueryRow, TimeSeriesBackend};
pub use buffer::{OverflowPolicy, PersistenceBuffer};
pub use fallback::{AppendReport, FallbackError, FallbackLog};
pub use health::{BackendHealth, HealthState};
pub use influx::InfluxBackend;

use crate::codec::Codec;
use crate::config::PersistenceConfig;
use crate::core::{DomainSample, MetricSnapshot};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PersistenceConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before retry number `attempt + 1`: `initial * 2^attempt`, capped,
    /// then scaled by a random factor in `[0.8, 1.2]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self
            .initial_backoff
            .saturating_mul(2_u32.saturating_pow(attempt))
            .min(self.max_backoff);
        base.mul_f64(rand::rng().random_range(0.8..=1.2))
    }
}

/// Totals of a fallback replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResyncReport {
    pub sent: usize,
    pub dropped: usize,
    pub remaining: usize,
}

#[derive(Debug, Default)]
struct BatchOutcome {
    written: usize,
    dropped: usize,
    unsent: Vec<Point>,
    error: Option<BackendError>,
}

fn log_dropped(point: &Point, error: &BackendError) {
    let fields: Vec<&str> = point.fields.keys().map(String::as_str).collect();
    match error {
        BackendError::SchemaConflict(_) => {
            metrics::counter!("schema_conflicts_total").increment(1);
            error!(
                measurement = %point.measurement,
                fields = ?fields,
                error = %error,
                "Backend rejected a field type. Point dropped; check metric kinds and the codec."
            );
        }
        _ => {
            error!(measurement = %point.measurement, error = %error, "Backend rejected point. Point dropped.");
        }
    }
    metrics::counter!("backend_writes_total", "outcome" => error.label()).increment(1);
}

/// Writes one batch. A permanent error on a multi-point batch is narrowed
/// down by writing the points one at a time, so only the offending points
/// are dropped. A transient error stops the attempt and hands back
/// everything not yet written.
async fn send_batch(backend: &dyn TimeSeriesBackend, points: Vec<Point>) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    match backend.write(&points).await {
        Ok(()) => outcome.written = points.len(),
        Err(e) if e.is_transient() => {
            outcome.unsent = points;
            outcome.error = Some(e);
        }
        Err(e) if points.len() == 1 => {
            log_dropped(&points[0], &e);
            outcome.dropped = 1;
        }
        Err(e) => {
            debug!(count = points.len(), error = %e, "Batch rejected, writing points individually.");
            let mut rest = points.into_iter();
            while let Some(point) = rest.next() {
                match backend.write(std::slice::from_ref(&point)).await {
                    Ok(()) => outcome.written += 1,
                    Err(e) if e.is_transient() => {
                        outcome.unsent.push(point);
                        outcome.unsent.extend(rest);
                        outcome.error = Some(e);
                        break;
                    }
                    Err(e) => {
                        log_dropped(&point, &e);
                        outcome.dropped += 1;
                    }
                }
            }
        }
    }
    if outcome.written > 0 {
        metrics::counter!("backend_writes_total", "outcome" => "ok").increment(outcome.written as u64);
    }
    outcome
}

/// Buffers points and delivers them to the backend.
pub struct PersistenceClient {
    backend: Arc<dyn TimeSeriesBackend>,
    codec: Arc<Codec>,
    buffer: Mutex<PersistenceBuffer>,
    // A batch taken from the buffer whose delivery has not finished.
    in_flight: Mutex<Vec<Point>>,
    fallback: FallbackLog,
    health: BackendHealth,
    pending: Notify,
    retry: RetryPolicy,
    batch_size: usize,
    probe_interval: Duration,
    tags: BTreeMap<String, String>,
}

impl PersistenceClient {
    pub async fn new(
        backend: Arc<dyn TimeSeriesBackend>,
        codec: Arc<Codec>,
        config: &PersistenceConfig,
        tags: BTreeMap<String, String>,
    ) -> Result<Arc<Self>, FallbackError> {
        let fallback = FallbackLog::open(&config.fallback_path, config.fallback_capacity).await?;
        Ok(Arc::new(Self {
            backend,
            codec,
            buffer: Mutex::new(PersistenceBuffer::new(config.buffer_capacity, config.overflow)),
            in_flight: Mutex::new(Vec::new()),
            fallback,
            health: BackendHealth::new(HealthState::Reachable),
            pending: Notify::new(),
            retry: RetryPolicy::from_config(config),
            batch_size: config.batch_size.max(1),
            probe_interval: Duration::from_secs(config.probe_interval_seconds.max(1)),
            tags,
        }))
    }

    pub fn codec(&self) -> &Arc<Codec> {
        &self.codec
    }

    pub fn is_reachable(&self) -> bool {
        self.health.is_reachable()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn fallback_pending(&self) -> usize {
        self.fallback.pending_hint()
    }

    /// Flattens one domain sample into a point. Leaves whose kind conflicts
    /// with what was written before are left out by the codec.
    pub fn point_for(&self, domain: &str, sample: &DomainSample) -> Option<Point> {
        let flattened = self.codec.flatten_domain(domain, &sample.tree);
        if !flattened.conflicts.is_empty() {
            metrics::counter!("codec_conflicts_total", "domain" => domain.to_string())
                .increment(flattened.conflicts.len() as u64);
        }
        if flattened.record.is_empty() {
            return None;
        }
        Some(Point {
            measurement: domain.to_string(),
            tags: self.tags.clone(),
            fields: flattened.record,
            timestamp: sample.captured_at,
        })
    }

    /// Queues a point for the drain task.
    pub async fn write(&self, point: Point) {
        let (evicted, policy, depth) = {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            let evicted = buffer.push(point);
            (evicted, buffer.policy(), buffer.len())
        };
        metrics::gauge!("persistence_buffer_depth").set(depth as f64);

        if let Some(evicted) = evicted {
            match policy {
                OverflowPolicy::Spill => self.to_fallback(vec![evicted]).await,
                OverflowPolicy::DropOldest => {
                    metrics::counter!("persistence_dropped_total").increment(1);
                    warn!(measurement = %evicted.measurement, "Persistence buffer full, oldest point dropped.");
                }
            }
        }
        self.pending.notify_one();
    }

    /// Writes everything currently buffered.
    pub async fn drain(&self) {
        loop {
            let batch = {
                let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
                let batch = buffer.take_batch(self.batch_size);
                metrics::gauge!("persistence_buffer_depth").set(buffer.len() as f64);
                batch
            };
            if batch.is_empty() {
                break;
            }
            *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = batch.clone();
            self.deliver(batch).await;
            self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).clear();
        }
    }

    /// Returns a batch whose delivery was cut short to the front of the
    /// buffer, so the next drain sends it first.
    async fn requeue_in_flight(&self) {
        let interrupted = std::mem::take(&mut *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner));
        if interrupted.is_empty() {
            return;
        }
        debug!(points = interrupted.len(), "Requeueing interrupted batch.");
        let overflow = self
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .requeue_front(interrupted);
        self.to_fallback(overflow).await;
    }

    async fn deliver(&self, batch: Vec<Point>) {
        if !self.health.is_reachable() {
            self.to_fallback(batch).await;
            return;
        }

        let name = self.backend.name().to_string();
        let mut pending = batch;
        let mut attempt = 0;
        loop {
            let outcome = send_batch(&*self.backend, pending).await;
            let Some(error) = outcome.error else {
                self.health.mark_success(&name);
                return;
            };
            metrics::counter!("backend_writes_total", "outcome" => error.label()).increment(1);
            pending = outcome.unsent;
            attempt += 1;

            if attempt >= self.retry.max_attempts {
                warn!(
                    backend = %name,
                    attempts = attempt,
                    points = pending.len(),
                    error = %error,
                    "Write failed after retries, moving points to the fallback log."
                );
                self.health.mark_failure(&name, &error.to_string());
                self.to_fallback(pending).await;
                return;
            }

            let delay = self.retry.delay(attempt - 1);
            debug!(attempt, delay = ?delay, error = %error, "Retrying write after backoff.");
            time::sleep(delay).await;
        }
    }

    async fn to_fallback(&self, points: Vec<Point>) {
        if points.is_empty() {
            return;
        }
        metrics::counter!("backend_writes_total", "outcome" => "fallback").increment(points.len() as u64);
        if let Err(e) = self.fallback.append(&points).await {
            error!(error = %e, points = points.len(), path = %self.fallback.path().display(), "Failed to write to the fallback log. Points lost.");
        }
    }

    /// Moves every buffered or in-flight point to the fallback log.
    pub async fn flush_to_fallback(&self) -> Result<AppendReport, FallbackError> {
        let mut points = std::mem::take(&mut *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner));
        points.extend(self.buffer.lock().unwrap_or_else(PoisonError::into_inner).drain_all());
        metrics::gauge!("persistence_buffer_depth").set(0.0);
        self.fallback.append(&points).await
    }

    /// Checks whether an unreachable backend is back, and replays the
    /// fallback log if it is. Returns the reachability after the probe.
    pub async fn probe(&self) -> bool {
        let name = self.backend.name().to_string();
        match self.backend.ping().await {
            Ok(()) => {
                if self.health.mark_success(&name) {
                    match self.resync().await {
                        Ok(report) => info!(?report, "Fallback log replayed after recovery."),
                        Err(e) => error!(error = %e, "Fallback replay after recovery failed."),
                    }
                }
                true
            }
            Err(e) => {
                debug!(backend = %name, error = %e, "Backend still unreachable.");
                self.health.mark_failure(&name, &e.to_string());
                false
            }
        }
    }

    /// Replays the fallback log to the backend. Points that fail transiently
    /// stay in the log; permanently rejected ones are dropped.
    #[instrument(skip(self))]
    pub async fn resync(&self) -> Result<ResyncReport, FallbackError> {
        let backend = &*self.backend;
        let batch_size = self.batch_size;
        let mut report = ResyncReport::default();
        let mut failure: Option<BackendError> = None;
        let (report_ref, failure_ref) = (&mut report, &mut failure);

        let remaining = self
            .fallback
            .replay(move |mut points| async move {
                while !points.is_empty() {
                    let rest = points.split_off(batch_size.min(points.len()));
                    let outcome = send_batch(backend, points).await;
                    report_ref.sent += outcome.written;
                    report_ref.dropped += outcome.dropped;
                    if let Some(e) = outcome.error {
                        let mut unsent = outcome.unsent;
                        unsent.extend(rest);
                        *failure_ref = Some(e);
                        return unsent;
                    }
                    points = rest;
                }
                Vec::new()
            })
            .await?;
        report.remaining = remaining;

        let name = self.backend.name().to_string();
        match &failure {
            Some(e) => {
                self.health.mark_failure(&name, &e.to_string());
                warn!(?report, error = %e, "Fallback replay stopped early, backend unavailable.");
            }
            None if report.sent > 0 || report.dropped > 0 => {
                self.health.mark_success(&name);
                info!(?report, "Fallback replay finished.");
            }
            None => debug!("Fallback log is empty."),
        }
        Ok(report)
    }

    /// Range query of one domain, unflattened back into trees, oldest first.
    pub async fn history(
        &self,
        domain: &str,
        range: Duration,
    ) -> Result<Vec<DomainSample>, BackendError> {
        let rows = self.backend.query(domain, range).await?;
        Ok(rows
            .into_iter()
            .map(|row| DomainSample {
                captured_at: row.time,
                tree: self.codec.unflatten_domain(domain, &row.fields),
            })
            .collect())
    }

    /// Queues a point for every domain whose sample is newer than the last
    /// one queued.
    pub async fn ingest(
        &self,
        snapshot: &MetricSnapshot,
        last_seen: &mut HashMap<String, DateTime<Utc>>,
    ) {
        for (domain, sample) in &snapshot.domains {
            if last_seen
                .get(domain)
                .is_some_and(|seen| *seen >= sample.captured_at)
            {
                continue;
            }
            last_seen.insert(domain.clone(), sample.captured_at);
            if let Some(point) = self.point_for(domain, sample) {
                self.write(point).await;
            }
        }
    }

    /// Follows published snapshots and queues their new domain samples.
    #[instrument(skip_all)]
    pub async fn follow(
        self: Arc<Self>,
        mut snapshots: watch::Receiver<Arc<MetricSnapshot>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("Persistence feeder started.");
        let mut last_seen = HashMap::new();
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = snapshots.borrow_and_update().clone();
                    self.ingest(&snapshot, &mut last_seen).await;
                }
            }
        }
        info!("Persistence feeder finished.");
    }

    /// The drain loop. On shutdown it keeps writing for up to `grace`, then
    /// moves whatever is left to the fallback log.
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>, grace: Duration) {
        info!(backend = %self.backend.name(), "Persistence drain started.");
        let mut probe = time::interval(self.probe_interval);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                _ = self.pending.notified() => {}
                _ = probe.tick() => {
                    if !self.health.is_reachable() {
                        self.probe().await;
                    }
                    continue;
                }
            }
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                _ = self.drain() => {}
            }
        }

        info!("Persistence drain received shutdown signal.");
        self.requeue_in_flight().await;
        if time::timeout(grace, self.drain()).await.is_err() {
            warn!(grace = ?grace, "Shutdown grace elapsed with writes still in flight.");
        }
        match self.flush_to_fallback().await {
            Ok(report) if report.appended > 0 => {
                info!(points = report.appended, "Unwritten points flushed to the fallback log.")
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to flush unwritten points on shutdown."),
        }
        info!("Persistence drain finished.");
    }
}
