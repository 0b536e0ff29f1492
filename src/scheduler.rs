//! Per-provider scheduling and snapshot publication.
//!
//! Every registered provider gets its own task with its own interval. A cycle
//! runs the blocking sampler on tokio's blocking pool under the provider's
//! timeout, so a slow or stuck provider never holds up the others. Ticks that
//! are missed while a cycle runs long are skipped, not queued.
//!
//! After each successful record the scheduler pokes a shared [`Notify`] that
//! the snapshot publisher waits on.

use crate::core::MetricSnapshot;
use crate::providers::ProviderSampleError;
use crate::registry::{DomainEntry, ProviderRegistry, ProviderSettings};
use crate::task_manager::TaskManager;
use chrono::Utc;
use futures::future::join_all;
use std::sync::{Arc, TryLockError};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, info, instrument, trace, warn};

/// What a single sampling cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Recorded,
    Failed(ProviderSampleError),
    /// The previous cycle's sampler is still running.
    Skipped,
}

/// Drives every registered provider on its own cadence.
#[derive(Clone)]
pub struct Scheduler {
    registry: Arc<ProviderRegistry>,
    updated: Arc<Notify>,
}

impl Scheduler {
    pub fn new(registry: Arc<ProviderRegistry>, updated: Arc<Notify>) -> Self {
        Self { registry, updated }
    }

    /// Spawns one task per registered provider.
    pub fn start(&self, task_manager: &TaskManager) {
        for domain in self.registry.domains() {
            let Some(entry) = self.registry.entry(&domain) else {
                continue;
            };
            let registry = self.registry.clone();
            let updated = self.updated.clone();
            let shutdown_rx = task_manager.get_shutdown_rx();
            task_manager.spawn(
                format!("Provider-{}", domain),
                run_provider(registry, entry, updated, shutdown_rx),
            );
        }
    }

    /// Runs one cycle of every provider concurrently and returns the merged
    /// result.
    pub async fn sample_once(&self) -> MetricSnapshot {
        let entries: Vec<Arc<DomainEntry>> = self
            .registry
            .domains()
            .iter()
            .filter_map(|domain| self.registry.entry(domain))
            .collect();
        let outcomes =
            join_all(entries.iter().map(|entry| run_cycle(&self.registry, entry.clone()))).await;
        for (entry, outcome) in entries.iter().zip(outcomes) {
            if let CycleOutcome::Failed(e) = outcome {
                warn!(domain = %entry.name(), error = %e, "Provider failed during one-shot sample");
            }
        }
        self.registry.snapshot()
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

#[instrument(skip_all, fields(domain = %entry.name()))]
async fn run_provider(
    registry: Arc<ProviderRegistry>,
    entry: Arc<DomainEntry>,
    updated: Arc<Notify>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut settings_rx = entry.subscribe_settings();
    let mut settings: ProviderSettings = settings_rx.borrow_and_update().clone();
    let mut interval = ticker(settings.interval);
    info!(interval = ?settings.interval, "Provider task started.");

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                debug!("Provider task received shutdown signal.");
                break;
            }
            Ok(()) = settings_rx.changed() => {
                let new = settings_rx.borrow_and_update().clone();
                if new.interval != settings.interval {
                    info!(old = ?settings.interval, new = ?new.interval, "Provider interval changed.");
                    interval = ticker(new.interval);
                }
                settings = new;
            }
            _ = interval.tick() => {
                if run_cycle(&registry, entry.clone()).await == CycleOutcome::Recorded {
                    updated.notify_one();
                }
            }
        }
    }
    info!("Provider task finished.");
}

/// Samples one provider once and records the outcome in the registry.
pub async fn run_cycle(registry: &ProviderRegistry, entry: Arc<DomainEntry>) -> CycleOutcome {
    let domain = entry.name().to_string();
    let timeout = entry.settings().timeout;
    let sampler = entry.sampler();
    let started = Instant::now();

    let handle = tokio::task::spawn_blocking(move || {
        let mut guard = match sampler.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        let captured_at = Utc::now();
        Some(guard.sample().map(|tree| (tree, captured_at)))
    });

    let result = match time::timeout(timeout, handle).await {
        Err(_) => Err(ProviderSampleError::Timeout(timeout)),
        Ok(Err(join_err)) if join_err.is_panic() => Err(ProviderSampleError::Panicked),
        Ok(Err(join_err)) => Err(ProviderSampleError::Sample(join_err.to_string())),
        Ok(Ok(None)) => {
            trace!(domain = %domain, "Previous sample still in flight, skipping tick.");
            metrics::counter!("provider_samples_total", "domain" => domain.clone(), "outcome" => "skipped")
                .increment(1);
            return CycleOutcome::Skipped;
        }
        Ok(Ok(Some(result))) => result,
    };
    metrics::histogram!("provider_sample_duration_seconds", "domain" => domain.clone())
        .record(started.elapsed().as_secs_f64());

    match result {
        Ok((tree, captured_at)) => match registry.record(&domain, tree, captured_at) {
            Ok(()) => {
                metrics::counter!("provider_samples_total", "domain" => domain, "outcome" => "ok")
                    .increment(1);
                CycleOutcome::Recorded
            }
            Err(e) => {
                warn!(domain = %domain, error = %e, "Discarding sample.");
                CycleOutcome::Skipped
            }
        },
        Err(e) => {
            metrics::counter!("provider_samples_total", "domain" => domain.clone(), "outcome" => "error")
                .increment(1);
            // Only an unknown domain can fail here, and the entry came from the registry.
            let _ = registry.record_failure(&domain, e.clone());
            CycleOutcome::Failed(e)
        }
    }
}
