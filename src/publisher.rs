//! Coalesced publication of merged snapshots.
//!
//! Provider tasks poke a shared [`Notify`] after every recorded sample. The
//! publisher waits on it, lets a short window pass so that domains updating
//! at nearly the same instant fold together, and then publishes one merged
//! snapshot. Downstream consumers hold `watch` receivers and always see the
//! newest snapshot only.

use crate::core::MetricSnapshot;
use crate::registry::ProviderRegistry;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time;
use tracing::{info, instrument, trace};

/// Publishes coalesced merged snapshots on a watch channel.
pub struct SnapshotPublisher {
    registry: Arc<ProviderRegistry>,
    updated: Arc<Notify>,
    coalesce: Duration,
    tx: watch::Sender<Arc<MetricSnapshot>>,
}

impl SnapshotPublisher {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        updated: Arc<Notify>,
        coalesce: Duration,
    ) -> (Self, watch::Receiver<Arc<MetricSnapshot>>) {
        let (tx, rx) = watch::channel(Arc::new(registry.snapshot()));
        (
            Self {
                registry,
                updated,
                coalesce,
                tx,
            },
            rx,
        )
    }

    /// Builds and publishes a snapshot right away.
    pub fn publish_now(&self) {
        let snapshot = self.registry.snapshot();
        trace!(domains = snapshot.domains.len(), "Publishing merged snapshot");
        self.tx.send_replace(Arc::new(snapshot));
        metrics::counter!("snapshots_published_total").increment(1);
    }

    #[instrument(skip_all)]
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!("Snapshot publisher started.");
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    info!("Snapshot publisher received shutdown signal.");
                    break;
                }
                _ = self.updated.notified() => {
                    if !self.coalesce.is_zero() {
                        time::sleep(self.coalesce).await;
                        // Samples recorded during the window are in this snapshot.
                        let _ = self.updated.notified().now_or_never();
                    }
                    self.publish_now();
                }
            }
        }
        info!("Snapshot publisher finished.");
    }
}
