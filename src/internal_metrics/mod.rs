//! # Internal Metrics Module
//!
//! Self-metrics of the agent, exported in the Prometheus exposition format.
//!
//! Components record through the `metrics` facade macros at their call
//! sites. When `metrics.enabled` is set, [`MetricsBuilder`] installs the
//! Prometheus recorder, describes every metric the agent emits and hands
//! back a [`MetricsServer`] serving `/metrics`. With metrics disabled the
//! facade's default no-op recorder swallows everything.

use crate::config::MetricsConfig;
use crate::internal_metrics::server::MetricsServer;
use metrics::Unit;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

pub mod server;

/// Registers descriptions for every metric with the installed recorder.
pub fn describe_metrics() {
    metrics::describe_counter!("provider_samples_total", Unit::Count, "Provider sampling cycles, labeled by domain and outcome (ok, error, skipped).");
    metrics::describe_histogram!("provider_sample_duration_seconds", Unit::Seconds, "Time spent in one provider sampling call, labeled by domain.");
    metrics::describe_counter!("snapshots_published_total", Unit::Count, "Merged snapshots handed to downstream consumers.");
    metrics::describe_counter!("codec_conflicts_total", Unit::Count, "Leaves left out of a flattened record because their kind changed, labeled by domain.");
    metrics::describe_counter!("backend_writes_total", Unit::Count, "Points by write outcome (ok, transient, schema_conflict, rejected, fallback).");
    metrics::describe_counter!("schema_conflicts_total", Unit::Count, "Points dropped because the backend reported a field type conflict.");
    metrics::describe_gauge!("backend_reachable", Unit::Count, "Whether the last backend interaction succeeded (1) or failed (0).");
    metrics::describe_gauge!("persistence_buffer_depth", Unit::Count, "Points waiting in the in-memory persistence buffer.");
    metrics::describe_counter!("persistence_dropped_total", Unit::Count, "Points evicted from a full buffer under the drop_oldest policy.");
    metrics::describe_counter!("fallback_records_total", Unit::Count, "Points appended to the local fallback log.");
    metrics::describe_counter!("fallback_refused_total", Unit::Count, "Points refused because the fallback log was at capacity.");
    metrics::describe_counter!("alert_transitions_total", Unit::Count, "Alert state transitions, labeled by rule and new state.");
    metrics::describe_gauge!("fanout_consumers", Unit::Count, "Live consumers currently subscribed.");
    metrics::describe_counter!("fanout_replaced_total", Unit::Count, "Queued updates replaced because a consumer had not caught up.");
    metrics::describe_counter!("fanout_disconnected_total", Unit::Count, "Consumers disconnected because their alert queue filled up.");
    metrics::describe_counter!("history_records_total", Unit::Count, "Snapshots appended to the history log.");
    metrics::describe_counter!("history_errors_total", Unit::Count, "Failed history log appends.");
}

/// Builder for the metrics system.
///
/// Installs the `PrometheusRecorder` and creates the `MetricsServer`.
pub struct MetricsBuilder {
    config: MetricsConfig,
}

impl MetricsBuilder {
    pub fn new(config: MetricsConfig) -> Self {
        Self { config }
    }

    /// Returns the server and its bound address, or `None` when metrics are
    /// disabled or the exporter could not be set up.
    pub fn build(self, shutdown_rx: watch::Receiver<bool>) -> Option<(MetricsServer, SocketAddr)> {
        if !self.config.enabled {
            return None;
        }

        let recorder = match PrometheusBuilder::new().set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
        ) {
            Ok(builder) => builder.build_recorder(),
            Err(e) => {
                error!("Failed to configure Prometheus recorder: {}", e);
                return None;
            }
        };
        let handle = recorder.handle();

        // Bind before installing the recorder so a busy port leaves the
        // facade untouched.
        let listener = match std::net::TcpListener::bind(self.config.listen_address) {
            Ok(listener) => listener,
            Err(e) => {
                error!(
                    "Failed to bind metrics server to {}: {}",
                    self.config.listen_address, e
                );
                return None;
            }
        };
        let listener = match listener
            .set_nonblocking(true)
            .and_then(|_| TcpListener::from_std(listener))
        {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to prepare metrics listener: {}", e);
                return None;
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!("Failed to get local address for metrics server: {}", e);
                return None;
            }
        };

        if let Err(e) = metrics::set_global_recorder(recorder) {
            error!("Failed to install Prometheus recorder: {}", e);
            return None;
        }
        describe_metrics();
        info!(address = %addr, "Prometheus metrics enabled.");

        Some((MetricsServer::new(listener, handle, shutdown_rx), addr))
    }
}
