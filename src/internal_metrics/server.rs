//! Prometheus scrape endpoint for the agent's own metrics.

use axum::{http::StatusCode, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::future::Future;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error};

/// Serves `GET /metrics` in the Prometheus text format and a bare
/// `GET /healthz` for liveness probes.
pub struct MetricsServer {
    listener: TcpListener,
    handle: PrometheusHandle,
    shutdown_rx: watch::Receiver<bool>,
}

impl MetricsServer {
    pub fn new(
        listener: TcpListener,
        handle: PrometheusHandle,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            listener,
            handle,
            shutdown_rx,
        }
    }

    fn router(handle: PrometheusHandle) -> Router {
        Router::new()
            .route("/metrics", get(move || std::future::ready(handle.render())))
            .route("/healthz", get(|| async { StatusCode::NO_CONTENT }))
    }

    /// Serves until the shutdown signal; in-flight scrapes finish first.
    pub fn run(self) -> impl Future<Output = ()> {
        let Self {
            listener,
            handle,
            mut shutdown_rx,
        } = self;
        let app = Self::router(handle);

        async move {
            let shutdown = async move {
                while !*shutdown_rx.borrow_and_update() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                debug!("Metrics server received shutdown signal.");
            };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
                error!(error = %e, "Metrics server failed.");
            }
            debug!("Metrics server finished.");
        }
    }
}
