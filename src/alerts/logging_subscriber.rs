//! A subscriber that logs every alert transition.

use super::{AlertEvent, AlertState};
use tokio::sync::{broadcast, watch};
use tracing::{error, info, instrument, warn};

fn log_event(event: &AlertEvent) {
    match event.new_state {
        AlertState::Critical => error!(
            rule = %event.rule,
            metric = %event.metric,
            value = event.value,
            from = %event.old_state,
            "Alert is CRITICAL"
        ),
        AlertState::Warning => warn!(
            rule = %event.rule,
            metric = %event.metric,
            value = event.value,
            from = %event.old_state,
            "Alert is WARNING"
        ),
        AlertState::Ok => info!(
            rule = %event.rule,
            metric = %event.metric,
            value = event.value,
            from = %event.old_state,
            "Alert recovered to OK"
        ),
    }
}

/// Logs alert events until shutdown or until the channel closes.
#[instrument(skip_all)]
pub async fn run(
    mut alert_rx: broadcast::Receiver<AlertEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!("Alert logging subscriber started.");
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            received = alert_rx.recv() => match received {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Alert logging subscriber lagged behind and missed {} events.", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Alert channel closed. Logging subscriber shutting down.");
                    break;
                }
            }
        }
    }
}
