//! Push delivery to live consumers.
//!
//! Every consumer owns two small bounded queues. Items that a newer item
//! makes worthless (snapshots) go to a latest-value-wins queue: when it is
//! full, the oldest queued item is replaced, so a consumer that falls behind
//! resumes with the latest value rather than a backlog. Everything else
//! (alert transitions) goes to an event queue that never overwrites; a
//! consumer that lets it fill up is disconnected instead of silently missing
//! events. Publishing never waits. Consumers that went away are pruned on
//! the next publish.

use crate::alerts::AlertEvent;
use crate::core::{LiveUpdate, MetricSnapshot};
use async_channel::{Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, trace, warn};

/// How an item is queued for a consumer.
pub trait Delivery {
    /// Whether a newer item replaces this one when the consumer is behind.
    fn is_replaceable(&self) -> bool;
}

impl Delivery for LiveUpdate {
    fn is_replaceable(&self) -> bool {
        matches!(self, LiveUpdate::Snapshot(_))
    }
}

struct Consumer<T> {
    id: u64,
    latest: Sender<T>,
    events: Sender<T>,
}

impl<T> Consumer<T> {
    fn close(&self) {
        self.latest.close();
        self.events.close();
    }
}

/// Fan-out of `T` to any number of consumers.
pub struct FanoutHub<T> {
    consumers: Mutex<Vec<Consumer<T>>>,
    capacity: usize,
    event_capacity: usize,
    next_id: AtomicU64,
}

/// The receiving end held by one consumer. Dropping it unsubscribes.
pub struct Subscription<T> {
    id: u64,
    latest: Receiver<T>,
    events: Receiver<T>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next item, events first; `None` once the hub is gone
    /// or has disconnected this consumer.
    pub async fn recv(&self) -> Option<T> {
        if let Ok(event) = self.events.try_recv() {
            return Some(event);
        }
        tokio::select! {
            biased;
            Ok(event) = self.events.recv() => Some(event),
            Ok(item) = self.latest.recv() => Some(item),
            else => None,
        }
    }

    /// Returns a queued item without waiting, events first.
    pub fn try_recv(&self) -> Option<T> {
        self.events.try_recv().or_else(|_| self.latest.try_recv()).ok()
    }

    /// Items currently queued for this consumer.
    pub fn pending(&self) -> usize {
        self.events.len() + self.latest.len()
    }
}

impl<T: Clone + Delivery> FanoutHub<T> {
    /// `capacity` bounds each consumer's replaceable items, `event_capacity`
    /// its undelivered events.
    pub fn new(capacity: usize, event_capacity: usize) -> Self {
        Self {
            consumers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            event_capacity: event_capacity.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (latest_tx, latest_rx) = async_channel::bounded(self.capacity);
        let (events_tx, events_rx) = async_channel::bounded(self.event_capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut consumers = self.consumers.lock().unwrap_or_else(PoisonError::into_inner);
        consumers.push(Consumer {
            id,
            latest: latest_tx,
            events: events_tx,
        });
        metrics::gauge!("fanout_consumers").set(consumers.len() as f64);
        debug!(consumer = id, total = consumers.len(), "Consumer subscribed.");
        Subscription {
            id,
            latest: latest_rx,
            events: events_rx,
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Offers `item` to every consumer and returns how many received it.
    pub fn publish(&self, item: T) -> usize {
        let replaceable = item.is_replaceable();
        let mut consumers = self.consumers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut delivered = 0;
        consumers.retain(|consumer| {
            let id = consumer.id;
            if consumer.latest.is_closed() || consumer.events.is_closed() {
                debug!(consumer = id, "Consumer went away, pruning.");
                consumer.close();
                return false;
            }
            if replaceable {
                return match consumer.latest.force_send(item.clone()) {
                    Ok(replaced) => {
                        if replaced.is_some() {
                            trace!(consumer = id, "Consumer behind, replaced its oldest queued item.");
                            metrics::counter!("fanout_replaced_total").increment(1);
                        }
                        delivered += 1;
                        true
                    }
                    Err(_) => false,
                };
            }
            match consumer.events.try_send(item.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!(consumer = id, "Consumer stopped reading events, disconnecting it.");
                    metrics::counter!("fanout_disconnected_total").increment(1);
                    consumer.close();
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
        metrics::gauge!("fanout_consumers").set(consumers.len() as f64);
        delivered
    }
}

/// Forwards published snapshots and alert events to the hub.
#[instrument(skip_all)]
pub async fn pump(
    hub: Arc<FanoutHub<LiveUpdate>>,
    mut snapshots: watch::Receiver<Arc<MetricSnapshot>>,
    mut alerts: broadcast::Receiver<AlertEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!("Fan-out pump started.");
    let mut alerts_open = true;
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                hub.publish(LiveUpdate::Snapshot(snapshot));
            }
            received = alerts.recv(), if alerts_open => match received {
                Ok(event) => {
                    hub.publish(LiveUpdate::Alert(event));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Fan-out pump missed {} alert events.", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Alert channel closed, forwarding snapshots only.");
                    alerts_open = false;
                }
            }
        }
    }
    info!("Fan-out pump finished.");
}
