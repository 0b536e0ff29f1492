//! HTTP and WebSocket surface for live consumers.
//!
//! - `GET /api/snapshot`: the current merged snapshot.
//! - `GET /api/status`: backend reachability, buffer depth and failing providers.
//! - `GET /api/history/{domain}?minutes=N`: a range query against the backend,
//!   unflattened back into trees.
//! - `GET /ws`: a stream of JSON messages tagged `"type": "snapshot"` or
//!   `"type": "alert"`. Each connection is one fan-out consumer, so a slow
//!   browser only ever misses intermediate snapshots.

use crate::core::{AgentStatus, LiveUpdate, MetricSnapshot};
use crate::fanout::FanoutHub;
use crate::persistence::{BackendError, PersistenceClient};
use crate::registry::ProviderRegistry;
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// Assembles [`AgentStatus`] from the registry and the persistence client.
#[derive(Clone)]
pub struct StatusSource {
    registry: Arc<ProviderRegistry>,
    persistence: Option<Arc<PersistenceClient>>,
}

impl StatusSource {
    pub fn new(registry: Arc<ProviderRegistry>, persistence: Option<Arc<PersistenceClient>>) -> Self {
        Self {
            registry,
            persistence,
        }
    }

    pub fn status(&self) -> AgentStatus {
        let (backend_reachable, buffered_points, fallback_pending) = match &self.persistence {
            Some(client) => (
                client.is_reachable(),
                client.buffered(),
                client.fallback_pending(),
            ),
            None => (false, 0, 0),
        };
        AgentStatus {
            backend_reachable,
            buffered_points,
            fallback_pending,
            failing_providers: self.registry.failing_providers(),
        }
    }
}

#[derive(Clone)]
struct WebState {
    snapshots: watch::Receiver<Arc<MetricSnapshot>>,
    status: StatusSource,
    hub: Arc<FanoutHub<LiveUpdate>>,
    persistence: Option<Arc<PersistenceClient>>,
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    minutes: Option<u64>,
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

async fn snapshot(State(state): State<WebState>) -> Json<Arc<MetricSnapshot>> {
    Json(state.snapshots.borrow().clone())
}

async fn status(State(state): State<WebState>) -> Json<AgentStatus> {
    Json(state.status.status())
}

async fn history(
    State(state): State<WebState>,
    Path(domain): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(client) = &state.persistence else {
        return Err(ApiError(
            StatusCode::SERVICE_UNAVAILABLE,
            "persistence is disabled".to_string(),
        ));
    };
    let minutes = params.minutes.unwrap_or(60).clamp(1, 60 * 24 * 30);
    match client.history(&domain, Duration::from_secs(minutes * 60)).await {
        Ok(samples) => Ok(Json(samples)),
        Err(BackendError::Transient(e)) => Err(ApiError(StatusCode::SERVICE_UNAVAILABLE, e)),
        Err(e) => Err(ApiError(StatusCode::BAD_GATEWAY, e.to_string())),
    }
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<WebState>) -> Response {
    ws.on_upgrade(move |socket| stream_updates(socket, state))
}

async fn stream_updates(socket: WebSocket, state: WebState) {
    let subscription = state.hub.subscribe();
    let consumer = subscription.id();
    debug!(consumer, "WebSocket consumer connected.");
    let (mut sender, mut receiver) = socket.split();

    // Start every consumer with the current snapshot.
    let first = LiveUpdate::Snapshot(state.snapshots.borrow().clone());
    if send_update(&mut sender, &first).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            update = subscription.recv() => {
                let Some(update) = update else { break };
                if send_update(&mut sender, &update).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    trace!(consumer, error = %e, "WebSocket read error.");
                    break;
                }
            }
        }
    }
    debug!(consumer, "WebSocket consumer disconnected.");
}

async fn send_update<S>(sender: &mut S, update: &LiveUpdate) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    let text = match serde_json::to_string(update) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Failed to encode live update.");
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

/// The consumer-facing web server.
pub struct WebServer {
    listener: TcpListener,
    state: WebState,
    shutdown_rx: watch::Receiver<bool>,
}

impl WebServer {
    /// Binds the listener. Returns the server and the bound address.
    pub async fn bind(
        addr: SocketAddr,
        snapshots: watch::Receiver<Arc<MetricSnapshot>>,
        status: StatusSource,
        hub: Arc<FanoutHub<LiveUpdate>>,
        persistence: Option<Arc<PersistenceClient>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(Self, SocketAddr)> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        Ok((
            Self {
                listener,
                state: WebState {
                    snapshots,
                    status,
                    hub,
                    persistence,
                },
                shutdown_rx,
            },
            local,
        ))
    }

    fn router(state: WebState) -> Router {
        Router::new()
            .route("/api/snapshot", get(snapshot))
            .route("/api/status", get(status))
            .route("/api/history/{domain}", get(history))
            .route("/ws", get(ws_upgrade))
            .with_state(state)
    }

    /// Returns a future that runs the server until a shutdown signal is received.
    pub fn run(mut self) -> impl Future<Output = ()> {
        let app = Self::router(self.state.clone());
        async move {
            info!(address = ?self.listener.local_addr().ok(), "Web server started.");
            tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => {
                    trace!("Web server received shutdown signal.");
                }
                result = axum::serve(self.listener, app.into_make_service()) => {
                    if let Err(e) = result {
                        error!("Web server error: {}", e);
                    }
                }
            }
            info!("Web server finished.");
        }
    }
}
