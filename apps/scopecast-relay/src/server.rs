use std::borrow::Cow;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use scopecast_proto::{PeerId, RoutingHeader};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::registry::{Outbound, PeerRegistry, PeerSnapshot};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to read local address")]
    LocalAddr(#[source] io::Error),
    #[error("server exited with error")]
    Serve(#[source] io::Error),
}

struct AppState {
    registry: PeerRegistry,
    metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    live_peers: usize,
    peers: Vec<PeerSnapshot>,
}

/// A bound but not yet serving relay.
pub struct Relay {
    listener: TcpListener,
    state: Arc<AppState>,
}

impl Relay {
    /// Bind the listener. Pass the Prometheus handle to expose `/metrics`.
    pub async fn bind(
        config: &RelayConfig,
        metrics: Option<PrometheusHandle>,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: config.listen_addr,
                source,
            })?;
        Ok(Self {
            listener,
            state: Arc::new(AppState {
                registry: PeerRegistry::new(config),
                metrics,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        self.listener.local_addr().map_err(RelayError::LocalAddr)
    }

    pub fn registry(&self) -> PeerRegistry {
        self.state.registry.clone()
    }

    /// Serve until `shutdown` resolves. The keepalive task runs for the
    /// lifetime of the server.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let keepalive = self.state.registry.spawn_keepalive();
        let router = router(Arc::clone(&self.state));
        let result = axum::serve(self.listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(RelayError::Serve);
        keepalive.abort();
        result
    }
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/debug/stats", get(stats_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let peers = state.registry.snapshot();
    Json(StatsResponse {
        live_peers: peers.len(),
        peers,
    })
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let peer = match state.registry.register() {
        Ok(peer) => peer,
        Err(err) => {
            warn!(error = %err, "failed to register connection");
            return;
        }
    };
    let peer_id = peer.id().clone();
    counter!("scopecast_relay_connections_opened_total", 1);
    info!(peer = %peer_id, live = state.registry.len(), "peer connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_peer = Arc::clone(&peer);
    let mut writer = tokio::spawn(async move {
        while let Some(outbound) = writer_peer.queue().pop().await {
            let (message, last) = match outbound {
                Outbound::Frame(text) => (Message::Text(text.to_string()), false),
                Outbound::Ping => (Message::Ping(Vec::new()), false),
                Outbound::Close { code, reason } => (
                    Message::Close(Some(CloseFrame {
                        code,
                        reason: Cow::Owned(reason),
                    })),
                    true,
                ),
            };
            if ws_tx.send(message).await.is_err() || last {
                break;
            }
        }
        debug!(peer = %writer_peer.id(), "writer task finished");
    });

    loop {
        tokio::select! {
            _ = &mut writer => break,
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    peer.touch();
                    relay(&state, &peer_id, text);
                }
                Some(Ok(Message::Binary(bytes))) => {
                    peer.touch();
                    match String::from_utf8(bytes) {
                        Ok(text) => relay(&state, &peer_id, text),
                        Err(_) => reject(&peer_id, "binary frame is not UTF-8"),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(
                        peer = %peer_id,
                        reason = ?frame.map(|f| f.reason.to_string()),
                        "peer closed websocket"
                    );
                    break;
                }
                Some(Ok(_)) => peer.touch(),
                Some(Err(err)) => {
                    debug!(peer = %peer_id, error = %err, "error receiving frame");
                    break;
                }
                None => break,
            },
        }
    }

    state.registry.unregister(&peer_id);
    writer.abort();
    counter!("scopecast_relay_connections_closed_total", 1);
    info!(peer = %peer_id, live = state.registry.len(), "peer disconnected");
}

fn relay(state: &AppState, from: &PeerId, text: String) {
    let header = match RoutingHeader::parse(&text) {
        Ok(header) => header,
        Err(err) => {
            reject(from, &err.to_string());
            return;
        }
    };
    let outcome = state.registry.route(from, &header, Arc::from(text));
    debug!(
        from = %from,
        kind = %header.kind,
        target = %header.target,
        delivered = outcome.delivered,
        "relayed envelope"
    );
}

fn reject(from: &PeerId, reason: &str) {
    counter!(
        "scopecast_relay_envelopes_dropped_total",
        1,
        "reason" => "unparseable"
    );
    warn!(peer = %from, reason, "dropping unparseable envelope");
}
