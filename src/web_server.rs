use crate::broker::Broker;
use crate::connection::{Connection, Outbound};
use crate::metrics::Metrics;
use crate::protocol::ServerFrame;
use crate::router::MessageRouter;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::header,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<MessageRouter>,
    pub broker: Arc<dyn Broker>,
    pub metrics: Arc<Metrics>,
    pub idle_timeout: Duration,
    pub ping_interval: Duration,
    /// Frames queued per connection before a non-reading client is dropped
    pub outbound_capacity: usize,
}

pub fn create_router(state: AppState, ws_path: &str) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route(ws_path, get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub broker_connected: bool,
    pub connections: i64,
    pub users: usize,
    pub topics: usize,
    pub subscriptions: usize,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    let stats = state.router.fanout().stats().await;
    let broker_connected = state.broker.is_connected();

    Json(HealthStatus {
        status: if broker_connected { "ok" } else { "degraded" }.to_string(),
        broker_connected,
        connections: state.metrics.active_connections.get(),
        users: state.router.registry().len(),
        topics: stats.topics,
        subscriptions: stats.subscriptions,
    })
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (ws_tx, ws_rx) = socket.split();
    run_session(ws_tx, ws_rx, state).await;
}

/// Drive one client session until the client leaves, errors, idles out or is closed by
/// the relay, then deregister it everywhere.
///
/// Frames are handled one at a time in receipt order. Outbound frames go through the
/// connection's queue and a separate writer task, which also sends keepalive pings.
pub async fn run_session<W, R, E>(mut ws_tx: W, mut ws_rx: R, state: AppState)
where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display + Send,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let (connection, mut outbound) = Connection::with_capacity(state.outbound_capacity);
    let id = connection.id();
    state.metrics.active_connections.inc();
    info!("Client connected: {}", id);

    let ping_interval = state.ping_interval;
    let mut writer = tokio::spawn(async move {
        let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let message = tokio::select! {
                item = outbound.recv() => match item {
                    Some(Outbound::Frame(frame)) => match frame.to_json() {
                        Ok(json) => Message::Text(json),
                        Err(e) => {
                            warn!("Dropping unencodable frame: {}", e);
                            continue;
                        }
                    },
                    Some(Outbound::Close) | None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                },
                _ = ping.tick() => Message::Ping(Vec::new()),
            };

            if let Err(e) = ws_tx.send(message).await {
                debug!("WebSocket write failed: {}", e);
                break;
            }
        }
    });

    loop {
        let next = tokio::select! {
            next = tokio::time::timeout(state.idle_timeout, ws_rx.next()) => next,
            // Writer stopped: the relay closed the connection or the socket broke.
            _ = &mut writer => break,
            // Closed by the relay, possibly while the writer is stuck on a stalled client.
            _ = connection.closed() => break,
        };

        match next {
            Err(_) => {
                info!("Closing idle connection {}", id);
                connection.close();
                break;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Err(e))) => {
                warn!("WebSocket error on connection {}: {}", id, e);
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                state.router.handle_frame(&connection, &text).await;
            }
            Ok(Some(Ok(Message::Binary(data)))) => match String::from_utf8(data) {
                Ok(text) => state.router.handle_frame(&connection, &text).await,
                Err(_) => {
                    let _ = connection.send(ServerFrame::error("Invalid JSON message."));
                }
            },
            // Ping/pong only refresh the idle timer.
            Ok(Some(Ok(_))) => {}
        }

        if !connection.is_open() {
            break;
        }
    }

    connection.close();
    state.router.registry().unregister(&connection);
    let left = state.router.fanout().unsubscribe_all(id).await;
    if !writer.is_finished() {
        // Let a pending Close frame flush before dropping the socket.
        let _ = tokio::time::timeout(Duration::from_secs(1), &mut writer).await;
        writer.abort();
    }
    state.metrics.active_connections.dec();

    let duration = chrono::Utc::now() - connection.connected_at();
    info!(
        "Client disconnected: {} ({}) after {}s, left {} topic(s)",
        id,
        connection.identity().as_deref().unwrap_or("anonymous"),
        duration.num_seconds(),
        left
    );
}
