//! WebSocket server handler using Axum.

use crate::api;
use crate::client::ClientState;
use crate::gateway::Gateway;
use crate::protocol::ServerMessage;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, timeout};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// How long queued frames may take to flush once a connection ends.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state.
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

/// Create the HTTP router: WebSocket endpoint, health check and push ingress.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/push-event", post(api::push_event_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let gateway = &state.gateway;
    Json(json!({
        "status": "ok",
        "clients": gateway.connections().client_count(),
        "subscriptions": gateway.registry().subscription_count(),
        "channels": gateway.registry().channel_count(),
        "topics": gateway.bridge().topic_count(),
    }))
}

/// WebSocket upgrade handler. The handshake token is checked before upgrading.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let token = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    if let Err(e) = state.gateway.verifier().verify_bearer(token) {
        counter!("gateway_handshake_rejected_total").increment(1);
        warn!("Rejected WebSocket handshake: {}", e);
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let gateway = state.gateway.clone();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (client, mut rx) = ClientState::channel();
    let client = Arc::new(client);
    let client_id = client.id;

    // Forward queued frames to the socket; a close frame ends the task.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    if gateway.connect(client.clone()).is_err() {
        flush(send_task).await;
        return;
    }

    // Ping interval for keepalive
    let mut ping_interval = interval(Duration::from_secs(30));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = client.closed() => {
                debug!("Client {} closed by server", client_id);
                break;
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        gateway.handle_text(&client, text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => gateway.handle_text(&client, text).await,
                        Err(_) => {
                            gateway.connections().touch(&client_id);
                            let _ = client.send(&ServerMessage::error(
                                "Malformed message: binary frame is not UTF-8",
                            ));
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        gateway.connections().touch(&client_id);
                        let _ = client.tx.try_send(Message::Pong(data));
                    }
                    Some(Ok(Message::Pong(_))) => {
                        gateway.connections().touch(&client_id);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", client_id, e);
                        break;
                    }
                }
            }

            _ = ping_interval.tick() => {
                if client.tx.try_send(Message::Ping(Vec::new().into())).is_err() {
                    debug!("Outbound buffer of {} is full, skipping ping", client_id);
                }
            }
        }
    }

    gateway.disconnect(&client_id);
    client.close();
    flush(send_task).await;
    counter!("gateway_disconnections_total").increment(1);
    info!("Connection {} closed", client_id);
}

/// Wait for the send task to drain, up to [`FLUSH_TIMEOUT`].
async fn flush(mut send_task: tokio::task::JoinHandle<()>) {
    if timeout(FLUSH_TIMEOUT, &mut send_task).await.is_err() {
        send_task.abort();
    }
}
