//! WebSocket push of pin snapshots.
//!
//! A single publisher samples the panel on a fixed interval and broadcasts
//! the serialized snapshot; each connected client gets the current snapshot
//! on connect and every broadcast after that.

use crate::panel::Panel;
use crate::web::handlers::pins_body;
use crate::web::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::{
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, error, info, warn};

/// A connected WebSocket client.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: String,
    pub connected_at: SystemTime,
}

/// WebSocket upgrade handler.
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let Some(permit) = state.reserve_connection() else {
        warn!(
            "Refusing WebSocket client: all {} connections in use",
            state.config.max_websocket_connections
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "too many WebSocket clients").into_response();
    };
    ws.on_upgrade(move |socket| async move {
        handle_websocket(socket, state).await;
        drop(permit);
    })
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: AppState) {
    let client_id = uuid::Uuid::new_v4().to_string();
    info!("WebSocket client connected: {}", client_id);

    state.clients.write().await.insert(
        client_id.clone(),
        Client {
            id: client_id.clone(),
            connected_at: SystemTime::now(),
        },
    );

    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.snapshots.subscribe();

    let initial = pins_body(&state.panel).await.to_string();
    if let Err(e) = sender.send(Message::Text(initial)).await {
        warn!("Failed to send initial snapshot to {}: {}", client_id, e);
    }

    let client_id_recv = client_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(Message::Text(text)) => {
                    debug!("Ignoring message from {}: {}", client_id_recv, text);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("WebSocket error for client {}: {}", client_id_recv, e);
                    break;
                }
            }
        }
    });

    let client_id_send = client_id.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(snapshot) => {
                    if let Err(e) = sender.send(Message::Text(snapshot)).await {
                        debug!("Failed to send to client {}: {}", client_id_send, e);
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Client {} skipped {} snapshots", client_id_send, skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::select! {
        _ = &mut recv_task => {
            send_task.abort();
            debug!("Receive task completed for client {}", client_id);
        }
        _ = &mut send_task => {
            recv_task.abort();
            debug!("Send task completed for client {}", client_id);
        }
    }

    state.clients.write().await.remove(&client_id);
    info!("WebSocket client disconnected: {}", client_id);
}

/// Spawn the task broadcasting a snapshot every `interval`.
///
/// Nothing is sampled while no client is subscribed. The task ends when the
/// channel closes or the handle is aborted.
pub fn spawn_publisher(
    panel: Arc<Panel>,
    snapshots: broadcast::Sender<String>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = IntervalStream::new(tokio::time::interval(interval));
        while ticks.next().await.is_some() {
            if snapshots.receiver_count() == 0 {
                continue;
            }
            let body = pins_body(&panel).await;
            match serde_json::to_string(&body) {
                Ok(json) => {
                    if snapshots.send(json).is_err() {
                        debug!("No WebSocket subscribers left");
                    }
                }
                Err(e) => error!("Failed to serialize snapshot: {}", e),
            }
        }
    })
}
