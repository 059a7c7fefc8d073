//! Dashboard websocket.
//!
//! Every connected client receives each throttled `{deviceId, data}` update
//! published on the [`crate::gateway::UpdateHub`]. Inbound frames other than
//! close are ignored. A client that falls behind skips the missed updates
//! rather than stalling the hub.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::AppState;

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(upgrade))
}

async fn upgrade(ws: WebSocketUpgrade, State(service): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| stream_updates(socket, service))
}

async fn stream_updates(mut socket: WebSocket, service: AppState) {
    // ---
    let client_id = Uuid::new_v4();
    let mut updates = service.hub().subscribe();
    info!(%client_id, "Dashboard client connected");

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => {
                    let text = match serde_json::to_string(&update) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(%client_id, "Failed to encode update: {e}");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%client_id, skipped, "Dashboard client lagging, updates skipped");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => debug!(%client_id, "Ignoring inbound frame"),
            },
        }
    }

    info!(%client_id, "Dashboard client disconnected");
}
