use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

use super::router::{ClientMessage, NotificationRouter};
use crate::state::AppState;

/// Upgrades to the job notification socket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let router = state.notifications.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, router))
}

async fn handle_socket(socket: WebSocket, router: Arc<NotificationRouter>) {
    let (mut sender, mut receiver) = socket.split();
    let (conn, mut rx) = router.connect();
    info!("🔌 Client {} connected", conn);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize notification: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                debug!("Send failed, client {} went away", conn);
                break;
            }
        }
    });

    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(ClientMessage::Subscribe { job_id }) => {
                    debug!("Client {} subscribed to {}", conn, job_id);
                    router.subscribe(conn, job_id);
                }
                Err(e) => debug!("Ignoring client frame: {}", e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket receive error: {}", e);
                break;
            }
        }
    }

    router.disconnect(conn);
    send_task.abort();
    info!("🔌 Client {} disconnected", conn);
}
