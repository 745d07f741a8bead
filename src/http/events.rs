//! Live notification feed for operator UIs.

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::AppState;
use crate::notify::Notification;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub workspace_id: Uuid,
}

/// `GET /ws/events?workspace_id=` streams the workspace's bus events as JSON.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    info!(workspace_id = %query.workspace_id, "Event feed client connecting");
    // Subscribe before the upgrade completes so nothing published in between is lost.
    let rx = state.gateway.bus().subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx, query.workspace_id))
}

async fn handle_socket(
    mut socket: WebSocket,
    mut rx: tokio::sync::broadcast::Receiver<Notification>,
    workspace_id: Uuid,
) {
    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(notification) if notification.workspace_id == workspace_id => {
                        if let Ok(json) = serde_json::to_string(&notification) {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                debug!("Event feed client disconnected during send");
                                break;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, workspace_id = %workspace_id, "Event feed client lagged behind broadcast");
                    }
                    Err(RecvError::Closed) => {
                        debug!("Notification bus closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(workspace_id = %workspace_id, "Event feed client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Event feed socket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}
