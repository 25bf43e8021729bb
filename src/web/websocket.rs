//! WebSocket bridge: JSON-RPC requests in, responses plus progress and
//! drive-list pushes out.

use axum::{
    extract::ws::{Message, WebSocket},
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
};
use tracing::debug;

use super::WebState;
use crate::core::BlockDevice;
use crate::rpc::{Notification, dispatch};

const PROGRESS_METHOD: &str = "transfer.progress";
const DRIVES_METHOD: &str = "drives.changed";

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WebState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn push_message(method: &str, params: impl serde::Serialize) -> Option<Message> {
    let note = Notification::new(method, params).ok()?;
    let text = serde_json::to_string(&note).ok()?;
    Some(Message::Text(text.into()))
}

async fn handle_socket(mut socket: WebSocket, state: WebState) {
    // First item is the snapshot current at connect time
    let mut progress = state.handler.orchestrator().subscribe();
    let mut drives = state.handler.drives().subscribe();
    drives.mark_changed();

    loop {
        tokio::select! {
            snapshot = progress.next() => {
                let Some(snapshot) = snapshot else { break };
                let Some(message) = push_message(PROGRESS_METHOD, &snapshot) else { continue };
                if socket.send(message).await.is_err() {
                    break;
                }
            }
            changed = drives.changed() => {
                if changed.is_err() {
                    break;
                }
                let devices: Vec<BlockDevice> = drives.borrow_and_update().clone();
                let Some(message) = push_message(DRIVES_METHOD, &devices) else { continue };
                if socket.send(message).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(error = %e, "WebSocket receive error");
                        break;
                    }
                };

                let Some(response) = dispatch(&state.handler, text.as_str()).await else {
                    continue;
                };
                let Ok(json) = serde_json::to_string(&response) else { continue };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    debug!("WebSocket connection closed");
}
