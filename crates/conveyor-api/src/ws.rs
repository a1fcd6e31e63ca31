//! WebSocket stream of scheduler events.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use conveyor_scheduler::SchedulerEvent;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::AppState;

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let events = state.scheduler.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, events))
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsNotice {
    Lagged { skipped: u64 },
}

/// Text frame for one receive from the event bus, or `None` once it closed.
fn frame(
    received: Result<SchedulerEvent, broadcast::error::RecvError>,
) -> Option<serde_json::Result<String>> {
    match received {
        Ok(event) => Some(serde_json::to_string(&event)),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(skipped, "WebSocket subscriber lagged");
            Some(serde_json::to_string(&WsNotice::Lagged { skipped }))
        }
        Err(broadcast::error::RecvError::Closed) => None,
    }
}

async fn handle_socket(socket: WebSocket, mut events: broadcast::Receiver<SchedulerEvent>) {
    info!("WebSocket connection established");
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            received = events.recv() => {
                let Some(text) = frame(received) else { break };
                let Ok(text) = text else { continue };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket error");
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    info!("WebSocket connection closed");
}
