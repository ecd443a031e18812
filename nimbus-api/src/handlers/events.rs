// Event stream: a websocket fed by the fan-out hub
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use nimbus_common::CoreError;
use nimbus_orchestrator::HubHandle;

use crate::app::AppState;
use crate::error::ApiError;

/// Per-client queue; a client that falls this far behind is evicted.
const SUBSCRIBER_QUEUE: usize = 256;

pub async fn events_stream(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    let Some(hub) = state.hub.clone() else {
        return ApiError(CoreError::BackendUnavailable("event hub is not running".into())).into_response();
    };
    ws.on_upgrade(move |socket| forward(socket, hub))
}

async fn forward(socket: WebSocket, hub: HubHandle) {
    let Some((id, mut rx)) = hub.subscribe(SUBSCRIBER_QUEUE).await else {
        return;
    };
    tracing::debug!(subscriber = id, "event stream opened");
    let (mut sink, mut incoming) = socket.split();

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(text) => {
                    if sink.send(Message::Text(text.to_string().into())).await.is_err() {
                        break;
                    }
                }
                // Evicted, or the hub stopped.
                None => break,
            },
            frame = incoming.next() => match frame {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    hub.unsubscribe(id).await;
    let _ = sink.close().await;
    tracing::debug!(subscriber = id, "event stream closed");
}
