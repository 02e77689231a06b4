//! WebSocket transport for the broadcast hub.
//!
//! Each socket gets a fresh client id, is registered with the hub, and is
//! split into a writer task draining the hub channel and a reader loop
//! handling subscribe/unsubscribe/ping frames.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

use super::AppState;
use crate::hub::{BroadcastHub, ClientMessage, Envelope};

/// `GET /ws`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<BroadcastHub>) {
    let client_id = Uuid::new_v4().to_string();
    let outgoing_rx = hub.connect(&client_id).await;
    debug!("WebSocket connected: {}", client_id);

    hub.send_direct(&client_id, json!({ "type": "connected", "client_id": client_id }))
        .await;

    let (ws_sink, ws_stream) = socket.split();
    let outgoing_handle = tokio::spawn(forward_outgoing(ws_sink, outgoing_rx));

    process_incoming(ws_stream, &client_id, &hub).await;

    debug!("WebSocket disconnected: {}", client_id);
    outgoing_handle.abort();
    hub.disconnect(&client_id).await;
}

async fn forward_outgoing(
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut outgoing_rx: mpsc::Receiver<Envelope>,
) {
    while let Some(envelope) = outgoing_rx.recv().await {
        match serde_json::to_string(&envelope) {
            Ok(text) => {
                if ws_sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                error!("Failed to serialize WebSocket message: {}", e);
            }
        }
    }
}

async fn process_incoming(
    mut ws_stream: SplitStream<WebSocket>,
    client_id: &str,
    hub: &BroadcastHub,
) {
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => handle_text(hub, client_id, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("WebSocket error for {}: {}", client_id, e);
                break;
            }
        }
    }
}

/// Apply one client frame and send the reply on the personal topic.
pub(crate) async fn handle_text(hub: &BroadcastHub, client_id: &str, text: &str) {
    let reply = match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Subscribe { topic }) if !topic.is_empty() => {
            match hub.subscribe(client_id, &topic).await {
                Ok(_) => json!({ "type": "subscribed", "topic": topic }),
                Err(err) => json!({ "type": "error", "message": err.to_string() }),
            }
        }
        Ok(ClientMessage::Unsubscribe { topic }) if !topic.is_empty() => {
            hub.unsubscribe(client_id, &topic).await;
            json!({ "type": "unsubscribed", "topic": topic })
        }
        Ok(ClientMessage::Ping) => json!({ "type": "pong" }),
        Ok(_) => return,
        Err(e) => {
            debug!("Failed to parse client message from {}: {}", client_id, e);
            json!({ "type": "error", "message": "Invalid message format" })
        }
    };
    hub.send_direct(client_id, reply).await;
}
