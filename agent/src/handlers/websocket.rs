//! WebSocket handler for the UI event stream.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::websocket::{ClientMessage, ServerMessage};
use crate::AppState;

use super::handle_mutation;

/// Handle an established WebSocket connection.
///
/// Engine events and cache changes reach the client through the
/// connection manager; incoming messages are answered on the same channel.
pub async fn handle_websocket_connection(socket: WebSocket, state: AppState, client: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let conn_manager = state.conn_manager.clone();
    let conn_id = conn_manager.register(client.clone(), tx);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Err(e) => tracing::error!("Failed to serialize WebSocket message: {}", e),
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let response = process_message(text.as_str(), &state).await;
                conn_manager.send_to(&conn_id, response);
            }
            Ok(Message::Binary(_)) => tracing::warn!(conn_id = %conn_id, "Binary messages not supported"),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    conn_manager.unregister(&conn_id);
    send_task.abort();
    tracing::info!(
        conn_id = %conn_id,
        %client,
        active_connections = conn_manager.connection_count(),
        "WebSocket client disconnected"
    );
}

/// Process a client message and return the response.
async fn process_message(text: &str, state: &AppState) -> ServerMessage {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => return ServerMessage::error(format!("Invalid message format: {e}"), None),
    };

    match message {
        ClientMessage::Mutate {
            mutation,
            request_id,
        } => match handle_mutation(state, mutation).await {
            Ok(entity) => ServerMessage::Mutated { entity, request_id },
            Err(e) => ServerMessage::error(e.to_string(), request_id),
        },
        ClientMessage::Ping => ServerMessage::Pong,
    }
}
