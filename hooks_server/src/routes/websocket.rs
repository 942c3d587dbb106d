//! Realtime socket — streams build messages to one dashboard client.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{Sink, SinkExt, Stream, StreamExt};

use crate::routes::HooksState;
use crate::services::broadcast_hub::BroadcastHub;

/// WebSocket upgrade handler
pub async fn realtime(ws: WebSocketUpgrade, State(state): State<HooksState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<BroadcastHub>) {
    let (sender, receiver) = socket.split();
    relay(&hub, sender, receiver).await;
}

/// Forward hub messages to the client until either side goes away.
async fn relay<S, R, E>(hub: &Arc<BroadcastHub>, mut sender: S, mut receiver: R)
where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut subscription = hub.subscribe();
    let subscriber_id = subscription.id().to_string();
    tracing::info!(subscriber_id = %subscriber_id, "Realtime connection established");

    loop {
        tokio::select! {
            message = subscription.recv() => {
                let Some(message) = message else { break };
                let json = match serde_json::to_string(&message.to_frame()) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!("Failed to encode realtime frame: {e}");
                        continue;
                    }
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(subscriber_id = %subscriber_id, "Realtime socket error: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    hub.unsubscribe(&subscriber_id);
    tracing::info!(subscriber_id = %subscriber_id, "Realtime connection ended");
}
