//! Gateway session: a duplex loop per client socket.
//!
//! Adapted from the reference server's `realtime::websocket::handle_socket`:
//! separate inbound/outbound tasks joined with `tokio::select!`, the
//! outbound task pumping a mailbox to the socket, teardown guaranteed on
//! either side exiting.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use chat_core::fanout::FanoutHub;
use chat_core::model::{derive_conversation_id, EventEnvelope, Message};
use chat_core::redis_broker::RedisBroker;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::send::Sender;

#[derive(Clone)]
pub struct GatewayState {
    pub hub: Arc<FanoutHub<RedisBroker>>,
    pub sender: Arc<Sender>,
}

#[derive(Deserialize)]
pub struct ConnectQuery {
    id: Option<String>,
}

/// `GET /api/v1/ws?id=<user_id>` -> upgrade; 400 if id missing.
pub async fn connect(
    State(state): State<GatewayState>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let user_id = match query.id.filter(|id| !id.is_empty()) {
        Some(id) => id,
        None => return (StatusCode::BAD_REQUEST, "missing id").into_response(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, state))
}

async fn handle_socket(socket: WebSocket, user_id: String, state: GatewayState) {
    let mailbox = match state.hub.subscribe(&user_id).await {
        Ok(mailbox) => mailbox,
        Err(e) => {
            warn!(user = %user_id, error = %e, "failed to open fan-out subscription");
            return;
        }
    };
    let mailbox_id = mailbox.id();

    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut outbound_mailbox = mailbox;
    let outbound_task = tokio::spawn(async move {
        while let Some(payload) = outbound_mailbox.recv().await {
            let text = match std::str::from_utf8(&payload) {
                Ok(t) => t.to_string(),
                Err(_) => continue,
            };
            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    info!(user = %user_id, "gateway session opened");

    while let Some(Ok(msg)) = ws_rx.next().await {
        let WsMessage::Text(raw) = msg else { continue };
        if let Err(e) = handle_inbound_frame(&raw, &user_id, &state).await {
            warn!(user = %user_id, error = %e, "dropping malformed inbound frame");
        }
    }

    outbound_task.abort();
    state.hub.unsubscribe(&user_id, mailbox_id).await;
    info!(user = %user_id, "gateway session closed");
}

/// JSON-decode an `EventEnvelope`; unknown `type` is dropped and logged, not
/// an error surfaced to the client.
async fn handle_inbound_frame(raw: &str, sender: &str, state: &GatewayState) -> anyhow::Result<()> {
    let envelope: EventEnvelope = serde_json::from_str(raw)?;
    let now = chrono::Utc::now();
    let event_id = Uuid::new_v4().to_string();
    let envelope = envelope.with_server_stamp(event_id, now);

    let EventEnvelope::Message { content, .. } = &envelope else {
        // MessageEvent variants carry no delivery semantics in this system.
        return Ok(());
    };

    if content.destination.is_empty() || content.content.is_empty() {
        anyhow::bail!("empty destination or content");
    }

    let mut message = content.clone();
    message.sender = sender.to_string();
    message.conversation_id = derive_conversation_id(&message.sender, &message.destination);
    message.timestamp = now;
    if message.id.is_empty() {
        message.id = envelope.event_id().to_string();
    }

    let outbound_envelope = EventEnvelope::Message {
        event_id: envelope.event_id().to_string(),
        timestamp: now,
        content: message.clone(),
    };

    state.sender.send_message(&message, &outbound_envelope).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_query_accepts_missing_id_as_none() {
        let query = ConnectQuery { id: None };
        assert!(query.id.is_none());
    }
}
