//! Reader RPC surface: `GetMessages(conversation_id, before, after) ->
//! {messages[]}`, exposed as JSON-over-HTTP.

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Json};
use chat_core::ChatError;
use serde::{Deserialize, Serialize};

use crate::history::HistoryReader;

#[derive(Deserialize)]
pub struct GetMessagesRequest {
    conversation_id: String,
    before: Option<String>,
    after: Option<String>,
}

#[derive(Serialize)]
pub struct GetMessagesResponse {
    messages: Vec<chat_core::Message>,
    before: Option<String>,
    after: Option<String>,
}

pub async fn get_messages(
    State(reader): State<Arc<HistoryReader>>,
    Json(request): Json<GetMessagesRequest>,
) -> impl IntoResponse {
    if request.conversation_id.is_empty() {
        return ChatError::validation("missing conversation_id").into_response();
    }

    match reader
        .get_messages(&request.conversation_id, request.before.as_deref(), request.after.as_deref())
        .await
    {
        Ok(page) => Json(GetMessagesResponse {
            messages: page.messages,
            before: page.before,
            after: page.after,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}
