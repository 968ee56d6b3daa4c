//! `GET /api/v1/messages/:user?id=<sender>&before=&after=`: the gateway
//! derives the conversation id and forwards the request to the reader
//! service's RPC surface, which owns the HistoryReader.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use chat_core::model::derive_conversation_id;
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct HistoryProxy {
    client: reqwest::Client,
    reader_addr: String,
}

impl HistoryProxy {
    pub fn new(reader_addr: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            reader_addr,
        }
    }
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    id: String,
    before: Option<String>,
    after: Option<String>,
}

#[derive(Serialize)]
struct GetMessagesRequest {
    conversation_id: String,
    before: Option<String>,
    after: Option<String>,
}

pub async fn get_messages(
    State(proxy): State<HistoryProxy>,
    Path(destination): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    if query.before.is_some() && query.after.is_some() {
        return (StatusCode::BAD_REQUEST, "both before and after set").into_response();
    }

    let conversation_id = derive_conversation_id(&query.id, &destination);
    let request = GetMessagesRequest {
        conversation_id,
        before: query.before,
        after: query.after,
    };

    let url = format!("{}/rpc/get_messages", proxy.reader_addr);
    match proxy.client.post(&url).json(&request).send().await {
        Ok(resp) if resp.status().is_success() => {
            match resp.json::<serde_json::Value>().await {
                Ok(body) => Json(body).into_response(),
                Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            }
        }
        Ok(resp) => resp.status().into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
