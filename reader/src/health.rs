use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use lapin::Connection;
use mongodb::Client;
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    pub mongo: Client,
    pub amqp: Arc<Connection>,
}

#[derive(Serialize)]
pub struct HealthBody {
    status: &'static str,
}

pub async fn liveness() -> Json<HealthBody> {
    Json(HealthBody { status: "alive" })
}

pub async fn readiness(State(state): State<HealthState>) -> (StatusCode, Json<HealthBody>) {
    let store_ok = state
        .mongo
        .database("admin")
        .run_command(mongodb::bson::doc! { "ping": 1 })
        .await
        .is_ok();
    let broker_ok = state.amqp.status().connected();

    if store_ok && broker_ok {
        (StatusCode::OK, Json(HealthBody { status: "ready" }))
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(HealthBody { status: "not_ready" }))
    }
}
