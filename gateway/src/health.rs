use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use lapin::Connection;
use redis::Client as RedisClient;
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    pub redis: RedisClient,
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
    let kv_ok = match state.redis.get_multiplexed_async_connection().await {
        Ok(mut conn) => redis::cmd("PING").query_async::<String>(&mut conn).await.is_ok(),
        Err(_) => false,
    };
    let broker_ok = state.amqp.status().connected();

    if kv_ok && broker_ok {
        (StatusCode::OK, Json(HealthBody { status: "ready" }))
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(HealthBody { status: "not_ready" }))
    }
}
