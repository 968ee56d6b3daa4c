use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use chat_core::amqp::{self, QueuePublisher};
use chat_core::config::{self, AmqpConfig, FanoutConfig, RedisConfig};
use chat_core::fanout::FanoutHub;
use chat_core::metrics::{metrics_handler, MetricsRecorder};
use chat_core::redis_broker::RedisBroker;
use chat_gateway::health::{self, HealthState};
use chat_gateway::history::{self, HistoryProxy};
use chat_gateway::send::Sender;
use chat_gateway::ws::{self, GatewayState};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::load_dotenv();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let redis_cfg = RedisConfig::from_env();
    let amqp_cfg = AmqpConfig::from_env();
    let fanout_cfg = FanoutConfig::from_env();
    let port: u16 = config::env_or("PORT", 8080);
    let reader_addr = config::env_string_or("MESSAGE_READER_SERVICE_ADDR", "http://127.0.0.1:8081");

    let shutdown = CancellationToken::new();

    let redis_client = redis::Client::open(redis_cfg.connection_url())?;
    let broker = RedisBroker::new(&redis_cfg.connection_url())?;
    let hub = FanoutHub::new(
        broker,
        fanout_cfg.mailbox_capacity,
        fanout_cfg.enqueue_deadline,
        shutdown.clone(),
    );

    let amqp_conn = Arc::new(amqp::connect(&amqp_cfg.connection_url()).await?);
    let publish_channel = amqp_conn.create_channel().await?;
    let durable_publisher = QueuePublisher::new(publish_channel, amqp_cfg.message_queue.clone());
    durable_publisher.declare().await?;

    let sender = Arc::new(Sender::new(Arc::clone(&hub), durable_publisher));
    let gateway_state = GatewayState {
        hub: Arc::clone(&hub),
        sender,
    };
    let history_proxy = HistoryProxy::new(reader_addr);
    let health_state = HealthState {
        redis: redis_client,
        amqp: Arc::clone(&amqp_conn),
    };

    let ws_router = Router::new().route("/api/v1/ws", get(ws::connect)).with_state(gateway_state);
    let history_router = Router::new()
        .route("/api/v1/messages/{user}", get(history::get_messages))
        .with_state(history_proxy);
    let health_router = Router::new()
        .route("/healthz", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .with_state(health_state);

    let mut app = ws_router.merge(history_router).merge(health_router);

    if MetricsRecorder::enabled_by_env() {
        let recorder = MetricsRecorder::new();
        app = app.merge(Router::new().route("/metrics", get(metrics_handler)).with_state(recorder.handle()));
    }
    let app = app.layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "gateway listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "http server exited with error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    shutdown.cancel();
    Ok(())
}
