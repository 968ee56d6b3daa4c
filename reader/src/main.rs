use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use chat_core::amqp::{self, QueueSource};
use chat_core::config::{self, AmqpConfig, HistoryConfig, MongoConfig, WorkerPoolConfig};
use chat_core::metrics::{metrics_handler, MetricsRecorder};
use chat_core::worker::WorkerPool;
use chat_core::Message;
use chat_reader::cache_processor::CacheUpdateProcessor;
use chat_reader::health::{self, HealthState};
use chat_reader::history::HistoryReader;
use chat_reader::rpc;
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

    let mongo_cfg = MongoConfig::from_env();
    let amqp_cfg = AmqpConfig::from_env();
    let history_cfg = HistoryConfig::from_env();
    let pool_cfg = WorkerPoolConfig::from_env("WORKER_POOL_SIZE");
    let port: u16 = config::env_or("READER_PORT", 8081);

    let mongo_client = mongodb::Client::with_uri_str(&mongo_cfg.uri).await?;
    let messages = mongo_client
        .database(&mongo_cfg.database)
        .collection(&mongo_cfg.messages_collection);
    let reader = Arc::new(HistoryReader::new(messages, history_cfg));

    let amqp_conn = Arc::new(amqp::connect(&amqp_cfg.connection_url()).await?);
    let consume_channel = amqp_conn.create_channel().await?;
    amqp::bind_queue_to_exchange(&consume_channel, &amqp_cfg.dispatched_queue, &amqp_cfg.message_exchange).await?;

    let source = QueueSource::<Message>::new(consume_channel, amqp_cfg.dispatched_queue.clone());
    let cache_processor = CacheUpdateProcessor::new(Arc::clone(&reader));
    let pool = WorkerPool::new(source, cache_processor, pool_cfg.concurrency);

    let shutdown = CancellationToken::new();
    let pool_shutdown = shutdown.clone();
    let pool_handle = tokio::spawn(async move {
        if let Err(e) = pool.run(pool_shutdown).await {
            tracing::error!(error = %e, "cache-update worker pool exited with error");
        }
    });

    let health_state = HealthState {
        mongo: mongo_client,
        amqp: Arc::clone(&amqp_conn),
    };

    let rpc_router = Router::new().route("/rpc/get_messages", post(rpc::get_messages)).with_state(reader);
    let health_router = Router::new()
        .route("/healthz", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .with_state(health_state);
    let mut app = rpc_router.merge(health_router);

    if MetricsRecorder::enabled_by_env() {
        let recorder = MetricsRecorder::new();
        app = app.merge(Router::new().route("/metrics", get(metrics_handler)).with_state(recorder.handle()));
    }
    let app = app.layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "reader service listening");

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
    let _ = pool_handle.await;
    Ok(())
}
