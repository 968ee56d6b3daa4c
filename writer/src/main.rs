use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use chat_core::amqp::{self, ExchangePublisher, QueueSource};
use chat_core::config::{self, AmqpConfig, MongoConfig, WorkerPoolConfig};
use chat_core::metrics::{metrics_handler, MetricsRecorder};
use chat_core::worker::WorkerPool;
use chat_core::Message;
use chat_writer::dispatcher;
use chat_writer::health::{self, HealthState};
use chat_writer::outbox::OutboxStore;
use chat_writer::processor::WriteOutboxProcessor;
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
    let pool_cfg = WorkerPoolConfig::from_env("WORKER_POOL_SIZE");
    let port: u16 = config::env_or("WRITER_PORT", 8082);

    let store = Arc::new(OutboxStore::connect(&mongo_cfg).await?);

    let amqp_conn = Arc::new(amqp::connect(&amqp_cfg.connection_url()).await?);
    let consume_channel = amqp_conn.create_channel().await?;
    let publish_channel = amqp_conn.create_channel().await?;

    let source = QueueSource::<Message>::new(consume_channel, amqp_cfg.message_queue.clone());
    let outbox_processor = WriteOutboxProcessor::new(Arc::clone(&store));
    let pool = WorkerPool::new(source, outbox_processor, pool_cfg.concurrency);

    let publisher = Arc::new(ExchangePublisher::new(publish_channel, amqp_cfg.message_exchange.clone()));

    let shutdown = CancellationToken::new();

    let pool_shutdown = shutdown.clone();
    let pool_handle = tokio::spawn(async move {
        if let Err(e) = pool.run(pool_shutdown).await {
            tracing::error!(error = %e, "messages queue worker pool exited with error");
        }
    });

    let dispatcher_store = Arc::clone(&store);
    let dispatcher_shutdown = shutdown.clone();
    let dispatcher_handle = tokio::spawn(async move {
        dispatcher::run(dispatcher_store, publisher, dispatcher_shutdown).await;
    });

    let health_state = HealthState {
        mongo: store_client(&store),
        amqp: Arc::clone(&amqp_conn),
    };
    let mut app = Router::new()
        .route("/healthz", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .with_state(health_state);

    if MetricsRecorder::enabled_by_env() {
        let recorder = MetricsRecorder::new();
        app = app.merge(Router::new().route("/metrics", get(metrics_handler)).with_state(recorder.handle()));
    }
    let app = app.layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "writer service listening");

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
    let _ = tokio::join!(pool_handle, dispatcher_handle);
    Ok(())
}

fn store_client(store: &OutboxStore) -> mongodb::Client {
    store.client().clone()
}
