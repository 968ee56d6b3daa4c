//! Dispatcher: drains the outbox into the downstream broker exchange,
//! exactly-once target with an at-least-once floor.
//!
//! Pacing is driven by the change stream, not a poll clock; a 1 s sweep is
//! used only as a fallback when the change stream itself cannot be opened.

use std::sync::Arc;
use std::time::Duration;

use chat_core::amqp::ExchangePublisher;
use chat_core::model::OutboxRow;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::outbox::OutboxStore;

const BACKLOG_SWEEP_LIMIT: i64 = 1000;

pub async fn run(store: Arc<OutboxStore>, publisher: Arc<ExchangePublisher>, shutdown: CancellationToken) {
    publisher.declare().await.ok();

    let backlog = match store.unprocessed_backlog(BACKLOG_SWEEP_LIMIT).await {
        Ok(rows) => rows,
        Err(e) => {
            error!(error = %e, "initial backlog sweep failed");
            Vec::new()
        }
    };
    info!(count = backlog.len(), "draining initial outbox backlog");
    for row in backlog {
        dispatch_row(&store, &publisher, row).await;
    }

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        match store.stream_unprocessed().await {
            Ok(stream) => {
              let mut stream = Box::pin(stream);
              loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return,
                    next = stream.next() => {
                        match next {
                            Some(Ok(row)) => dispatch_row(&store, &publisher, row).await,
                            Some(Err(e)) => {
                                warn!(error = %e, "change stream error, restarting");
                                break;
                            }
                            None => {
                                warn!("change stream closed, restarting");
                                break;
                            }
                        }
                    }
                }
              }
            },
            Err(e) => {
                warn!(error = %e, "change stream unavailable, falling back to 1s sweep");
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {
                        if let Ok(rows) = store.unprocessed_backlog(BACKLOG_SWEEP_LIMIT).await {
                            for row in rows {
                                dispatch_row(&store, &publisher, row).await;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Publish success and mark-processed are the unit of "exactly-once target":
/// a publish failure leaves the row untouched for re-observation; a publish
/// success whose mark-processed is lost will be redelivered on restart and
/// MUST be deduplicated downstream by `message.id`.
async fn dispatch_row(store: &OutboxStore, publisher: &ExchangePublisher, row: OutboxRow) {
    if let Err(e) = publisher.publish(&row.payload).await {
        warn!(row_id = %row.id, error = %e, "publish failed, row remains unprocessed");
        return;
    }
    if let Err(e) = store.mark_processed(&row.id, chrono::Utc::now()).await {
        error!(row_id = %row.id, error = %e, "mark_processed failed after successful publish; row will be redelivered");
    }
    metrics::counter!("outbox_rows_dispatched_total", 1);
}
