//! Shared AMQP plumbing: a durable queue `Source<T>` (consumed with manual
//! ack) and a fanout-exchange publisher, used by the writer's
//! "messages" queue consumer, the reader's `message.dispatched` queue
//! consumer, and the dispatcher's publish side respectively.
//!
//! Grounded in the original Go source's `rabbitmq_source.go` (both the
//! writer's and reader's copies): `QueueDeclare` then `Consume` with
//! `auto-ack=false`, decode-or-nack-without-requeue, `Ack`/`Nack` by
//! delivery tag.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::ChatError;
use crate::worker::{Delivery, Source};

pub async fn connect(url: &str) -> Result<Connection, ChatError> {
    Connection::connect(url, ConnectionProperties::default())
        .await
        .map_err(ChatError::from)
}

/// Consumes a durable queue with manual ack, decoding each body as JSON.
pub struct QueueSource<T> {
    channel: Channel,
    queue: String,
    _payload: PhantomData<fn() -> T>,
}

impl<T> QueueSource<T> {
    pub fn new(channel: Channel, queue: impl Into<String>) -> Self {
        Self {
            channel,
            queue: queue.into(),
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<T> Source<T> for QueueSource<T>
where
    T: DeserializeOwned + Send + 'static,
{
    async fn declare_queue(&self) -> Result<(), ChatError> {
        self.channel
            .queue_declare(&self.queue, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
            .await
            .map_err(ChatError::from)?;
        Ok(())
    }

    async fn events(self: Arc<Self>) -> mpsc::Receiver<Delivery<T>> {
        let (tx, rx) = mpsc::channel(64);
        let mut consumer = match self
            .channel
            .basic_consume(
                &self.queue,
                "",
                BasicConsumeOptions { no_ack: false, ..Default::default() },
                FieldTable::default(),
            )
            .await
        {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to start consuming");
                return rx;
            }
        };
        tokio::spawn(async move {
            while let Some(delivery_result) = consumer.next().await {
                let delivery = match delivery_result {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(error = %e, "amqp consumer error");
                        break;
                    }
                };
                let tag = delivery.delivery_tag;
                let payload = serde_json::from_slice::<T>(&delivery.data)
                    .map_err(|e| e.to_string());
                if tx.send(Delivery { tag, payload }).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    async fn ack(&self, tag: u64) -> Result<(), ChatError> {
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(ChatError::from)
    }

    async fn nack(&self, tag: u64, requeue: bool) -> Result<(), ChatError> {
        self.channel
            .basic_nack(tag, BasicNackOptions { requeue, ..Default::default() })
            .await
            .map_err(ChatError::from)
    }
}

/// Publishes JSON-encoded payloads onto a durable fanout exchange with the
/// empty routing key.
pub struct ExchangePublisher {
    channel: Channel,
    exchange: String,
}

impl ExchangePublisher {
    pub fn new(channel: Channel, exchange: impl Into<String>) -> Self {
        Self {
            channel,
            exchange: exchange.into(),
        }
    }

    pub async fn declare(&self) -> Result<(), ChatError> {
        self.channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(ChatError::from)?;
        Ok(())
    }

    pub async fn publish<T: Serialize + Sync>(&self, payload: &T) -> Result<(), ChatError> {
        let body = serde_json::to_vec(payload)?;
        self.channel
            .basic_publish(
                &self.exchange,
                "",
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(ChatError::from)?
            .await
            .map_err(ChatError::from)?;
        Ok(())
    }
}

/// Publishes JSON-encoded payloads onto a durable queue directly (used by
/// the gateway's durable `SendMessage` leg).
pub struct QueuePublisher {
    channel: Channel,
    queue: String,
}

impl QueuePublisher {
    pub fn new(channel: Channel, queue: impl Into<String>) -> Self {
        Self {
            channel,
            queue: queue.into(),
        }
    }

    pub async fn declare(&self) -> Result<(), ChatError> {
        self.channel
            .queue_declare(&self.queue, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
            .await
            .map_err(ChatError::from)?;
        Ok(())
    }

    pub async fn publish<T: Serialize + Sync>(&self, payload: &T) -> Result<(), ChatError> {
        let body = serde_json::to_vec(payload)?;
        self.channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(ChatError::from)?
            .await
            .map_err(ChatError::from)?;
        Ok(())
    }
}

/// Binds a queue to a fanout exchange with the empty routing key, matching
/// the original source's `rabbitmq_source.go` `QueueBind` call.
pub async fn bind_queue_to_exchange(channel: &Channel, queue: &str, exchange: &str) -> Result<(), ChatError> {
    channel
        .queue_declare(queue, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
        .await
        .map_err(ChatError::from)?;
    channel
        .queue_bind(queue, exchange, "", QueueBindOptions::default(), FieldTable::default())
        .await
        .map_err(ChatError::from)?;
    Ok(())
}
