//! `SendMessage`: a two-shot write — a durable publish to the writer's queue
//! (failures reported to the caller) and a best-effort live publish through
//! the FanoutHub (failures only logged, because the durable path is the
//! authoritative delivery channel).

use std::sync::Arc;

use bytes::Bytes;
use chat_core::amqp::QueuePublisher;
use chat_core::fanout::FanoutHub;
use chat_core::model::{EventEnvelope, Message};
use chat_core::redis_broker::RedisBroker;
use tracing::warn;

pub struct Sender {
    hub: Arc<FanoutHub<RedisBroker>>,
    durable: QueuePublisher,
}

impl Sender {
    pub fn new(hub: Arc<FanoutHub<RedisBroker>>, durable: QueuePublisher) -> Self {
        Self { hub, durable }
    }

    pub async fn send_message(&self, message: &Message, envelope: &EventEnvelope) -> anyhow::Result<()> {
        self.durable.publish(message).await?;

        let payload = serde_json::to_vec(envelope)?;
        if let Err(e) = self.hub.publish(&message.destination, Bytes::from(payload)).await {
            warn!(destination = %message.destination, error = %e, "live fan-out publish failed");
        }

        Ok(())
    }
}
