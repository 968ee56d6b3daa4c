//! Concrete `UpstreamBroker` backing the FanoutHub with real Redis pub/sub,
//! grounded in the original Go source's `redis_message_service.go`
//! (`Publish`/`Subscribe` on the `user:<id>` channel naming scheme).

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use redis::AsyncCommands;

use crate::error::ChatError;
use crate::fanout::{Payload, UpstreamBroker, UpstreamSubscription};

pub struct RedisBroker {
    client: redis::Client,
}

impl RedisBroker {
    pub fn new(url: &str) -> Result<Self, ChatError> {
        Ok(Self {
            client: redis::Client::open(url)?,
        })
    }
}

pub struct RedisSubscription {
    stream: Pin<Box<dyn Stream<Item = redis::Msg> + Send>>,
}

#[async_trait]
impl UpstreamSubscription for RedisSubscription {
    async fn next_payload(&mut self) -> Option<Payload> {
        self.stream
            .next()
            .await
            .map(|msg| Payload::copy_from_slice(&msg.get_payload_bytes()))
    }
}

#[async_trait]
impl UpstreamBroker for RedisBroker {
    type Subscription = RedisSubscription;

    async fn subscribe(&self, channel: &str) -> Result<Self::Subscription, ChatError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(format!("user:{channel}")).await?;
        Ok(RedisSubscription {
            stream: Box::pin(pubsub.into_on_message()),
        })
    }

    async fn publish(&self, channel: &str, payload: Payload) -> Result<(), ChatError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.publish(format!("user:{channel}"), payload.to_vec()).await?;
        Ok(())
    }
}
