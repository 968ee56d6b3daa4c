use std::sync::Arc;

use async_trait::async_trait;
use chat_core::model::Message;
use chat_core::worker::Processor;
use chat_core::ChatError;

use crate::outbox::OutboxStore;

/// Bridges the `messages` queue WorkerPool onto the Outbox Store's
/// `write_pair`: each durably-queued message becomes one atomic
/// `(message, outbox_row)` write.
pub struct WriteOutboxProcessor {
    store: Arc<OutboxStore>,
}

impl WriteOutboxProcessor {
    pub fn new(store: Arc<OutboxStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Processor<Message> for WriteOutboxProcessor {
    async fn process(&self, item: &Message) -> Result<(), ChatError> {
        self.store.write_pair(item.clone()).await
    }
}
