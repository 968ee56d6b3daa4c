//! The WorkerPool `Processor` that consumes `message.dispatched` and keeps
//! the HistoryReader's "latest page" cache entry warm.
//!
//! Grounded in the original Go source's
//! `message-reader-service/internal/processor/cache_update_processor.go`
//! (`Process` re-keys on `conversation:<id>:` and pushes the message into
//! the cached list).

use std::sync::Arc;

use async_trait::async_trait;
use chat_core::model::Message;
use chat_core::worker::Processor;
use chat_core::ChatError;

use crate::history::HistoryReader;

pub struct CacheUpdateProcessor {
    reader: Arc<HistoryReader>,
}

impl CacheUpdateProcessor {
    pub fn new(reader: Arc<HistoryReader>) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl Processor<Message> for CacheUpdateProcessor {
    async fn process(&self, item: &Message) -> Result<(), ChatError> {
        self.reader.append_to_latest(&item.conversation_id, item.clone()).await;
        Ok(())
    }
}
