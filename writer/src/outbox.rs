//! Outbox Store: atomic `(message, outbox_event)` write, change-stream
//! of unprocessed rows, mark-processed.
//!
//! Grounded directly in the original Go source's
//! `message-writer-service/internal/processor/message_processor.go`
//! (`insertMessageWithOutbox`: a Mongo client session running a
//! `WithTransaction` callback that inserts into both the `messages` and
//! outbox collections) and, for the change-feed contract shape, the
//! `ChangeStreamBroker` pattern in the example pack's `change_stream.rs`
//! (resume-token-aware lazy sequence, closes cleanly on cancellation).

use chat_core::config::MongoConfig;
use chat_core::{ChatError, Message, OutboxRow};
use futures::stream::{Stream, StreamExt, TryStreamExt};
use mongodb::bson::{doc, Bson};
use mongodb::change_stream::event::OperationType;
use mongodb::options::{FindOptions, IndexOptions, TransactionOptions};
use mongodb::{Client, Collection, IndexModel};

#[derive(Clone)]
pub struct OutboxStore {
    client: Client,
    messages: Collection<Message>,
    outbox: Collection<OutboxRow>,
}

impl OutboxStore {
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn connect(cfg: &MongoConfig) -> Result<Self, ChatError> {
        let client = Client::with_uri_str(&cfg.uri)
            .await
            .map_err(|e| ChatError::Fatal(format!("mongo connect: {e}")))?;
        let db = client.database(&cfg.database);
        let messages: Collection<Message> = db.collection(&cfg.messages_collection);
        let outbox: Collection<OutboxRow> = db.collection(&cfg.outbox_collection);

        // `id` carries the wire contract (clients see "id", not "_id"), so
        // retried inserts are deduplicated through this index rather than
        // through Mongo's default `_id` primary key.
        let unique_id_index = IndexModel::builder()
            .keys(doc! { "id": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        messages.create_index(unique_id_index).await.map_err(ChatError::from)?;

        Ok(Self { client, messages, outbox })
    }

    /// Atomic insertion of `message` into `messages` and a matching
    /// zero-`processed_at` `OutboxRow` into the outbox, in one transaction.
    /// A retried `write_pair` for the same `message.id` collapses onto the
    /// existing rows via `messages`' unique `id` index and the outbox's
    /// unique `_id` — the whole transaction aborts cleanly and the caller
    /// observes the pre-existing rows as already durable.
    pub async fn write_pair(&self, message: Message) -> Result<(), ChatError> {
        let mut session = self
            .client
            .start_session()
            .await
            .map_err(ChatError::from)?;
        session
            .start_transaction()
            .with_options(TransactionOptions::builder().build())
            .await
            .map_err(ChatError::from)?;

        let row = OutboxRow::new(message.clone(), message.timestamp);

        let insert_message = self
            .messages
            .insert_one(&message)
            .session(&mut session)
            .await;
        if let Err(e) = insert_message {
            if is_duplicate_key(&e) {
                session.abort_transaction().await.ok();
                return Ok(());
            }
            session.abort_transaction().await.ok();
            return Err(ChatError::from(e));
        }

        let insert_outbox = self.outbox.insert_one(&row).session(&mut session).await;
        if let Err(e) = insert_outbox {
            if is_duplicate_key(&e) {
                session.abort_transaction().await.ok();
                return Ok(());
            }
            session.abort_transaction().await.ok();
            return Err(ChatError::from(e));
        }

        session.commit_transaction().await.map_err(ChatError::from)?;
        metrics::counter!("messages_processed_total", 1);
        Ok(())
    }

    /// One-shot sweep for rows with `processed_at == null` that predate the
    /// change-stream resume point, used to drain any backlog accumulated
    /// before the dispatcher last started.
    pub async fn unprocessed_backlog(&self, limit: i64) -> Result<Vec<OutboxRow>, ChatError> {
        let filter = doc! { "processed_at": Bson::Null };
        let opts = FindOptions::builder()
            .sort(doc! { "created_at": 1 })
            .limit(limit)
            .build();
        let mut cursor = self.outbox.find(filter).with_options(opts).await?;
        let mut rows = Vec::new();
        while let Some(row) = cursor.try_next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Opens the store's change-feed, filtered to inserts of unprocessed
    /// rows, as a lazy and potentially infinite sequence. Stream closure
    /// (context cancellation or store error) ends the sequence; the
    /// dispatcher is responsible for restart.
    pub async fn stream_unprocessed(
        &self,
    ) -> Result<impl Stream<Item = Result<OutboxRow, ChatError>> + '_, ChatError> {
        let change_stream = self.outbox.watch().await?;
        Ok(change_stream.filter_map(|event| async move {
            match event {
                Ok(ev) if ev.operation_type == OperationType::Insert => {
                    ev.full_document.map(Ok)
                }
                Ok(_) => None,
                Err(e) => Some(Err(ChatError::from(e))),
            }
        }))
    }

    /// Marks a row processed. The transition is one-way: a row already
    /// marked is left untouched (`$set` is idempotent, but the filter also
    /// requires `processed_at: null` so a racing second writer never
    /// overwrites an existing timestamp).
    pub async fn mark_processed(&self, row_id: &str, at: chrono::DateTime<chrono::Utc>) -> Result<(), ChatError> {
        self.outbox
            .update_one(
                doc! { "_id": row_id, "processed_at": Bson::Null },
                doc! { "$set": { "processed_at": Bson::DateTime(mongodb::bson::DateTime::from_chrono(at)) } },
            )
            .await?;
        Ok(())
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        *err.kind,
        mongodb::error::ErrorKind::Write(mongodb::error::WriteFailure::WriteError(
            mongodb::error::WriteError { code: 11000, .. }
        ))
    )
}

