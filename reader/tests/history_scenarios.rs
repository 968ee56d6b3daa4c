//! Scenario-level tests for HistoryReader against a live MongoDB instance,
//! following the reference server's `tests/db_tests.rs` convention of
//! driving real infrastructure rather than mocking the store.
//!
//! Run with: `TEST_MONGO_URI=mongodb://127.0.0.1:27017 cargo test -p chat-reader --test history_scenarios`

use std::time::Duration;

use chat_core::config::HistoryConfig;
use chat_core::model::Message;
use chat_reader::history::HistoryReader;
use chrono::{TimeZone, Utc};
use uuid::Uuid;

async fn test_messages_collection() -> mongodb::Collection<Message> {
    let uri = std::env::var("TEST_MONGO_URI").unwrap_or_else(|_| "mongodb://127.0.0.1:27017".to_string());
    let client = mongodb::Client::with_uri_str(&uri).await.expect("connect");
    let db = client.database(&format!("chat_test_{}", Uuid::new_v4().simple()));
    db.collection("messages")
}

fn history_config() -> HistoryConfig {
    HistoryConfig {
        page_size: 20,
        cache_ttl: Duration::from_secs(21_600),
    }
}

fn message_at(n: i64, conversation_id: &str) -> Message {
    Message {
        id: format!("m{n:04}"),
        conversation_id: conversation_id.to_string(),
        sender: "alice".to_string(),
        destination: "bob".to_string(),
        content: format!("message {n}"),
        timestamp: Utc.timestamp_opt(1_700_000_000 + n, 0).unwrap(),
    }
}

/// *Offline then history*: 25 messages sent to an offline user; the first
/// page returns the 20 newest oldest-first with a non-empty `before`
/// cursor, and paging with that cursor returns the remaining 5.
#[tokio::test]
#[ignore = "requires a live MongoDB instance, see TEST_MONGO_URI"]
async fn offline_recipient_pages_through_full_history() {
    let messages = test_messages_collection().await;
    for n in 0..25 {
        messages.insert_one(message_at(n, "alice:bob")).await.expect("seed message");
    }

    let reader = HistoryReader::new(messages, history_config());

    let first_page = reader.get_messages("alice:bob", None, None).await.expect("first page");
    assert_eq!(first_page.messages.len(), 20);
    assert_eq!(first_page.messages.first().unwrap().id, "m0005");
    assert_eq!(first_page.messages.last().unwrap().id, "m0024");
    let before = first_page.before.expect("non-empty before cursor");

    let second_page = reader
        .get_messages("alice:bob", Some(&before), None)
        .await
        .expect("second page");
    assert_eq!(second_page.messages.len(), 5);
    assert_eq!(second_page.messages.first().unwrap().id, "m0000");
    assert_eq!(second_page.messages.last().unwrap().id, "m0004");
}

/// *Cursor tie-break*: two messages share a timestamp but differ in id;
/// paging with `before` anchored at the larger id returns only the
/// smaller-id message.
#[tokio::test]
#[ignore = "requires a live MongoDB instance, see TEST_MONGO_URI"]
async fn cursor_tie_break_on_identical_timestamp() {
    let messages = test_messages_collection().await;
    let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let smaller = Message {
        id: "a-smaller".to_string(),
        conversation_id: "alice:bob".to_string(),
        sender: "alice".to_string(),
        destination: "bob".to_string(),
        content: "first".to_string(),
        timestamp: ts,
    };
    let larger = Message {
        id: "b-larger".to_string(),
        conversation_id: "alice:bob".to_string(),
        sender: "alice".to_string(),
        destination: "bob".to_string(),
        content: "second".to_string(),
        timestamp: ts,
    };
    messages.insert_one(&smaller).await.expect("seed smaller");
    messages.insert_one(&larger).await.expect("seed larger");

    let reader = HistoryReader::new(messages, history_config());
    let cursor = chat_core::model::Cursor::new(ts, "b-larger".to_string()).encode();

    let page = reader.get_messages("alice:bob", Some(&cursor), None).await.expect("page");
    assert_eq!(page.messages.len(), 1);
    assert_eq!(page.messages[0].id, "a-smaller");
}
