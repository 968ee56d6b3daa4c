pub mod amqp;
pub mod config;
pub mod error;
pub mod fanout;
pub mod metrics;
pub mod model;
pub mod redis_broker;
pub mod worker;

pub use error::ChatError;
pub use model::{derive_conversation_id, Cursor, CursorParseError, EventEnvelope, Message, OutboxRow};
