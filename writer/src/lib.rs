pub mod dispatcher;
pub mod health;
pub mod outbox;
pub mod processor;
