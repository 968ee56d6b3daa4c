use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

/// The five error kinds from the error-handling design: validation failures
/// are client-caused and never retried server-side, transient dependency
/// failures are surfaced to the caller and/or turned into a nack-requeue,
/// poison payloads are discarded without requeue, panics are recovered at
/// task boundaries and folded into transient-dependency handling, and fatal
/// errors abort the process at startup.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("transient dependency error: {0}")]
    TransientDependency(String),

    #[error("poison payload: {0}")]
    PoisonPayload(String),

    #[error("internal panic recovered: {0}")]
    Panic(String),

    #[error("fatal startup error: {0}")]
    Fatal(String),
}

impl ChatError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientDependency(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientDependency(_) | Self::Panic(_))
    }
}

impl From<mongodb::error::Error> for ChatError {
    fn from(e: mongodb::error::Error) -> Self {
        Self::TransientDependency(e.to_string())
    }
}

impl From<redis::RedisError> for ChatError {
    fn from(e: redis::RedisError) -> Self {
        Self::TransientDependency(e.to_string())
    }
}

impl From<lapin::Error> for ChatError {
    fn from(e: lapin::Error) -> Self {
        Self::TransientDependency(e.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        Self::PoisonPayload(e.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

/// Maps the taxonomy onto HTTP status at the edge. Kept separate from the
/// enum itself so `chat-core` stays usable from non-HTTP contexts (the
/// dispatcher, the worker pools).
impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ChatError::Validation(_) => (StatusCode::BAD_REQUEST, "InvalidArgument"),
            ChatError::TransientDependency(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal"),
            ChatError::PoisonPayload(_) => (StatusCode::BAD_REQUEST, "PoisonPayload"),
            ChatError::Panic(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal"),
            ChatError::Fatal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal"),
        };
        (
            status,
            Json(ErrorBody {
                error: code.to_string(),
                message: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_panic_are_retryable() {
        assert!(ChatError::transient("timeout").is_retryable());
        assert!(ChatError::Panic("boom".into()).is_retryable());
        assert!(!ChatError::validation("bad input").is_retryable());
        assert!(!ChatError::PoisonPayload("bad json".into()).is_retryable());
    }
}
