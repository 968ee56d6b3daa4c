use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The persisted unit. Immutable once written except for nothing at all —
/// only the outbox row that accompanies it ever mutates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender: String,
    pub destination: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Fills in server-assigned fields per the gateway ingest contract:
    /// timestamp always stamped, id generated if absent, conversation id
    /// always derived from the true sender/destination pair.
    pub fn stamp(mut self, now: DateTime<Utc>) -> Self {
        self.timestamp = now;
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        self.conversation_id = derive_conversation_id(&self.sender, &self.destination);
        self
    }
}

/// Pure function: canonical conversation id from an unordered pair.
/// `derive_conversation_id(a, b) == derive_conversation_id(b, a)` for all `a, b`.
pub fn derive_conversation_id(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}

/// The transport unit: a tagged union framed on the wire and through the
/// outbox. Unknown `type` values are ignored by receivers, not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventEnvelope {
    Message {
        event_id: String,
        timestamp: DateTime<Utc>,
        content: Message,
    },
    /// Reserved for the presence/typing/read-receipt space; semantics are
    /// left undefined for now, so content is carried opaquely.
    MessageEvent {
        event_id: String,
        timestamp: DateTime<Utc>,
        content: serde_json::Value,
    },
}

impl EventEnvelope {
    pub fn event_id(&self) -> &str {
        match self {
            EventEnvelope::Message { event_id, .. } => event_id,
            EventEnvelope::MessageEvent { event_id, .. } => event_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            EventEnvelope::Message { timestamp, .. } => *timestamp,
            EventEnvelope::MessageEvent { timestamp, .. } => *timestamp,
        }
    }

    /// Client-sent `event_id`/`timestamp` are always ignored and overwritten
    /// at ingest.
    pub fn with_server_stamp(mut self, event_id: String, timestamp: DateTime<Utc>) -> Self {
        match &mut self {
            EventEnvelope::Message {
                event_id: eid,
                timestamp: ts,
                ..
            } => {
                *eid = event_id;
                *ts = timestamp;
            }
            EventEnvelope::MessageEvent {
                event_id: eid,
                timestamp: ts,
                ..
            } => {
                *eid = event_id;
                *ts = timestamp;
            }
        }
        self
    }
}

/// The durability bridge: exactly one row per message, `processed_at`
/// transitions zero -> non-zero exactly once, never back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRow {
    #[serde(rename = "_id")]
    pub id: String,
    pub payload: Message,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl OutboxRow {
    pub fn new(payload: Message, created_at: DateTime<Utc>) -> Self {
        Self {
            id: payload.id.clone(),
            payload,
            created_at,
            processed_at: None,
        }
    }

    pub fn is_unprocessed(&self) -> bool {
        self.processed_at.is_none()
    }
}

/// Opaque keyset pagination token: `"<RFC3339Nano timestamp>_<message id>"`,
/// lexicographically ordered by (timestamp, id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub timestamp: DateTime<Utc>,
    pub id: String,
}

impl Cursor {
    pub fn new(timestamp: DateTime<Utc>, id: impl Into<String>) -> Self {
        Self {
            timestamp,
            id: id.into(),
        }
    }

    pub fn encode(&self) -> String {
        format!("{}_{}", self.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true), self.id)
    }

    pub fn decode(raw: &str) -> Result<Self, CursorParseError> {
        let (ts_part, id_part) = raw
            .rsplit_once('_')
            .ok_or(CursorParseError::MalformedCursor)?;
        if id_part.is_empty() {
            return Err(CursorParseError::MalformedCursor);
        }
        let timestamp = DateTime::parse_from_rfc3339(ts_part)
            .map_err(|_| CursorParseError::MalformedCursor)?
            .with_timezone(&Utc);
        Ok(Self {
            timestamp,
            id: id_part.to_string(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CursorParseError {
    #[error("malformed cursor")]
    MalformedCursor,
}
