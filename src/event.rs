//! Stream identity, log positions, and event records.
//!
//! Pure data types shared by the event log, the reducers, and the snapshot
//! machinery. No I/O happens here.

use std::fmt;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use uuid::Uuid;

/// Content type used for JSON payloads.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Identifies one brook: `domain / stream_type / stream_id`.
///
/// # Examples
///
/// ```
/// use brook_es::StreamKey;
///
/// let key = StreamKey::new("bank", "account", "acc-1");
/// assert_eq!(key.to_string(), "bank/account/acc-1");
/// assert_eq!(key.stream_type(), "account");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    domain: String,
    stream_type: String,
    stream_id: String,
}

impl StreamKey {
    /// Create a stream key.
    pub fn new(
        domain: impl Into<String>,
        stream_type: impl Into<String>,
        stream_id: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            stream_type: stream_type.into(),
            stream_id: stream_id.into(),
        }
    }

    /// Bounded context the stream belongs to.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Stream (aggregate) type, e.g. `"account"`.
    pub fn stream_type(&self) -> &str {
        &self.stream_type
    }

    /// Instance identifier within the stream type.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.domain, self.stream_type, self.stream_id)
    }
}

/// Zero-based log position, or [`Position::NOT_SET`] for an empty stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(i64);

impl Position {
    /// No committed events.
    pub const NOT_SET: Position = Position(-1);

    /// Position of the event at offset `n`.
    pub const fn at(n: u64) -> Self {
        Self(n as i64)
    }

    /// Interpret a raw value; anything negative means [`NOT_SET`](Self::NOT_SET).
    pub const fn from_raw(raw: i64) -> Self {
        if raw < 0 { Self::NOT_SET } else { Self(raw) }
    }

    /// Raw signed value (`-1` when not set).
    pub const fn value(self) -> i64 {
        self.0
    }

    /// `true` if at least one event is committed.
    pub const fn is_set(self) -> bool {
        self.0 >= 0
    }

    /// Offset of the last event, if any.
    pub const fn offset(self) -> Option<u64> {
        if self.0 >= 0 { Some(self.0 as u64) } else { None }
    }

    /// First free offset after this position (`0` for `NOT_SET`).
    pub const fn next(self) -> u64 {
        (self.0 + 1) as u64
    }

    /// Number of events covered by `[0, self]`.
    pub const fn count(self) -> u64 {
        self.next()
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::NOT_SET
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A typed domain event with a stable wire name.
///
/// ```
/// use brook_es::DomainEvent;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct FundsDeposited {
///     amount: i64,
/// }
///
/// impl DomainEvent for FundsDeposited {
///     const EVENT_TYPE: &'static str = "FundsDeposited";
/// }
/// ```
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Event type tag written to [`EventRecord::event_type`].
    const EVENT_TYPE: &'static str;
}

/// Cross-cutting metadata stamped onto appended events.
///
/// # Examples
///
/// ```
/// use brook_es::EventContext;
///
/// let ctx = EventContext::default()
///     .with_actor("user-42")
///     .with_correlation_id("req-abc-123");
///
/// assert_eq!(ctx.actor.as_deref(), Some("user-42"));
/// assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc-123"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventContext {
    /// Identity of whoever caused the event (e.g. a user ID).
    pub actor: Option<String>,
    /// Correlation ID for tracing a request across streams.
    pub correlation_id: Option<String>,
    /// ID of the message that caused this event.
    pub causation_id: Option<String>,
}

impl EventContext {
    /// Set the actor identity.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the causation ID.
    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }
}

/// Metadata persisted with every event record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Actor from the [`EventContext`], if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Correlation ID from the [`EventContext`], if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Causation ID from the [`EventContext`], if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
}

impl From<&EventContext> for EventMetadata {
    fn from(ctx: &EventContext) -> Self {
        Self {
            actor: ctx.actor.clone(),
            correlation_id: ctx.correlation_id.clone(),
            causation_id: ctx.causation_id.clone(),
        }
    }
}

/// A proposed event before a log position is allocated.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Client-assigned identity; used to recognise retried appends.
    pub event_id: Uuid,
    /// Event type tag.
    pub event_type: String,
    /// Payload content type.
    pub content_type: String,
    /// Encoded payload.
    pub payload: Value,
    /// Audit metadata.
    pub metadata: EventMetadata,
}

impl NewEvent {
    /// A JSON event with a fresh v4 event ID.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            content_type: JSON_CONTENT_TYPE.to_string(),
            payload,
            metadata: EventMetadata::default(),
        }
    }

    /// Encode a typed domain event.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the event cannot be serialized.
    pub fn from_domain<E: DomainEvent>(event: &E) -> serde_json::Result<Self> {
        Ok(Self::new(E::EVENT_TYPE, serde_json::to_value(event)?))
    }

    /// Replace the generated event ID (e.g. to make a retry idempotent).
    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    /// Stamp cross-cutting metadata.
    pub fn with_context(mut self, ctx: &EventContext) -> Self {
        self.metadata = EventMetadata::from(ctx);
        self
    }

    pub(crate) fn into_record(self, position: u64, timestamp_ms: u64) -> EventRecord {
        EventRecord {
            position,
            event_id: self.event_id,
            event_type: self.event_type,
            content_type: self.content_type,
            payload: self.payload,
            timestamp_ms,
            metadata: self.metadata,
        }
    }
}

/// A committed, write-once event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Zero-based position within the stream.
    pub position: u64,
    /// Client-assigned event ID.
    pub event_id: Uuid,
    /// Event type tag (e.g. `"FundsDeposited"`).
    pub event_type: String,
    /// Payload content type.
    pub content_type: String,
    /// Encoded payload.
    pub payload: Value,
    /// Append time in Unix epoch milliseconds.
    pub timestamp_ms: u64,
    /// Audit metadata.
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl EventRecord {
    /// `true` if this record carries a `E`.
    pub fn is<E: DomainEvent>(&self) -> bool {
        self.event_type == E::EVENT_TYPE
    }

    /// Decode the payload as `E`.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the payload does not match `E`.
    pub fn decode<E: DeserializeOwned>(&self) -> serde_json::Result<E> {
        E::deserialize(&self.payload)
    }
}

/// In-flight append marker persisted before any event is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCursor {
    /// Committed position when the append started.
    pub original_position: Position,
    /// Position the cursor advances to once every event is written.
    pub target_position: Position,
}

/// Committed head plus the in-flight marker, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor {
    /// Last committed position.
    pub committed: Position,
    /// Interrupted or in-flight append.
    pub pending: Option<PendingCursor>,
}

/// Stored form of the committed cursor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct CommittedCursorDoc {
    pub committed: Position,
}
