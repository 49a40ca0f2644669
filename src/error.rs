//! Crate-level error types for storage, appends, locks, folds, and projections.
//!
//! The taxonomy separates faults the caller should treat differently:
//! transient storage faults are retried internally and surface only as
//! [`StorageError::Unavailable`]; concurrency conflicts
//! ([`BrookError::ConcurrencyConflict`], [`LockError::LeaseLost`]) ask the
//! caller to re-read and retry at a higher level; payload-too-large and
//! reducer immutability violations are fatal.

use std::sync::Arc;
use std::time::Duration;

use crate::event::{Position, StreamKey};

/// Error returned by a [`DocumentStore`](crate::storage::DocumentStore) adapter.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The addressed document does not exist.
    #[error("document not found: {key}")]
    NotFound {
        /// Storage key that was addressed.
        key: String,
    },

    /// A conditional write or delete lost its optimistic-concurrency check.
    #[error("precondition failed for document {key}")]
    PreconditionFailed {
        /// Storage key that was addressed.
        key: String,
    },

    /// The request did not complete in time.
    #[error("storage request timed out")]
    Timeout,

    /// The backend asked the caller to slow down.
    #[error("storage request throttled")]
    Throttled {
        /// Server-provided hint for when to retry.
        retry_after: Option<Duration>,
    },

    /// The backend answered with a server-side status code.
    #[error("storage server error (status {status})")]
    Server {
        /// HTTP-equivalent status code.
        status: u16,
        /// Server-provided hint for when to retry.
        retry_after: Option<Duration>,
    },

    /// The document exceeds the backend's size limit (413-equivalent).
    ///
    /// Never retried.
    #[error("payload of {size} bytes is too large for document {key}")]
    PayloadTooLarge {
        /// Storage key that was addressed.
        key: String,
        /// Size of the rejected document in bytes.
        size: usize,
    },

    /// The document exists but cannot be interpreted.
    #[error("corrupt document {key}: {reason}")]
    Corrupt {
        /// Storage key that was addressed.
        key: String,
        /// Human-readable description of the problem.
        reason: String,
    },

    /// Transient faults persisted past the retry budget.
    #[error("storage unavailable: {operation} failed after {attempts} attempts")]
    Unavailable {
        /// Logical operation name (e.g. `"put"`).
        operation: &'static str,
        /// Number of attempts made.
        attempts: u32,
        /// The last transient fault observed.
        #[source]
        last: Box<StorageError>,
    },

    /// Local filesystem failure (used by [`FsStore`](crate::storage::FsStore)).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Returns `true` for faults worth retrying locally: timeouts,
    /// throttling, and 5xx responses.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Throttled { .. } => true,
            Self::Server { status, .. } => *status >= 500,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Server-provided retry hint, if the fault carried one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after } | Self::Server { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Returns `true` if the addressed document does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` if a conditional operation lost its check.
    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, Self::PreconditionFailed { .. })
    }
}

/// Error returned by [`EventLog`](crate::brook::EventLog) operations.
#[derive(Debug, thiserror::Error)]
pub enum BrookError {
    /// The caller's expected position is stale.
    ///
    /// Re-read the stream and decide again; blindly retrying the same
    /// write will fail the same way.
    #[error("concurrency conflict on stream {stream}: expected position {expected}, found {actual}")]
    ConcurrencyConflict {
        /// Stream the append targeted.
        stream: StreamKey,
        /// Position the caller believed was the head.
        expected: Position,
        /// Committed head found in storage.
        actual: Position,
    },

    /// An event was rejected by the backend's size limit. Not retryable.
    #[error(
        "event at position {position} of stream {stream} is too large ({size} bytes); \
         append smaller batches or smaller events"
    )]
    PayloadTooLarge {
        /// Stream the append targeted.
        stream: StreamKey,
        /// Position the rejected event was allocated.
        position: u64,
        /// Encoded size of the rejected record.
        size: usize,
    },

    /// A stored record or cursor could not be encoded or decoded.
    #[error("event log record encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The stream lease could not be acquired or was lost mid-append.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Storage failed (including exhausted retries).
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl BrookError {
    /// Returns `true` when the caller should re-read and retry at the
    /// application level (stale position, busy or lost lease).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict { .. }
                | Self::Lock(LockError::Busy { .. } | LockError::LeaseLost { .. })
        )
    }
}

/// Error returned by [`DistributedLock`](crate::lock::DistributedLock).
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another holder owns an unexpired lease on the resource.
    #[error("resource {resource} is locked by another holder")]
    Busy {
        /// Locked resource name.
        resource: String,
    },

    /// The lease expired and was taken by another holder, or was removed.
    #[error("lease on {resource} was lost")]
    LeaseLost {
        /// Locked resource name.
        resource: String,
    },

    /// The lease document could not be encoded.
    #[error("lease document encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Storage failed (including exhausted retries).
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Error returned while folding events.
#[derive(Debug, thiserror::Error)]
pub enum ReducerError {
    /// A reducer claimed an event but returned the state it was given.
    ///
    /// This is a programming error in the reducer and is never retried.
    #[error(
        "reducer {reducer} returned its input state for event {event_type} at position \
         {position}; reducers must return a new instance"
    )]
    ImmutabilityViolation {
        /// Identity of the offending reducer.
        reducer: String,
        /// Event type being folded.
        event_type: String,
        /// Log position of the event.
        position: u64,
    },
}

/// Error returned by a [`Codec`](crate::codec::Codec).
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Encoding or decoding failed.
    #[error("codec failure: {0}")]
    Json(#[from] serde_json::Error),

    /// No codec is registered for the envelope's content type.
    #[error("no codec registered for content type {content_type}")]
    UnsupportedContentType {
        /// Content type found on the envelope.
        content_type: String,
    },
}

/// Error returned by [`SnapshotStore`](crate::snapshot::SnapshotStore).
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// The stored envelope could not be decoded.
    #[error("corrupt snapshot envelope {key}: {source}")]
    Corrupt {
        /// Storage key of the envelope.
        key: String,
        /// Decoding failure.
        #[source]
        source: serde_json::Error,
    },

    /// The envelope could not be encoded.
    #[error("snapshot envelope encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Storage failed (including exhausted retries).
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Error returned when building or reading a projection snapshot.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// Reading the event log failed.
    #[error(transparent)]
    Brook(#[from] BrookError),

    /// A reducer broke the fold contract.
    #[error(transparent)]
    Reducer(#[from] ReducerError),

    /// Reading or writing a snapshot failed.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// Encoding or decoding projection state failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A coalesced build failed; every caller that joined it sees the
    /// same underlying error.
    #[error(transparent)]
    Shared(Arc<ProjectionError>),

    /// The build task panicked.
    #[error("snapshot build task panicked")]
    BuildPanicked,

    /// The per-stream cache actor has shut down.
    #[error("snapshot cache actor is no longer running")]
    ActorGone,
}

/// Error returned by the change notification backplane.
#[derive(Debug, thiserror::Error)]
pub enum BackplaneError {
    /// No relay listener is attached any more.
    #[error("notification relay is closed")]
    RelayClosed,
}
