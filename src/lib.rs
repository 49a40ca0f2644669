//! Event-sourced brooks with versioned projection snapshots.
//!
//! Events are appended to per-stream brooks ([`EventLog`]) under a
//! distributed lease lock. Projections fold those events through a
//! [`RootReducer`](reducer::RootReducer) into read models that are
//! snapshotted at retention boundaries, cached per stream by an actor, and
//! served at the current head by a [`ProjectionFacade`]. Version changes can
//! be fanned out to subscribers through a [`NotificationHub`].

mod actor;
pub mod backplane;
mod brook;
mod clock;
pub mod codec;
mod error;
mod event;
mod generator;
mod lock;
pub mod metrics;
mod projection;
pub mod reducer;
mod retry;
pub mod snapshot;
pub mod storage;
mod store;

#[cfg(test)]
pub(crate) mod test_fixtures;

pub use actor::{CacheConfig, SnapshotCacheHandle, spawn_cache_actor};
pub use backplane::{
    BroadcastRelay, ConnectionGroups, ConnectionId, LocalGroups, NotificationHub, Relay,
    SubscriptionId, VersionChanged,
};
pub use brook::{BrookConfig, EventLog, EventRange, RecoveryOutcome};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use codec::{Codec, CodecRegistry, JsonCodec};
pub use error::{
    BackplaneError, BrookError, CodecError, LockError, ProjectionError, ReducerError,
    SnapshotError, StorageError,
};
pub use event::{
    Cursor, DomainEvent, EventContext, EventMetadata, EventRecord, JSON_CONTENT_TYPE, NewEvent,
    PendingCursor, Position, StreamKey,
};
pub use generator::{ProjectionSnapshot, SnapshotBuilder, SnapshotGenerator};
pub use lock::{DistributedLock, Lease, LockConfig};
pub use metrics::{BrookMetrics, MetricsError};
pub use projection::{HeadSource, Projection, ProjectionFacade, SnapshotSource};
pub use reducer::{EventReducer, Reduction, RootReducer};
pub use retry::RetryPolicy;
pub use snapshot::{RetentionPolicy, SnapshotStore};
pub use storage::{DocumentStore, FsStore, KeyLayout, MemoryStore, RetryingStore, SharedStore};
pub use store::{EventStore, EventStoreBuilder};
