//! Projections (read models) and the facade callers read them through.
//!
//! A [`Projection`] is a serializable state type plus the [`RootReducer`]
//! that folds events into it. [`ProjectionFacade`] serves the projection
//! at the stream's current head, skipping the snapshot cache entirely when
//! the head has not moved since the last read.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::actor::SnapshotCacheHandle;
use crate::brook::EventLog;
use crate::error::{BrookError, ProjectionError};
use crate::event::{Position, StreamKey};
use crate::generator::ProjectionSnapshot;
use crate::reducer::RootReducer;

/// A read model derived from one event stream.
///
/// # Contract
///
/// - [`reducer`](Projection::reducer) must be deterministic: the same
///   events in the same order always produce the same state.
/// - Unknown event types are passed through for forward compatibility.
/// - Bump a reducer's version whenever its logic changes, so snapshots
///   built by the old logic are not reused.
pub trait Projection:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Projection type name, used in snapshot keys, metrics, and
    /// notifications.
    const PROJECTION_TYPE: &'static str;

    /// The reducer composition for this projection.
    fn reducer() -> RootReducer<Self>;
}

/// Where the facade learns the committed head.
#[async_trait]
pub trait HeadSource: Send + Sync {
    /// Committed head of `stream`.
    async fn head_position(&self, stream: &StreamKey) -> Result<Position, BrookError>;
}

#[async_trait]
impl HeadSource for EventLog {
    async fn head_position(&self, stream: &StreamKey) -> Result<Position, BrookError> {
        EventLog::head_position(self, stream).await
    }
}

/// Where the facade obtains snapshots.
#[async_trait]
pub trait SnapshotSource<P>: Send + Sync {
    /// Snapshot at `version`.
    async fn snapshot_at(
        &self,
        version: Position,
    ) -> Result<Arc<ProjectionSnapshot<P>>, ProjectionError>;
}

#[async_trait]
impl<P: Projection> SnapshotSource<P> for SnapshotCacheHandle<P> {
    async fn snapshot_at(
        &self,
        version: Position,
    ) -> Result<Arc<ProjectionSnapshot<P>>, ProjectionError> {
        self.get(version).await
    }
}

struct FacadeState<P> {
    last_known_head: Position,
    last_snapshot: Option<Arc<ProjectionSnapshot<P>>>,
}

/// Reads one projection of one stream at its current head.
///
/// Cheap to clone; clones share the remembered head and snapshot.
pub struct ProjectionFacade<P> {
    stream: StreamKey,
    head: Arc<dyn HeadSource>,
    snapshots: Arc<dyn SnapshotSource<P>>,
    state: Arc<Mutex<FacadeState<P>>>,
}

impl<P> Clone for ProjectionFacade<P> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
            head: Arc::clone(&self.head),
            snapshots: Arc::clone(&self.snapshots),
            state: Arc::clone(&self.state),
        }
    }
}

impl<P> fmt::Debug for ProjectionFacade<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectionFacade")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl<P: Projection> ProjectionFacade<P> {
    /// Create a facade for `stream`.
    pub fn new(
        stream: StreamKey,
        head: Arc<dyn HeadSource>,
        snapshots: Arc<dyn SnapshotSource<P>>,
    ) -> Self {
        Self {
            stream,
            head,
            snapshots,
            state: Arc::new(Mutex::new(FacadeState {
                last_known_head: Position::NOT_SET,
                last_snapshot: None,
            })),
        }
    }

    /// Stream this facade reads.
    pub fn stream(&self) -> &StreamKey {
        &self.stream
    }

    /// The projection at the stream's current head.
    ///
    /// If the head equals the last head seen and a snapshot is remembered,
    /// that snapshot is returned without consulting the cache. The
    /// remembered head never moves backwards.
    ///
    /// # Errors
    ///
    /// * [`ProjectionError::Brook`] -- the head could not be read.
    /// * Any error from the snapshot source.
    pub async fn get(&self) -> Result<Arc<ProjectionSnapshot<P>>, ProjectionError> {
        let head = self.head.head_position(&self.stream).await?;
        {
            let state = self.state.lock().await;
            if head == state.last_known_head
                && let Some(snapshot) = &state.last_snapshot
            {
                return Ok(Arc::clone(snapshot));
            }
        }

        let snapshot = self.snapshots.snapshot_at(head).await?;

        let mut state = self.state.lock().await;
        if head > state.last_known_head || state.last_snapshot.is_none() {
            state.last_known_head = head.max(state.last_known_head);
            state.last_snapshot = Some(Arc::clone(&snapshot));
        }
        Ok(snapshot)
    }

    /// Committed head of the stream.
    ///
    /// # Errors
    ///
    /// [`BrookError`] if the cursor cannot be read.
    pub async fn head_position(&self) -> Result<Position, BrookError> {
        self.head.head_position(&self.stream).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    use super::*;
    use crate::test_fixtures::{AccountBalance, account};

    struct FakeHead(AtomicI64);

    impl FakeHead {
        fn set(&self, raw: i64) {
            self.0.store(raw, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl HeadSource for FakeHead {
        async fn head_position(&self, _: &StreamKey) -> Result<Position, BrookError> {
            Ok(Position::from_raw(self.0.load(Ordering::SeqCst)))
        }
    }

    #[derive(Default)]
    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SnapshotSource<AccountBalance> for CountingSource {
        async fn snapshot_at(
            &self,
            version: Position,
        ) -> Result<Arc<ProjectionSnapshot<AccountBalance>>, ProjectionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(ProjectionSnapshot {
                version,
                projection_path: "account-balance/acc-1".into(),
                aggregate_root_path: "bank/account/acc-1".into(),
                reducer_hash: "h".into(),
                data: Arc::new(AccountBalance {
                    balance: version.value(),
                    ..AccountBalance::default()
                }),
            }))
        }
    }

    fn facade(head: i64) -> (ProjectionFacade<AccountBalance>, Arc<FakeHead>, Arc<CountingSource>) {
        let fake_head = Arc::new(FakeHead(AtomicI64::new(head)));
        let source = Arc::new(CountingSource::default());
        let facade = ProjectionFacade::new(
            account("acc-1"),
            Arc::clone(&fake_head) as Arc<dyn HeadSource>,
            Arc::clone(&source) as Arc<dyn SnapshotSource<AccountBalance>>,
        );
        (facade, fake_head, source)
    }

    #[tokio::test]
    async fn unchanged_head_short_circuits() {
        let (facade, _, source) = facade(4);
        let first = facade.get().await.expect("first get");
        let second = facade.get().await.expect("second get");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_stream_is_fetched_once_then_remembered() {
        let (facade, _, source) = facade(-1);
        let snapshot = facade.get().await.expect("get");
        assert_eq!(snapshot.version, Position::NOT_SET);
        facade.get().await.expect("get again");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn advancing_head_fetches_a_new_snapshot() {
        let (facade, head, source) = facade(1);
        facade.get().await.expect("get at 1");
        head.set(3);
        let snapshot = facade.get().await.expect("get at 3");

        assert_eq!(snapshot.version, Position::at(3));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn remembered_head_never_regresses() {
        let (facade, head, source) = facade(5);
        facade.get().await.expect("get at 5");

        head.set(2);
        let older = facade.get().await.expect("get at 2");
        assert_eq!(older.version, Position::at(2));

        head.set(5);
        let again = facade.get().await.expect("get at 5 again");
        assert_eq!(again.version, Position::at(5));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn clones_share_remembered_state() {
        let (facade, _, source) = facade(7);
        facade.get().await.expect("get");
        facade.clone().get().await.expect("get via clone");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            facade.head_position().await.expect("head"),
            Position::at(7)
        );
    }
}
