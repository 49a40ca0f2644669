//! Per-stream snapshot cache actor.
//!
//! Each actor is a tokio task that owns the cached snapshot of one
//! projection on one stream and at most one in-flight build. Concurrent
//! requests for the version being built join that build; requests for
//! other versions queue until it finishes. Every joiner of a build
//! receives the same `Arc`.
//!
//! Public API: [`SnapshotCacheHandle`] (cloneable async handle) and
//! [`spawn_cache_actor`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};

use crate::error::ProjectionError;
use crate::event::{Position, StreamKey};
use crate::generator::{ProjectionSnapshot, SnapshotBuilder};
use crate::metrics::BrookMetrics;
use crate::projection::Projection;

/// Tuning for snapshot cache actors.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use brook_es::CacheConfig;
///
/// let config = CacheConfig {
///     idle_timeout: Duration::from_secs(60),
///     ..CacheConfig::default()
/// };
/// assert_eq!(config.mailbox_capacity, 32);
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long an actor with no build in flight waits for a message
    /// before shutting down. `Duration::from_secs(u64::MAX / 2)` means
    /// never.
    pub idle_timeout: Duration,
    /// Bounded mailbox size.
    pub mailbox_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            mailbox_capacity: 32,
        }
    }
}

type SnapshotReply<P> = Result<Arc<ProjectionSnapshot<P>>, ProjectionError>;
type Waiter<P> = oneshot::Sender<SnapshotReply<P>>;
type BuildResult<P> = Result<ProjectionSnapshot<P>, ProjectionError>;

/// Messages sent from [`SnapshotCacheHandle`] to the actor.
pub(crate) enum CacheMessage<P> {
    /// Fetch the snapshot at `version`, building it if needed.
    Get {
        version: Position,
        reply: oneshot::Sender<SnapshotReply<P>>,
    },

    /// Drop the cached snapshot and detach any in-flight build.
    Invalidate { reply: oneshot::Sender<()> },
}

struct InFlight<P> {
    version: Position,
    generation: u64,
    waiters: Vec<Waiter<P>>,
}

struct CacheActor<P> {
    stream: StreamKey,
    projection_id: String,
    builder: Arc<dyn SnapshotBuilder<P>>,
    metrics: Option<BrookMetrics>,
    cached: Option<Arc<ProjectionSnapshot<P>>>,
    generation: u64,
    in_flight: Option<InFlight<P>>,
    queued: VecDeque<(Position, Vec<Waiter<P>>)>,
    builds: JoinSet<BuildResult<P>>,
}

impl<P: Projection> CacheActor<P> {
    fn cache_hit(&self, version: Position) -> Option<Arc<ProjectionSnapshot<P>>> {
        self.cached
            .as_ref()
            .filter(|cached| cached.version == version)
            .map(Arc::clone)
    }

    fn record(&self, result: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.snapshot_cache(P::PROJECTION_TYPE, result);
        }
    }

    fn on_get(&mut self, version: Position, reply: Waiter<P>) {
        if let Some(hit) = self.cache_hit(version) {
            self.record("hit");
            let _ = reply.send(Ok(hit));
            return;
        }
        self.record("miss");

        match &mut self.in_flight {
            Some(flight) if flight.version == version && flight.generation == self.generation => {
                flight.waiters.push(reply);
            }
            Some(_) => match self.queued.iter_mut().find(|(v, _)| *v == version) {
                Some((_, waiters)) => waiters.push(reply),
                None => self.queued.push_back((version, vec![reply])),
            },
            None => self.start(version, vec![reply]),
        }
    }

    fn start(&mut self, version: Position, waiters: Vec<Waiter<P>>) {
        let builder = Arc::clone(&self.builder);
        let stream = self.stream.clone();
        let projection_id = self.projection_id.clone();
        self.builds
            .spawn(async move { builder.build(&stream, &projection_id, version).await });
        self.in_flight = Some(InFlight {
            version,
            generation: self.generation,
            waiters,
        });
    }

    fn on_built(&mut self, joined: Result<BuildResult<P>, JoinError>) {
        let Some(flight) = self.in_flight.take() else {
            return;
        };

        let outcome = match joined {
            Ok(Ok(snapshot)) => {
                let snapshot = Arc::new(snapshot);
                if flight.generation == self.generation {
                    self.cached = Some(Arc::clone(&snapshot));
                }
                Ok(snapshot)
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    stream = %self.stream,
                    projection_type = P::PROJECTION_TYPE,
                    version = %flight.version,
                    error = %e,
                    "snapshot build failed"
                );
                Err(e)
            }
            Err(e) => {
                tracing::error!(
                    stream = %self.stream,
                    projection_type = P::PROJECTION_TYPE,
                    version = %flight.version,
                    error = %e,
                    "snapshot build task panicked"
                );
                Err(ProjectionError::BuildPanicked)
            }
        };
        answer(flight.waiters, outcome);
        self.start_next();
    }

    fn start_next(&mut self) {
        while self.in_flight.is_none() {
            let Some((version, waiters)) = self.queued.pop_front() else {
                return;
            };
            match self.cache_hit(version) {
                Some(hit) => answer(waiters, Ok(hit)),
                None => self.start(version, waiters),
            }
        }
    }

    fn invalidate(&mut self) {
        self.cached = None;
        self.generation += 1;
        tracing::debug!(
            stream = %self.stream,
            projection_type = P::PROJECTION_TYPE,
            generation = self.generation,
            "snapshot cache invalidated"
        );
    }
}

/// Send one outcome to every waiter. A failure seen by several waiters is
/// shared through an `Arc`.
fn answer<P>(waiters: Vec<Waiter<P>>, outcome: SnapshotReply<P>) {
    match outcome {
        Ok(snapshot) => {
            for waiter in waiters {
                let _ = waiter.send(Ok(Arc::clone(&snapshot)));
            }
        }
        Err(e) if waiters.len() == 1 => {
            if let Some(waiter) = waiters.into_iter().next() {
                let _ = waiter.send(Err(e));
            }
        }
        Err(e) => {
            let shared = Arc::new(e);
            for waiter in waiters {
                let _ = waiter.send(Err(ProjectionError::Shared(Arc::clone(&shared))));
            }
        }
    }
}

async fn run_cache_actor<P: Projection>(
    mut actor: CacheActor<P>,
    mut rx: mpsc::Receiver<CacheMessage<P>>,
    config: CacheConfig,
) {
    loop {
        let idle = actor.in_flight.is_none();
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(CacheMessage::Get { version, reply }) => actor.on_get(version, reply),
                Some(CacheMessage::Invalidate { reply }) => {
                    actor.invalidate();
                    let _ = reply.send(());
                }
                None => break,
            },
            Some(joined) = actor.builds.join_next(), if !actor.builds.is_empty() => {
                actor.on_built(joined);
            }
            () = tokio::time::sleep(config.idle_timeout), if idle => {
                tracing::info!(
                    stream = %actor.stream,
                    projection_type = P::PROJECTION_TYPE,
                    "snapshot cache idle, shutting down"
                );
                break;
            }
        }
    }
}

/// Async handle to a running snapshot cache actor.
///
/// Cheap to clone; all clones talk to the same actor.
#[derive(Debug)]
pub struct SnapshotCacheHandle<P> {
    sender: mpsc::Sender<CacheMessage<P>>,
}

impl<P> Clone for SnapshotCacheHandle<P> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<P: Projection> SnapshotCacheHandle<P> {
    /// The snapshot at `version`, from cache or a (possibly shared) build.
    ///
    /// # Errors
    ///
    /// * Any build failure; a failure observed by several callers arrives
    ///   as [`ProjectionError::Shared`].
    /// * [`ProjectionError::BuildPanicked`] -- the build task panicked.
    /// * [`ProjectionError::ActorGone`] -- the actor has shut down.
    pub async fn get(
        &self,
        version: Position,
    ) -> Result<Arc<ProjectionSnapshot<P>>, ProjectionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CacheMessage::Get { version, reply: tx })
            .await
            .map_err(|_| ProjectionError::ActorGone)?;
        rx.await.map_err(|_| ProjectionError::ActorGone)?
    }

    /// Drop the cached snapshot. A build already in flight still answers
    /// its callers but its result is not cached.
    ///
    /// # Errors
    ///
    /// [`ProjectionError::ActorGone`] if the actor has shut down.
    pub async fn invalidate(&self) -> Result<(), ProjectionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CacheMessage::Invalidate { reply: tx })
            .await
            .map_err(|_| ProjectionError::ActorGone)?;
        rx.await.map_err(|_| ProjectionError::ActorGone)
    }

    /// `false` once the actor has exited (idle timeout or all handles
    /// dropped).
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Resolves once the actor has exited.
    pub async fn closed(&self) {
        self.sender.closed().await;
    }

    /// `true` if both handles talk to the same actor.
    pub fn same_actor(&self, other: &Self) -> bool {
        self.sender.same_channel(&other.sender)
    }
}

/// Spawn a cache actor for `projection_id` on `stream`.
///
/// # Arguments
///
/// * `stream` - Source event stream.
/// * `projection_id` - Projection instance served by this actor.
/// * `builder` - Produces snapshots on cache misses.
/// * `config` - Idle timeout and mailbox size.
/// * `metrics` - Optional hit/miss recording.
///
/// # Returns
///
/// A [`SnapshotCacheHandle`] for the new actor.
pub fn spawn_cache_actor<P: Projection>(
    stream: StreamKey,
    projection_id: impl Into<String>,
    builder: Arc<dyn SnapshotBuilder<P>>,
    config: CacheConfig,
    metrics: Option<BrookMetrics>,
) -> SnapshotCacheHandle<P> {
    let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
    let actor = CacheActor {
        stream,
        projection_id: projection_id.into(),
        builder,
        metrics,
        cached: None,
        generation: 0,
        in_flight: None,
        queued: VecDeque::new(),
        builds: JoinSet::new(),
    };
    tokio::spawn(run_cache_actor(actor, rx, config));
    SnapshotCacheHandle { sender: tx }
}
