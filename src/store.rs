//! Top-level entry point that composes the event log, snapshot caching,
//! projection facades, and change notifications into a single
//! [`EventStore`] type.
//!
//! The store is assembled via [`EventStoreBuilder`], which wires one
//! storage backend (wrapped in retries) into the lock, log, and snapshot
//! store and registers metrics with a prometheus registry.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use prometheus::Registry;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::actor::{CacheConfig, SnapshotCacheHandle, spawn_cache_actor};
use crate::backplane::NotificationHub;
use crate::brook::{BrookConfig, EventLog};
use crate::clock::{SharedClock, SystemClock};
use crate::codec::CodecRegistry;
use crate::error::{BrookError, ProjectionError};
use crate::event::{NewEvent, Position, StreamKey};
use crate::generator::{ProjectionSnapshot, SnapshotBuilder, SnapshotGenerator};
use crate::lock::{DistributedLock, LockConfig};
use crate::metrics::{BrookMetrics, MetricsError};
use crate::projection::{HeadSource, Projection, ProjectionFacade, SnapshotSource};
use crate::retry::RetryPolicy;
use crate::snapshot::{RetentionPolicy, SnapshotStore};
use crate::storage::{KeyLayout, MemoryStore, RetryingStore, SharedStore};

/// Type-erased cache keyed by `(TypeId, stream)`.
///
/// `TypeId` identifies the projection type at runtime. Values are
/// `SnapshotCacheHandle<P>` or `ProjectionFacade<P>` for the matching `P`;
/// downcasting recovers the typed value.
type TypedCache = HashMap<CacheKey, Box<dyn Any + Send + Sync>>;

type CacheKey = (TypeId, StreamKey);

/// Projection types to announce per stream type.
type NotifyMap = HashMap<String, Vec<&'static str>>;

/// Everything needed to find or spawn the cache actor of one projection.
struct CacheSpawner<P> {
    caches: Arc<RwLock<TypedCache>>,
    facades: Arc<RwLock<TypedCache>>,
    log: EventLog,
    generator: SnapshotGenerator<P>,
    config: CacheConfig,
    metrics: BrookMetrics,
}

impl<P: Projection> CacheSpawner<P> {
    /// A live handle for `stream`, spawning an actor (and warming it at the
    /// current head) if none is running.
    async fn handle(&self, stream: &StreamKey) -> SnapshotCacheHandle<P> {
        let key = (TypeId::of::<P>(), stream.clone());

        {
            let caches = self.caches.read().await;
            if let Some(boxed) = caches.get(&key)
                && let Some(handle) = boxed.downcast_ref::<SnapshotCacheHandle<P>>()
                && handle.is_alive()
            {
                return handle.clone();
            }
        }

        let mut caches = self.caches.write().await;
        // Another caller may have spawned while we waited for the lock.
        if let Some(boxed) = caches.get(&key)
            && let Some(handle) = boxed.downcast_ref::<SnapshotCacheHandle<P>>()
            && handle.is_alive()
        {
            return handle.clone();
        }

        tracing::debug!(
            projection_type = P::PROJECTION_TYPE,
            stream = %stream,
            "spawning snapshot cache actor"
        );
        let builder: Arc<dyn SnapshotBuilder<P>> = Arc::new(self.generator.clone());
        let handle = spawn_cache_actor(
            stream.clone(),
            stream.stream_id(),
            builder,
            self.config.clone(),
            Some(self.metrics.clone()),
        );
        caches.insert(key.clone(), Box::new(handle.clone()));
        self.evict_on_exit(key, &handle);
        self.prewarm(stream, &handle);
        handle
    }

    /// Forget the actor, and the facade reading through it, once the actor
    /// exits. An entry already replaced by a respawned actor is kept.
    fn evict_on_exit(&self, key: CacheKey, handle: &SnapshotCacheHandle<P>) {
        let caches = Arc::clone(&self.caches);
        let facades = Arc::clone(&self.facades);
        let handle = handle.clone();
        tokio::spawn(async move {
            handle.closed().await;
            let mut caches = caches.write().await;
            let current = caches
                .get(&key)
                .and_then(|boxed| boxed.downcast_ref::<SnapshotCacheHandle<P>>())
                .is_some_and(|cached| cached.same_actor(&handle));
            if !current {
                return;
            }
            caches.remove(&key);
            facades.write().await.remove(&key);
            tracing::debug!(
                projection_type = P::PROJECTION_TYPE,
                stream = %key.1,
                "evicted idle snapshot cache"
            );
        });
    }

    fn prewarm(&self, stream: &StreamKey, handle: &SnapshotCacheHandle<P>) {
        let log = self.log.clone();
        let handle = handle.clone();
        let stream = stream.clone();
        tokio::spawn(async move {
            let warmed = match log.head_position(&stream).await {
                Ok(head) => handle.get(head).await.map(|_| ()),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = warmed {
                tracing::warn!(
                    projection_type = P::PROJECTION_TYPE,
                    stream = %stream,
                    error = %e,
                    "snapshot cache pre-warm failed"
                );
            }
        });
    }
}

/// [`SnapshotSource`] that always talks to a live cache actor, respawning
/// it after an idle shutdown.
struct StoreCacheSource<P> {
    spawner: CacheSpawner<P>,
    stream: StreamKey,
}

#[async_trait]
impl<P: Projection> SnapshotSource<P> for StoreCacheSource<P> {
    async fn snapshot_at(
        &self,
        version: Position,
    ) -> Result<Arc<ProjectionSnapshot<P>>, ProjectionError> {
        let handle = self.spawner.handle(&self.stream).await;
        match handle.get(version).await {
            // The actor idled out between lookup and send.
            Err(ProjectionError::ActorGone) => {
                self.spawner.handle(&self.stream).await.get(version).await
            }
            other => other,
        }
    }
}

/// Event log, snapshots, projections, and notifications behind one handle.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped.
#[derive(Clone)]
pub struct EventStore {
    log: EventLog,
    snapshots: SnapshotStore,
    codecs: CodecRegistry,
    retention: RetentionPolicy,
    cache_config: CacheConfig,
    metrics: BrookMetrics,
    registry: Registry,
    hub: Option<NotificationHub>,
    notify: Arc<NotifyMap>,
    caches: Arc<RwLock<TypedCache>>,
    facades: Arc<RwLock<TypedCache>>,
}

// Manual `Debug` because `dyn Any` is not `Debug`.
impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("log", &self.log)
            .field("retention", &self.retention)
            .field("cache_config", &self.cache_config)
            .finish_non_exhaustive()
    }
}

impl EventStore {
    /// Start configuring a store.
    pub fn builder() -> EventStoreBuilder {
        EventStoreBuilder::new()
    }

    /// Append events to `stream`, then announce the new version for every
    /// projection type registered with
    /// [`EventStoreBuilder::notify`] on this stream type.
    ///
    /// Notification failures are logged and never fail the append.
    ///
    /// # Arguments
    ///
    /// * `stream` - Target stream.
    /// * `events` - Events to append, in order.
    /// * `expected` - Committed head the caller based its decision on.
    ///
    /// # Returns
    ///
    /// The position of the last event in the batch.
    ///
    /// # Errors
    ///
    /// Any [`BrookError`] from [`EventLog::append`].
    pub async fn append(
        &self,
        stream: &StreamKey,
        events: Vec<NewEvent>,
        expected: Position,
    ) -> Result<Position, BrookError> {
        let position = self.log.append(stream, events, expected).await?;

        if let Some(hub) = &self.hub
            && let Some(projection_types) = self.notify.get(stream.stream_type())
        {
            for projection_type in projection_types {
                if let Err(e) = hub
                    .publish(projection_type, stream.stream_id(), position)
                    .await
                {
                    tracing::warn!(
                        projection_type,
                        stream = %stream,
                        error = %e,
                        "version notification failed"
                    );
                }
            }
        }
        Ok(position)
    }

    /// A snapshot generator for `P` configured like this store.
    pub fn generator<P: Projection>(&self) -> SnapshotGenerator<P> {
        SnapshotGenerator::new(self.log.clone(), self.snapshots.clone())
            .with_codecs(self.codecs.clone())
            .with_retention(self.retention.clone())
            .with_metrics(self.metrics.clone())
    }

    fn spawner<P: Projection>(&self) -> CacheSpawner<P> {
        CacheSpawner {
            caches: Arc::clone(&self.caches),
            facades: Arc::clone(&self.facades),
            log: self.log.clone(),
            generator: self.generator::<P>(),
            config: self.cache_config.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Live snapshot cache handle for `P` on `stream`.
    ///
    /// If no actor is running (never spawned, or idled out), one is
    /// spawned and a background build at the current head warms it.
    pub async fn snapshot_cache<P: Projection>(&self, stream: &StreamKey) -> SnapshotCacheHandle<P> {
        self.spawner::<P>().handle(stream).await
    }

    /// The projection facade for `P` on `stream`.
    ///
    /// Facades are cached, so repeated calls share the remembered head.
    pub async fn projection<P: Projection>(&self, stream: &StreamKey) -> ProjectionFacade<P> {
        let key = (TypeId::of::<P>(), stream.clone());
        {
            let facades = self.facades.read().await;
            if let Some(boxed) = facades.get(&key)
                && let Some(facade) = boxed.downcast_ref::<ProjectionFacade<P>>()
            {
                return facade.clone();
            }
        }

        let mut facades = self.facades.write().await;
        if let Some(boxed) = facades.get(&key)
            && let Some(facade) = boxed.downcast_ref::<ProjectionFacade<P>>()
        {
            return facade.clone();
        }
        let source: Arc<dyn SnapshotSource<P>> = Arc::new(StoreCacheSource {
            spawner: self.spawner::<P>(),
            stream: stream.clone(),
        });
        let head: Arc<dyn HeadSource> = Arc::new(self.log.clone());
        let facade = ProjectionFacade::new(stream.clone(), head, source);
        facades.insert(key, Box::new(facade.clone()));
        facade
    }

    /// Drop the cached snapshot of `P` on `stream` and forget its facade.
    ///
    /// Facades already handed out keep their remembered snapshot until the
    /// head moves.
    ///
    /// # Errors
    ///
    /// [`ProjectionError::ActorGone`] if the actor shut down mid-call.
    pub async fn invalidate<P: Projection>(&self, stream: &StreamKey) -> Result<(), ProjectionError> {
        let key = (TypeId::of::<P>(), stream.clone());
        self.facades.write().await.remove(&key);

        let handle = {
            let caches = self.caches.read().await;
            caches
                .get(&key)
                .and_then(|boxed| boxed.downcast_ref::<SnapshotCacheHandle<P>>())
                .filter(|handle| handle.is_alive())
                .cloned()
        };
        match handle {
            Some(handle) => handle.invalidate().await,
            None => Ok(()),
        }
    }

    /// Number of (projection, stream) pairs holding a snapshot cache.
    ///
    /// Entries are dropped when their cache actor idles out.
    pub async fn cached_projections(&self) -> usize {
        self.caches.read().await.len()
    }

    /// The underlying event log.
    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// The underlying snapshot store.
    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Metrics recorded by every component of this store.
    pub fn metrics(&self) -> &BrookMetrics {
        &self.metrics
    }

    /// Registry the metrics are registered with.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Notification hub, if one was configured.
    pub fn hub(&self) -> Option<&NotificationHub> {
        self.hub.as_ref()
    }
}

/// Builder for configuring and assembling an [`EventStore`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use brook_es::{BrookConfig, EventStore};
///
/// let store = EventStore::builder()
///     .namespace("tenant-a")
///     .brook_config(BrookConfig {
///         lock_duration: Duration::from_secs(10),
///         ..BrookConfig::default()
///     })
///     .build()
///     .expect("metrics register on a fresh registry");
/// assert_eq!(store.log().config().lock_duration, Duration::from_secs(10));
/// ```
pub struct EventStoreBuilder {
    backend: Option<SharedStore>,
    layout: KeyLayout,
    clock: SharedClock,
    holder: Option<String>,
    brook_config: BrookConfig,
    lock_config: LockConfig,
    cache_config: CacheConfig,
    retention: RetentionPolicy,
    retry: RetryPolicy,
    codecs: CodecRegistry,
    registry: Option<Registry>,
    hub: Option<NotificationHub>,
    notify: NotifyMap,
}

impl EventStoreBuilder {
    /// Create a builder with defaults: an in-memory backend, the system
    /// clock, and a fresh metrics registry.
    pub fn new() -> Self {
        Self {
            backend: None,
            layout: KeyLayout::default(),
            clock: Arc::new(SystemClock),
            holder: None,
            brook_config: BrookConfig::default(),
            lock_config: LockConfig::default(),
            cache_config: CacheConfig::default(),
            retention: RetentionPolicy::default(),
            retry: RetryPolicy::default(),
            codecs: CodecRegistry::default(),
            registry: None,
            hub: None,
            notify: HashMap::new(),
        }
    }

    /// Use `backend` for every document.
    pub fn backend(mut self, backend: SharedStore) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Prefix every key with `namespace`.
    pub fn namespace(mut self, namespace: impl AsRef<str>) -> Self {
        self.layout = KeyLayout::with_namespace(namespace);
        self
    }

    /// Time source for lease expiry and event timestamps.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Identity written into leases. Defaults to a random
    /// `brook-<uuid>`.
    pub fn holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = Some(holder.into());
        self
    }

    /// Event log tunables.
    pub fn brook_config(mut self, config: BrookConfig) -> Self {
        self.brook_config = config;
        self
    }

    /// Lock waiting tunables.
    pub fn lock_config(mut self, config: LockConfig) -> Self {
        self.lock_config = config;
        self
    }

    /// Snapshot cache actor tunables.
    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    /// Snapshot retention.
    pub fn retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Retry policy applied to every storage call.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Codecs for snapshot bodies.
    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// Register metrics with `registry` instead of a fresh one.
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Publish version changes through `hub`.
    pub fn hub(mut self, hub: NotificationHub) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Announce `P` version changes after appends to streams of
    /// `stream_type`. Requires a [`hub`](Self::hub).
    pub fn notify<P: Projection>(mut self, stream_type: impl Into<String>) -> Self {
        let types = self.notify.entry(stream_type.into()).or_default();
        if !types.contains(&P::PROJECTION_TYPE) {
            types.push(P::PROJECTION_TYPE);
        }
        self
    }

    /// Assemble the store.
    ///
    /// # Errors
    ///
    /// [`MetricsError::Registration`] if the metric names are already
    /// registered with the supplied registry.
    pub fn build(self) -> Result<EventStore, MetricsError> {
        let registry = self.registry.unwrap_or_default();
        let metrics = BrookMetrics::new(&registry)?;

        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as SharedStore);
        let store: SharedStore =
            Arc::new(RetryingStore::new(backend, self.retry).with_metrics(metrics.clone()));
        let holder = self
            .holder
            .unwrap_or_else(|| format!("brook-{}", Uuid::new_v4()));

        let lock = DistributedLock::new(
            Arc::clone(&store),
            self.layout.clone(),
            Arc::clone(&self.clock),
            holder,
        )
        .with_config(self.lock_config)
        .with_metrics(metrics.clone());
        let log = EventLog::new(Arc::clone(&store), self.layout.clone(), lock, self.clock)
            .with_config(self.brook_config)
            .with_metrics(metrics.clone());
        let snapshots = SnapshotStore::new(store, self.layout).with_metrics(metrics.clone());

        if self.hub.is_none() && !self.notify.is_empty() {
            tracing::warn!("notify registrations ignored: no notification hub configured");
        }

        Ok(EventStore {
            log,
            snapshots,
            codecs: self.codecs,
            retention: self.retention,
            cache_config: self.cache_config,
            metrics,
            registry,
            hub: self.hub,
            notify: Arc::new(self.notify),
            caches: Arc::new(RwLock::new(HashMap::new())),
            facades: Arc::new(RwLock::new(HashMap::new())),
        })
    }
}

impl Default for EventStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}
