//! Lease-based distributed lock over conditional document writes.
//!
//! A lease is a document `{lease_id, holder, expires_at_ms}` at
//! `locks/<resource>`. Acquiring creates it only-if-absent, or replaces an
//! expired one conditionally on its tag; renewing and releasing are
//! conditional on the tag the holder last wrote. A crashed holder blocks
//! the resource for at most one lease duration.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::LockError;
use crate::metrics::BrookMetrics;
use crate::storage::{ETag, KeyLayout, Precondition, SharedStore};

/// Waiting behaviour of [`DistributedLock::acquire_with_wait`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use brook_es::LockConfig;
///
/// let config = LockConfig {
///     acquire_timeout: Duration::from_secs(2),
///     ..LockConfig::default()
/// };
/// assert_eq!(config.poll_interval, Duration::from_millis(25));
/// ```
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Give up waiting for a busy resource after this long.
    pub acquire_timeout: Duration,
    /// Delay between attempts while the resource is busy.
    pub poll_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(25),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseDoc {
    lease_id: Uuid,
    holder: String,
    expires_at_ms: u64,
}

/// A held lease. Hand it back to [`DistributedLock::release`].
#[derive(Debug, Clone)]
pub struct Lease {
    resource: String,
    lease_id: Uuid,
    expires_at_ms: u64,
    duration: Duration,
    etag: ETag,
    acquired_at: Instant,
}

impl Lease {
    /// Locked resource name.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Unique identity of this lease.
    pub fn lease_id(&self) -> Uuid {
        self.lease_id
    }

    /// Expiry in Unix epoch milliseconds, per the lock's clock.
    pub fn expires_at_ms(&self) -> u64 {
        self.expires_at_ms
    }
}

/// Distributed mutual exclusion keyed by resource name.
///
/// Cheap to clone.
#[derive(Debug, Clone)]
pub struct DistributedLock {
    store: SharedStore,
    layout: KeyLayout,
    clock: SharedClock,
    holder: String,
    config: LockConfig,
    metrics: Option<BrookMetrics>,
}

impl DistributedLock {
    /// Create a lock client identified by `holder`.
    pub fn new(
        store: SharedStore,
        layout: KeyLayout,
        clock: SharedClock,
        holder: impl Into<String>,
    ) -> Self {
        Self {
            store,
            layout,
            clock,
            holder: holder.into(),
            config: LockConfig::default(),
            metrics: None,
        }
    }

    /// Replace the waiting configuration.
    pub fn with_config(mut self, config: LockConfig) -> Self {
        self.config = config;
        self
    }

    /// Record acquisition metrics.
    pub fn with_metrics(mut self, metrics: BrookMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Identity written into leases taken by this client.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Waiting configuration in effect.
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Make a single acquisition attempt.
    ///
    /// # Arguments
    ///
    /// * `resource` - Name of the resource to lock.
    /// * `duration` - Lease lifetime measured by the lock's clock.
    ///
    /// # Errors
    ///
    /// * [`LockError::Busy`] -- an unexpired lease exists, or another
    ///   client won a race for the resource.
    /// * [`LockError::Storage`] -- the backend failed.
    pub async fn acquire(&self, resource: &str, duration: Duration) -> Result<Lease, LockError> {
        let started = Instant::now();
        let result = self.try_acquire(resource, duration).await;
        self.record_acquire(&result, started, 1);
        result
    }

    /// Acquire, polling every `poll_interval` until `acquire_timeout`.
    ///
    /// # Errors
    ///
    /// [`LockError::Busy`] if the resource stayed locked for the whole
    /// timeout; [`LockError::Storage`] if the backend failed.
    pub async fn acquire_with_wait(
        &self,
        resource: &str,
        duration: Duration,
    ) -> Result<Lease, LockError> {
        let started = Instant::now();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = self.try_acquire(resource, duration).await;
            let busy = matches!(result, Err(LockError::Busy { .. }));
            if !busy || started.elapsed() >= self.config.acquire_timeout {
                self.record_acquire(&result, started, attempts);
                return result;
            }
            if let Some(metrics) = &self.metrics {
                metrics.lock_contention_wait();
            }
            tracing::debug!(resource, attempts, "resource busy, waiting for lease");
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn try_acquire(&self, resource: &str, duration: Duration) -> Result<Lease, LockError> {
        let key = self.layout.lock_key(resource);
        let now = self.clock.now_millis();

        let precondition = match self.store.get(&key).await? {
            None => Precondition::IfAbsent,
            Some(existing) => match serde_json::from_slice::<LeaseDoc>(&existing.data) {
                Ok(current) if current.expires_at_ms > now => {
                    return Err(LockError::Busy {
                        resource: resource.to_string(),
                    });
                }
                Ok(current) => {
                    tracing::debug!(
                        resource,
                        previous_holder = %current.holder,
                        "stealing expired lease"
                    );
                    Precondition::IfMatch(existing.etag)
                }
                Err(e) => {
                    tracing::warn!(resource, error = %e, "undecodable lease document; replacing it");
                    Precondition::IfMatch(existing.etag)
                }
            },
        };

        let doc = LeaseDoc {
            lease_id: Uuid::new_v4(),
            holder: self.holder.clone(),
            expires_at_ms: now.saturating_add(duration.as_millis() as u64),
        };
        let data = serde_json::to_vec(&doc)?;
        match self.store.put(&key, data, precondition).await {
            Ok(etag) => Ok(Lease {
                resource: resource.to_string(),
                lease_id: doc.lease_id,
                expires_at_ms: doc.expires_at_ms,
                duration,
                etag,
                acquired_at: Instant::now(),
            }),
            Err(e) if e.is_precondition_failed() => Err(LockError::Busy {
                resource: resource.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Extend a held lease by its original duration from now.
    ///
    /// # Errors
    ///
    /// [`LockError::LeaseLost`] if another client took the resource or the
    /// lease document is gone.
    pub async fn renew(&self, lease: &mut Lease) -> Result<(), LockError> {
        let key = self.layout.lock_key(&lease.resource);
        let doc = LeaseDoc {
            lease_id: lease.lease_id,
            holder: self.holder.clone(),
            expires_at_ms: self
                .clock
                .now_millis()
                .saturating_add(lease.duration.as_millis() as u64),
        };
        let data = serde_json::to_vec(&doc)?;
        match self
            .store
            .put(&key, data, Precondition::IfMatch(lease.etag))
            .await
        {
            Ok(etag) => {
                lease.etag = etag;
                lease.expires_at_ms = doc.expires_at_ms;
                Ok(())
            }
            Err(e) if e.is_precondition_failed() => Err(LockError::LeaseLost {
                resource: lease.resource.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Release a held lease.
    ///
    /// # Errors
    ///
    /// [`LockError::LeaseLost`] if the lease was already taken over or
    /// removed.
    pub async fn release(&self, lease: Lease) -> Result<(), LockError> {
        let key = self.layout.lock_key(&lease.resource);
        if let Some(metrics) = &self.metrics {
            metrics.lock_held(lease.acquired_at.elapsed().as_secs_f64());
        }
        match self
            .store
            .delete(&key, Precondition::IfMatch(lease.etag))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_precondition_failed() || e.is_not_found() => {
                tracing::warn!(resource = %lease.resource, "lease was lost before release");
                Err(LockError::LeaseLost {
                    resource: lease.resource,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Holder of the unexpired lease on `resource`, if any.
    ///
    /// # Errors
    ///
    /// [`LockError::Storage`] if the backend failed.
    pub async fn current_holder(&self, resource: &str) -> Result<Option<String>, LockError> {
        let key = self.layout.lock_key(resource);
        let now = self.clock.now_millis();
        Ok(self.store.get(&key).await?.and_then(|doc| {
            serde_json::from_slice::<LeaseDoc>(&doc.data)
                .ok()
                .filter(|lease| lease.expires_at_ms > now)
                .map(|lease| lease.holder)
        }))
    }

    fn record_acquire(&self, result: &Result<Lease, LockError>, started: Instant, attempts: u32) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let outcome = match result {
            Ok(_) => "acquired",
            Err(LockError::Busy { .. }) => "busy",
            Err(_) => "error",
        };
        metrics.lock_acquired(outcome, started.elapsed().as_secs_f64(), attempts);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{DocumentStore, MemoryStore};

    const LEASE: Duration = Duration::from_secs(30);

    fn pair() -> (DistributedLock, DistributedLock, ManualClock, MemoryStore) {
        let store = MemoryStore::new();
        let clock = ManualClock::new(1_000_000);
        let a = DistributedLock::new(
            Arc::new(store.clone()),
            KeyLayout::default(),
            Arc::new(clock.clone()),
            "node-a",
        );
        let b = DistributedLock::new(
            Arc::new(store.clone()),
            KeyLayout::default(),
            Arc::new(clock.clone()),
            "node-b",
        );
        (a, b, clock, store)
    }

    #[tokio::test]
    async fn second_holder_is_busy_until_release() {
        let (a, b, _clock, _store) = pair();
        let lease = a.acquire("stream-1", LEASE).await.expect("a acquires");
        assert_eq!(lease.resource(), "stream-1");

        let busy = b.acquire("stream-1", LEASE).await;
        assert!(matches!(busy, Err(LockError::Busy { .. })));
        assert_eq!(
            a.current_holder("stream-1").await.expect("inspect"),
            Some("node-a".to_string())
        );

        a.release(lease).await.expect("release");
        b.acquire("stream-1", LEASE).await.expect("b acquires after release");
    }

    #[tokio::test]
    async fn different_resources_do_not_contend() {
        let (a, b, _clock, _store) = pair();
        let _l1 = a.acquire("stream-1", LEASE).await.expect("stream-1");
        let _l2 = b.acquire("stream-2", LEASE).await.expect("stream-2");
    }

    #[tokio::test]
    async fn expired_lease_is_stolen_and_old_holder_loses_it() {
        let (a, b, clock, _store) = pair();
        let mut stale = a.acquire("stream-1", LEASE).await.expect("a acquires");

        clock.advance(LEASE + Duration::from_millis(1));
        let fresh = b.acquire("stream-1", LEASE).await.expect("b steals");
        assert_ne!(fresh.lease_id(), stale.lease_id());

        assert!(matches!(
            a.renew(&mut stale).await,
            Err(LockError::LeaseLost { .. })
        ));
        assert!(matches!(
            a.release(stale).await,
            Err(LockError::LeaseLost { .. })
        ));
        assert_eq!(
            b.current_holder("stream-1").await.expect("inspect"),
            Some("node-b".to_string())
        );
    }

    #[tokio::test]
    async fn renew_extends_expiry() {
        let (a, b, clock, _store) = pair();
        let mut lease = a.acquire("stream-1", LEASE).await.expect("acquire");
        let first_expiry = lease.expires_at_ms();

        clock.advance(Duration::from_secs(20));
        a.renew(&mut lease).await.expect("renew");
        assert_eq!(lease.expires_at_ms(), first_expiry + 20_000);

        clock.advance(Duration::from_secs(20));
        assert!(matches!(
            b.acquire("stream-1", LEASE).await,
            Err(LockError::Busy { .. })
        ));
        a.release(lease).await.expect("release renewed lease");
    }

    #[tokio::test]
    async fn undecodable_lease_is_replaced() {
        let (a, _b, _clock, store) = pair();
        store.insert_raw(KeyLayout::default().lock_key("stream-1"), b"garbage".to_vec());
        a.acquire("stream-1", LEASE)
            .await
            .expect("corrupt lease should be replaced");
    }

    #[tokio::test]
    async fn acquire_with_wait_succeeds_after_release() {
        let (a, b, _clock, _store) = pair();
        let metrics =
            BrookMetrics::new(&prometheus::Registry::new()).expect("registration should succeed");
        let b = b
            .with_config(LockConfig {
                acquire_timeout: Duration::from_secs(5),
                poll_interval: Duration::from_millis(5),
            })
            .with_metrics(metrics.clone());

        let lease = a.acquire("stream-1", LEASE).await.expect("a acquires");
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            a.release(lease).await.expect("release");
        });

        b.acquire_with_wait("stream-1", LEASE)
            .await
            .expect("b acquires once a releases");
        releaser.await.expect("releaser task");
        assert!(metrics.lock_contention_waits() > 0);
        assert_eq!(metrics.lock_acquire_count("acquired"), 1.0);
    }

    #[tokio::test]
    async fn acquire_with_wait_gives_up_after_timeout() {
        let (a, b, _clock, _store) = pair();
        let b = b.with_config(LockConfig {
            acquire_timeout: Duration::from_millis(30),
            poll_interval: Duration::from_millis(5),
        });
        let _held = a.acquire("stream-1", LEASE).await.expect("a acquires");
        let result = b.acquire_with_wait("stream-1", LEASE).await;
        assert!(matches!(result, Err(LockError::Busy { .. })));
    }

    #[tokio::test]
    async fn release_after_external_delete_is_lease_lost() {
        let (a, _b, _clock, store) = pair();
        let lease = a.acquire("stream-1", LEASE).await.expect("acquire");
        store
            .delete(&KeyLayout::default().lock_key("stream-1"), Precondition::None)
            .await
            .expect("external delete");
        assert!(matches!(
            a.release(lease).await,
            Err(LockError::LeaseLost { .. })
        ));
    }
}
