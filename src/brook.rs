//! Append-only event log ("brook") per stream.
//!
//! Appends are serialized per stream by a lease from the
//! [`DistributedLock`] and made crash-safe by a two-phase cursor:
//!
//! 1. write a pending marker `{original_position, target_position}`
//!    only-if-absent;
//! 2. write each event document only-if-absent;
//! 3. advance the committed cursor conditionally on its tag;
//! 4. delete the pending marker.
//!
//! A crash between steps leaves a pending marker. The next lock holder
//! reconciles it: if every target event exists the cursor rolls forward,
//! otherwise the orphaned events are deleted. Readers never reconcile;
//! they clamp every range to the committed cursor so orphans are never
//! observed.

use std::time::{Duration, Instant};

use tracing::Instrument;

use crate::clock::SharedClock;
use crate::error::{BrookError, StorageError};
use crate::event::{CommittedCursorDoc, Cursor, EventRecord, NewEvent, PendingCursor, Position, StreamKey};
use crate::lock::{DistributedLock, Lease};
use crate::metrics::BrookMetrics;
use crate::storage::{ETag, KeyLayout, Precondition, SharedStore, delete_if_exists};

/// Tunables for [`EventLog`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use brook_es::BrookConfig;
///
/// let config = BrookConfig {
///     read_batch_size: 500,
///     ..BrookConfig::default()
/// };
/// assert_eq!(config.lock_duration, Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct BrookConfig {
    /// Default number of events fetched per storage round-trip.
    pub read_batch_size: usize,
    /// Lease duration requested for each append. Bounds how long a
    /// crashed writer can block the stream.
    pub lock_duration: Duration,
}

impl Default for BrookConfig {
    fn default() -> Self {
        Self {
            read_batch_size: 100,
            lock_duration: Duration::from_secs(30),
        }
    }
}

/// Result of reconciling a stream's pending marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No pending marker existed.
    Clean,
    /// The marker no longer matched the committed cursor and was removed.
    StaleCleared,
    /// Every target event existed; the cursor advanced to this position.
    RolledForward(Position),
    /// The interrupted append was incomplete; its events were deleted.
    Discarded,
}

#[derive(Debug, Clone, Copy)]
enum AppendOutcome {
    Committed,
    Idempotent,
    Empty,
}

impl AppendOutcome {
    fn label(self) -> &'static str {
        match self {
            AppendOutcome::Committed => "committed",
            AppendOutcome::Idempotent => "idempotent",
            AppendOutcome::Empty => "empty",
        }
    }
}

fn error_kind(err: &BrookError) -> &'static str {
    match err {
        BrookError::ConcurrencyConflict { .. } => "conflict",
        BrookError::PayloadTooLarge { .. } => "payload_too_large",
        BrookError::Encoding(_) => "encoding",
        BrookError::Lock(_) => "lock",
        BrookError::Storage(_) => "storage",
    }
}

/// Committed cursor as read from storage.
#[derive(Debug, Clone, Copy)]
struct CommittedState {
    position: Position,
    etag: Option<ETag>,
}

/// The event log over a [`DocumentStore`](DocumentStore).
///
/// Cheap to clone; clones share the store, lock client, and metrics.
#[derive(Debug, Clone)]
pub struct EventLog {
    store: SharedStore,
    layout: KeyLayout,
    lock: DistributedLock,
    clock: SharedClock,
    config: BrookConfig,
    metrics: Option<BrookMetrics>,
}

impl EventLog {
    /// Create an event log. `lock` should operate on the same backend.
    pub fn new(
        store: SharedStore,
        layout: KeyLayout,
        lock: DistributedLock,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            layout,
            lock,
            clock,
            config: BrookConfig::default(),
            metrics: None,
        }
    }

    /// Replace the tunables.
    pub fn with_config(mut self, config: BrookConfig) -> Self {
        self.config = config;
        self
    }

    /// Record append and read metrics.
    pub fn with_metrics(mut self, metrics: BrookMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Tunables in effect.
    pub fn config(&self) -> &BrookConfig {
        &self.config
    }

    /// Key layout used by this log.
    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    fn lock_resource(stream: &StreamKey) -> String {
        format!("brook:{stream}")
    }

    /// Append a batch of events.
    ///
    /// The first event lands at `expected.next()`; the returned position
    /// is the last one written. Retrying a batch that already committed
    /// (same event IDs at the same positions) returns its last position
    /// without writing anything.
    ///
    /// # Arguments
    ///
    /// * `stream` - Target stream.
    /// * `events` - Events to append, in order.
    /// * `expected` - Committed head the caller based its decision on.
    ///
    /// # Errors
    ///
    /// * [`BrookError::ConcurrencyConflict`] -- `expected` is stale.
    /// * [`BrookError::PayloadTooLarge`] -- an event exceeds the backend's
    ///   size limit; nothing is committed.
    /// * [`BrookError::Lock`] -- the stream lease could not be obtained,
    ///   or was lost mid-append; the cursor is left untouched.
    /// * [`BrookError::Storage`] -- the backend failed.
    pub async fn append(
        &self,
        stream: &StreamKey,
        events: Vec<NewEvent>,
        expected: Position,
    ) -> Result<Position, BrookError> {
        let span = tracing::info_span!(
            "append",
            stream = %stream,
            count = events.len(),
            expected = %expected
        );
        let started = Instant::now();
        let result = self
            .append_guarded(stream, events, expected)
            .instrument(span)
            .await;

        if let Some(metrics) = &self.metrics {
            let secs = started.elapsed().as_secs_f64();
            match &result {
                Ok((_, outcome)) => {
                    metrics.append_completed(stream.stream_type(), outcome.label(), secs);
                }
                Err(e) => {
                    metrics.append_failed(stream.stream_type(), error_kind(e));
                    metrics.append_completed(stream.stream_type(), "failed", secs);
                }
            }
        }
        result.map(|(position, _)| position)
    }

    async fn append_guarded(
        &self,
        stream: &StreamKey,
        events: Vec<NewEvent>,
        expected: Position,
    ) -> Result<(Position, AppendOutcome), BrookError> {
        let resource = Self::lock_resource(stream);
        let mut lease = self
            .lock
            .acquire_with_wait(&resource, self.config.lock_duration)
            .await?;

        let result = self.append_locked(stream, events, expected, &mut lease).await;

        if let Err(e) = self.lock.release(lease).await {
            tracing::warn!(stream = %stream, error = %e, "failed to release stream lease");
        }
        result
    }

    async fn append_locked(
        &self,
        stream: &StreamKey,
        events: Vec<NewEvent>,
        expected: Position,
        lease: &mut Lease,
    ) -> Result<(Position, AppendOutcome), BrookError> {
        let mut committed = self.read_committed(stream).await?;
        if let Some((pending, pending_etag)) = self.read_pending(stream).await? {
            let (_, reconciled) = self
                .reconcile(stream, committed, pending, pending_etag)
                .await?;
            committed = reconciled;
        }

        if events.is_empty() {
            return if committed.position == expected {
                Ok((committed.position, AppendOutcome::Empty))
            } else {
                Err(BrookError::ConcurrencyConflict {
                    stream: stream.clone(),
                    expected,
                    actual: committed.position,
                })
            };
        }

        let first = expected.next();
        let target = Position::at(first + events.len() as u64 - 1);

        if committed.position != expected {
            if committed.position >= target
                && self.batch_already_committed(stream, &events, first).await?
            {
                tracing::info!(position = %target, "batch already committed; treating retry as success");
                return Ok((target, AppendOutcome::Idempotent));
            }
            return Err(BrookError::ConcurrencyConflict {
                stream: stream.clone(),
                expected,
                actual: committed.position,
            });
        }

        // Phase 1: announce the append.
        let pending_key = self.layout.pending_key(stream);
        let marker = PendingCursor {
            original_position: committed.position,
            target_position: target,
        };
        let pending_etag = match self
            .store
            .put(&pending_key, serde_json::to_vec(&marker)?, Precondition::IfAbsent)
            .await
        {
            Ok(etag) => etag,
            Err(e) if e.is_precondition_failed() => {
                return Err(BrookError::ConcurrencyConflict {
                    stream: stream.clone(),
                    expected,
                    actual: committed.position,
                });
            }
            Err(e) => return Err(e.into()),
        };

        // Phase 2: write the events.
        let count = events.len();
        let timestamp_ms = self.clock.now_millis();
        for (i, event) in events.into_iter().enumerate() {
            let position = first + i as u64;
            let record = event.into_record(position, timestamp_ms);
            let data = serde_json::to_vec(&record)?;
            match self.write_event(stream, &record, data).await {
                Ok(()) => {}
                Err(StorageError::PayloadTooLarge { size, .. }) => {
                    self.abandon(stream, first, position, pending_etag).await;
                    return Err(BrookError::PayloadTooLarge {
                        stream: stream.clone(),
                        position,
                        size,
                    });
                }
                Err(e) => return Err(e.into()),
            }
            self.hold_lease(stream, lease).await?;
        }

        // Phase 3: commit, only while the lease is still ours.
        self.hold_lease(stream, lease).await?;
        self.write_committed(stream, committed, target).await?;

        // Phase 4: clear the marker. A leftover marker is stale and the
        // next lock holder removes it.
        if let Err(e) =
            delete_if_exists(self.store.as_ref(), &pending_key, Precondition::IfMatch(pending_etag)).await
        {
            tracing::warn!(stream = %stream, error = %e, "failed to clear pending marker after commit");
        }

        tracing::info!(position = %target, count, "events appended");
        Ok((target, AppendOutcome::Committed))
    }

    /// Extend the stream lease. A lost lease means another writer may have
    /// reconciled this append away, so the cursor must not be touched.
    async fn hold_lease(&self, stream: &StreamKey, lease: &mut Lease) -> Result<(), BrookError> {
        self.lock.renew(lease).await.map_err(|e| {
            tracing::warn!(stream = %stream, error = %e, "stream lease lost mid-append; aborting");
            BrookError::Lock(e)
        })
    }

    /// Write one event only-if-absent, accepting an identical retry and
    /// replacing an orphan left by an interrupted append.
    async fn write_event(
        &self,
        stream: &StreamKey,
        record: &EventRecord,
        data: Vec<u8>,
    ) -> Result<(), StorageError> {
        let key = self.layout.event_key(stream, record.position);
        match self.store.put(&key, data.clone(), Precondition::IfAbsent).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_precondition_failed() => {}
            Err(e) => return Err(e),
        }

        let precondition = match self.store.get(&key).await? {
            Some(existing) => {
                let same = serde_json::from_slice::<EventRecord>(&existing.data)
                    .is_ok_and(|stored| stored.event_id == record.event_id);
                if same {
                    return Ok(());
                }
                tracing::debug!(position = record.position, "replacing orphaned event");
                Precondition::IfMatch(existing.etag)
            }
            None => Precondition::IfAbsent,
        };
        self.store.put(&key, data, precondition).await.map(|_| ())
    }

    async fn write_committed(
        &self,
        stream: &StreamKey,
        committed: CommittedState,
        target: Position,
    ) -> Result<ETag, BrookError> {
        let key = self.layout.cursor_key(stream);
        let data = serde_json::to_vec(&CommittedCursorDoc { committed: target })?;
        let precondition = committed
            .etag
            .map_or(Precondition::IfAbsent, Precondition::IfMatch);
        match self.store.put(&key, data, precondition).await {
            Ok(etag) => Ok(etag),
            Err(e) if e.is_precondition_failed() => {
                // A retried write may already have landed.
                let now = self.read_committed(stream).await?;
                match now.etag {
                    Some(etag) if now.position == target => Ok(etag),
                    _ => Err(BrookError::ConcurrencyConflict {
                        stream: stream.clone(),
                        expected: committed.position,
                        actual: now.position,
                    }),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove events `[first, failed)` and the pending marker after a
    /// permanent write failure.
    async fn abandon(&self, stream: &StreamKey, first: u64, failed: u64, pending_etag: ETag) {
        for position in first..failed {
            let key = self.layout.event_key(stream, position);
            if let Err(e) = delete_if_exists(self.store.as_ref(), &key, Precondition::None).await {
                tracing::warn!(position, error = %e, "failed to remove event of abandoned append");
            }
        }
        let pending_key = self.layout.pending_key(stream);
        if let Err(e) =
            delete_if_exists(self.store.as_ref(), &pending_key, Precondition::IfMatch(pending_etag)).await
        {
            tracing::warn!(error = %e, "failed to clear pending marker of abandoned append");
        }
    }

    async fn batch_already_committed(
        &self,
        stream: &StreamKey,
        events: &[NewEvent],
        first: u64,
    ) -> Result<bool, BrookError> {
        let last = first + events.len() as u64 - 1;
        let stored = self.scan_records(stream, first, last).await?;
        Ok(stored.len() == events.len()
            && stored
                .iter()
                .zip(events)
                .all(|(stored, proposed)| stored.event_id == proposed.event_id))
    }

    async fn reconcile(
        &self,
        stream: &StreamKey,
        committed: CommittedState,
        pending: PendingCursor,
        pending_etag: ETag,
    ) -> Result<(RecoveryOutcome, CommittedState), BrookError> {
        let pending_key = self.layout.pending_key(stream);

        if pending.original_position != committed.position {
            delete_if_exists(self.store.as_ref(), &pending_key, Precondition::IfMatch(pending_etag))
                .await?;
            tracing::info!(stream = %stream, "cleared stale pending marker");
            return Ok((RecoveryOutcome::StaleCleared, committed));
        }

        let first = pending.original_position.next();
        let expected_count = match pending.target_position.offset() {
            Some(last) if last >= first => last - first + 1,
            _ => 0,
        };
        let present = if expected_count == 0 {
            Vec::new()
        } else {
            let from = self.layout.event_key(stream, first);
            let to = self.layout.event_key(stream, first + expected_count - 1);
            self.store
                .scan(
                    &self.layout.events_prefix(stream),
                    Some(&from),
                    Some(&to),
                    expected_count as usize,
                )
                .await?
                .into_iter()
                .map(|(key, _)| key)
                .collect()
        };

        if expected_count > 0 && present.len() as u64 == expected_count {
            let etag = self
                .write_committed(stream, committed, pending.target_position)
                .await?;
            delete_if_exists(self.store.as_ref(), &pending_key, Precondition::IfMatch(pending_etag))
                .await?;
            tracing::info!(
                stream = %stream,
                position = %pending.target_position,
                "rolled forward interrupted append"
            );
            return Ok((
                RecoveryOutcome::RolledForward(pending.target_position),
                CommittedState {
                    position: pending.target_position,
                    etag: Some(etag),
                },
            ));
        }

        for key in &present {
            delete_if_exists(self.store.as_ref(), key, Precondition::None).await?;
        }
        delete_if_exists(self.store.as_ref(), &pending_key, Precondition::IfMatch(pending_etag))
            .await?;
        tracing::warn!(
            stream = %stream,
            orphans = present.len(),
            "discarded interrupted append"
        );
        Ok((RecoveryOutcome::Discarded, committed))
    }

    /// Reconcile the stream's pending marker under its lease.
    ///
    /// Appends do this implicitly; call it to repair a stream eagerly.
    ///
    /// # Errors
    ///
    /// [`BrookError::Lock`] if the lease cannot be obtained;
    /// [`BrookError::Storage`] if the backend failed.
    pub async fn recover(&self, stream: &StreamKey) -> Result<RecoveryOutcome, BrookError> {
        let resource = Self::lock_resource(stream);
        let lease = self
            .lock
            .acquire_with_wait(&resource, self.config.lock_duration)
            .await?;

        let result = async {
            let committed = self.read_committed(stream).await?;
            match self.read_pending(stream).await? {
                None => Ok(RecoveryOutcome::Clean),
                Some((pending, etag)) => self
                    .reconcile(stream, committed, pending, etag)
                    .await
                    .map(|(outcome, _)| outcome),
            }
        }
        .await;

        if let Err(e) = self.lock.release(lease).await {
            tracing::warn!(stream = %stream, error = %e, "failed to release stream lease");
        }
        result
    }

    async fn read_committed(&self, stream: &StreamKey) -> Result<CommittedState, BrookError> {
        match self.store.get(&self.layout.cursor_key(stream)).await? {
            None => Ok(CommittedState {
                position: Position::NOT_SET,
                etag: None,
            }),
            Some(doc) => {
                let cursor: CommittedCursorDoc = serde_json::from_slice(&doc.data)?;
                Ok(CommittedState {
                    position: cursor.committed,
                    etag: Some(doc.etag),
                })
            }
        }
    }

    async fn read_pending(
        &self,
        stream: &StreamKey,
    ) -> Result<Option<(PendingCursor, ETag)>, BrookError> {
        match self.store.get(&self.layout.pending_key(stream)).await? {
            None => Ok(None),
            Some(doc) => Ok(Some((serde_json::from_slice(&doc.data)?, doc.etag))),
        }
    }

    /// Committed head of the stream (`NOT_SET` for a new stream).
    ///
    /// Never reconciles a pending marker.
    ///
    /// # Errors
    ///
    /// [`BrookError::Storage`] or a cursor decoding failure.
    pub async fn head_position(&self, stream: &StreamKey) -> Result<Position, BrookError> {
        Ok(self.read_committed(stream).await?.position)
    }

    /// Committed head plus any pending marker, for inspection.
    ///
    /// # Errors
    ///
    /// [`BrookError::Storage`] or a cursor decoding failure.
    pub async fn cursor(&self, stream: &StreamKey) -> Result<Cursor, BrookError> {
        let committed = self.read_committed(stream).await?.position;
        let pending = self.read_pending(stream).await?.map(|(pending, _)| pending);
        Ok(Cursor { committed, pending })
    }

    /// `true` if an event document exists at `position`, committed or not.
    ///
    /// # Errors
    ///
    /// [`BrookError::Storage`] if the backend failed.
    pub async fn event_exists(&self, stream: &StreamKey, position: u64) -> Result<bool, BrookError> {
        Ok(self
            .store
            .get(&self.layout.event_key(stream, position))
            .await?
            .is_some())
    }

    /// Delete the event document at `position`. Missing is success.
    ///
    /// # Errors
    ///
    /// [`BrookError::Storage`] if the backend failed.
    pub async fn delete_event(&self, stream: &StreamKey, position: u64) -> Result<(), BrookError> {
        delete_if_exists(
            self.store.as_ref(),
            &self.layout.event_key(stream, position),
            Precondition::None,
        )
        .await?;
        Ok(())
    }

    /// Lazy, restartable range `[start, end]` in ascending order.
    ///
    /// `end = None` reads to the committed head. The end is clamped to the
    /// committed head on the first pull.
    pub fn read_range(
        &self,
        stream: &StreamKey,
        start: u64,
        end: Option<u64>,
        batch_size: usize,
    ) -> EventRange {
        EventRange {
            log: self.clone(),
            stream: stream.clone(),
            next: start,
            end,
            batch_size: batch_size.max(1),
            clamped: false,
        }
    }

    /// Every committed event, using the configured batch size.
    pub fn read_all(&self, stream: &StreamKey) -> EventRange {
        self.read_range(stream, 0, None, self.config.read_batch_size)
    }

    async fn scan_records(
        &self,
        stream: &StreamKey,
        first: u64,
        last: u64,
    ) -> Result<Vec<EventRecord>, BrookError> {
        let from = self.layout.event_key(stream, first);
        let to = self.layout.event_key(stream, last);
        let limit = (last - first + 1) as usize;
        let docs = self
            .store
            .scan(&self.layout.events_prefix(stream), Some(&from), Some(&to), limit)
            .await?;
        docs.into_iter()
            .map(|(_, doc)| serde_json::from_slice::<EventRecord>(&doc.data).map_err(BrookError::from))
            .collect()
    }
}

/// A caller-pulled range of committed events.
///
/// Each [`next_batch`](Self::next_batch) is one storage round-trip.
#[derive(Debug)]
pub struct EventRange {
    log: EventLog,
    stream: StreamKey,
    next: u64,
    end: Option<u64>,
    batch_size: usize,
    clamped: bool,
}

impl EventRange {
    /// Fetch the next batch, or `None` once the range is exhausted.
    ///
    /// # Errors
    ///
    /// [`BrookError::Storage`] if the backend failed, including
    /// [`StorageError::Corrupt`] when a committed event is missing.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<EventRecord>>, BrookError> {
        if !self.clamped {
            let head = self.log.head_position(&self.stream).await?;
            self.end = match (head.offset(), self.end) {
                (None, _) => None,
                (Some(head), Some(end)) => Some(head.min(end)),
                (Some(head), None) => Some(head),
            };
            self.clamped = true;
        }
        let Some(end) = self.end else {
            return Ok(None);
        };
        if self.next > end {
            return Ok(None);
        }

        let started = Instant::now();
        let last = end.min(self.next + self.batch_size as u64 - 1);
        let records = self.log.scan_records(&self.stream, self.next, last).await?;

        let expected = (last - self.next + 1) as usize;
        if records.len() != expected
            || records
                .iter()
                .enumerate()
                .any(|(i, r)| r.position != self.next + i as u64)
        {
            let missing = records
                .iter()
                .enumerate()
                .find(|(i, r)| r.position != self.next + *i as u64)
                .map_or(self.next + records.len() as u64, |(i, _)| self.next + i as u64);
            return Err(StorageError::Corrupt {
                key: self.log.layout.event_key(&self.stream, missing),
                reason: "committed event is missing".to_string(),
            }
            .into());
        }

        if let Some(metrics) = &self.log.metrics {
            metrics.read_completed(self.stream.stream_type(), started.elapsed().as_secs_f64());
        }
        self.next = last + 1;
        Ok(Some(records))
    }

    /// Drain the remaining range into one vector.
    ///
    /// # Errors
    ///
    /// Same as [`next_batch`](Self::next_batch).
    pub async fn collect_all(mut self) -> Result<Vec<EventRecord>, BrookError> {
        let mut all = Vec::new();
        while let Some(batch) = self.next_batch().await? {
            all.extend(batch);
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::clock::ManualClock;
    use crate::error::LockError;
    use crate::storage::{Document, DocumentStore, MemoryStore};

    fn stream() -> StreamKey {
        StreamKey::new("bank", "account", "acc-1")
    }

    fn log_over(store: &MemoryStore) -> EventLog {
        let shared: SharedStore = Arc::new(store.clone());
        let clock: SharedClock = Arc::new(ManualClock::new(1_700_000_000_000));
        let lock = DistributedLock::new(
            Arc::clone(&shared),
            KeyLayout::default(),
            Arc::clone(&clock),
            "test-node",
        );
        EventLog::new(shared, KeyLayout::default(), lock, clock)
    }

    fn events(n: usize) -> Vec<NewEvent> {
        (0..n)
            .map(|i| NewEvent::new("Noted", json!({ "n": i })))
            .collect()
    }

    fn raw_record(position: u64, event_id: Uuid) -> Vec<u8> {
        let record = NewEvent::new("Noted", json!({ "n": position }))
            .with_event_id(event_id)
            .into_record(position, 0);
        serde_json::to_vec(&record).expect("serialize record")
    }

    fn write_pending(store: &MemoryStore, original: Position, target: Position) {
        let marker = PendingCursor {
            original_position: original,
            target_position: target,
        };
        store.insert_raw(
            KeyLayout::default().pending_key(&stream()),
            serde_json::to_vec(&marker).expect("serialize marker"),
        );
    }

    fn write_cursor(store: &MemoryStore, committed: Position) {
        store.insert_raw(
            KeyLayout::default().cursor_key(&stream()),
            serde_json::to_vec(&CommittedCursorDoc { committed }).expect("serialize cursor"),
        );
    }

    #[tokio::test]
    async fn append_to_new_stream_returns_last_position() {
        let store = MemoryStore::new();
        let log = log_over(&store);
        let s = stream();

        assert_eq!(log.head_position(&s).await.expect("head"), Position::NOT_SET);
        let last = log
            .append(&s, events(3), Position::NOT_SET)
            .await
            .expect("append should succeed");
        assert_eq!(last, Position::at(2));
        assert_eq!(log.head_position(&s).await.expect("head"), Position::at(2));

        let next = log
            .append(&s, events(2), Position::at(2))
            .await
            .expect("second append should succeed");
        assert_eq!(next, Position::at(4));

        let all = log.read_all(&s).collect_all().await.expect("read");
        let positions: Vec<u64> = all.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![0, 1, 2, 3, 4]);
        assert!(all.iter().all(|r| r.timestamp_ms == 1_700_000_000_000));

        let cursor = log.cursor(&s).await.expect("cursor");
        assert_eq!(cursor.pending, None, "marker is cleared after commit");
        assert!(
            store.keys().iter().all(|k| !k.starts_with("locks/")),
            "lease is released after append"
        );
    }

    #[tokio::test]
    async fn stale_expected_position_conflicts() {
        let store = MemoryStore::new();
        let log = log_over(&store);
        let s = stream();
        log.append(&s, events(2), Position::NOT_SET)
            .await
            .expect("first append");

        let err = log
            .append(&s, events(1), Position::at(0))
            .await
            .expect_err("stale expected should conflict");
        match err {
            BrookError::ConcurrencyConflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, Position::at(0));
                assert_eq!(actual, Position::at(1));
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        let ahead = log.append(&s, events(1), Position::at(9)).await;
        assert!(matches!(ahead, Err(BrookError::ConcurrencyConflict { .. })));
    }

    #[tokio::test]
    async fn retried_batch_is_idempotent() {
        let store = MemoryStore::new();
        let log = log_over(&store);
        let s = stream();
        let batch = events(2);

        let first = log
            .append(&s, batch.clone(), Position::NOT_SET)
            .await
            .expect("first append");
        let retry = log
            .append(&s, batch, Position::NOT_SET)
            .await
            .expect("retry should be idempotent");
        assert_eq!(first, retry);
        assert_eq!(log.head_position(&s).await.expect("head"), Position::at(1));
        assert_eq!(
            store
                .list_keys(&KeyLayout::default().events_prefix(&s))
                .await
                .expect("list")
                .len(),
            2,
            "retry must not duplicate events"
        );

        // Same positions but different event IDs is a real conflict.
        let other = log.append(&s, events(2), Position::NOT_SET).await;
        assert!(matches!(other, Err(BrookError::ConcurrencyConflict { .. })));
    }

    #[tokio::test]
    async fn empty_batch_checks_expected_only() {
        let store = MemoryStore::new();
        let log = log_over(&store);
        let s = stream();
        assert_eq!(
            log.append(&s, Vec::new(), Position::NOT_SET)
                .await
                .expect("empty append at head"),
            Position::NOT_SET
        );
        let err = log.append(&s, Vec::new(), Position::at(3)).await;
        assert!(matches!(err, Err(BrookError::ConcurrencyConflict { .. })));
    }

    #[tokio::test]
    async fn recovery_rolls_forward_complete_append() {
        let store = MemoryStore::new();
        let log = log_over(&store);
        let s = stream();
        let layout = KeyLayout::default();

        write_pending(&store, Position::NOT_SET, Position::at(1));
        store.insert_raw(layout.event_key(&s, 0), raw_record(0, Uuid::new_v4()));
        store.insert_raw(layout.event_key(&s, 1), raw_record(1, Uuid::new_v4()));

        assert_eq!(
            log.head_position(&s).await.expect("head"),
            Position::NOT_SET,
            "reads do not reconcile"
        );
        let outcome = log.recover(&s).await.expect("recover");
        assert_eq!(outcome, RecoveryOutcome::RolledForward(Position::at(1)));
        assert_eq!(log.head_position(&s).await.expect("head"), Position::at(1));
        assert_eq!(log.cursor(&s).await.expect("cursor").pending, None);
        assert_eq!(
            log.recover(&s).await.expect("second recover"),
            RecoveryOutcome::Clean
        );
    }

    #[tokio::test]
    async fn recovery_discards_incomplete_append() {
        let store = MemoryStore::new();
        let log = log_over(&store);
        let s = stream();
        let layout = KeyLayout::default();

        write_pending(&store, Position::NOT_SET, Position::at(2));
        store.insert_raw(layout.event_key(&s, 0), raw_record(0, Uuid::new_v4()));

        let outcome = log.recover(&s).await.expect("recover");
        assert_eq!(outcome, RecoveryOutcome::Discarded);
        assert_eq!(log.head_position(&s).await.expect("head"), Position::NOT_SET);
        assert!(!log.event_exists(&s, 0).await.expect("exists"));
        assert_eq!(log.cursor(&s).await.expect("cursor").pending, None);
    }

    #[tokio::test]
    async fn stale_marker_is_cleared() {
        let store = MemoryStore::new();
        let log = log_over(&store);
        let s = stream();
        let layout = KeyLayout::default();

        for pos in 0..2 {
            store.insert_raw(layout.event_key(&s, pos), raw_record(pos, Uuid::new_v4()));
        }
        write_cursor(&store, Position::at(1));
        // Phase 3 finished but phase 4 did not.
        write_pending(&store, Position::NOT_SET, Position::at(1));

        let outcome = log.recover(&s).await.expect("recover");
        assert_eq!(outcome, RecoveryOutcome::StaleCleared);
        assert_eq!(log.head_position(&s).await.expect("head"), Position::at(1));
    }

    #[tokio::test]
    async fn next_append_reconciles_and_replaces_orphans() {
        let store = MemoryStore::new();
        let log = log_over(&store);
        let s = stream();
        let layout = KeyLayout::default();
        let orphan_id = Uuid::new_v4();

        write_pending(&store, Position::NOT_SET, Position::at(1));
        store.insert_raw(layout.event_key(&s, 0), raw_record(0, orphan_id));

        let batch = events(1);
        let new_id = batch[0].event_id;
        let last = log
            .append(&s, batch, Position::NOT_SET)
            .await
            .expect("append should reconcile first");
        assert_eq!(last, Position::at(0));

        let all = log.read_all(&s).collect_all().await.expect("read");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].event_id, new_id);
        assert_ne!(all[0].event_id, orphan_id);
    }

    #[tokio::test]
    async fn reads_never_observe_orphans() {
        let store = MemoryStore::new();
        let log = log_over(&store);
        let s = stream();
        let layout = KeyLayout::default();

        log.append(&s, events(2), Position::NOT_SET)
            .await
            .expect("append");
        write_pending(&store, Position::at(1), Position::at(3));
        store.insert_raw(layout.event_key(&s, 2), raw_record(2, Uuid::new_v4()));

        let all = log.read_all(&s).collect_all().await.expect("read");
        assert_eq!(all.len(), 2, "orphan beyond the head is invisible");
        let explicit = log
            .read_range(&s, 0, Some(10), 5)
            .collect_all()
            .await
            .expect("read");
        assert_eq!(explicit.len(), 2);
        assert!(
            log.cursor(&s).await.expect("cursor").pending.is_some(),
            "readers leave the marker to the next writer"
        );
    }

    #[tokio::test]
    async fn ranges_are_batched_and_restartable() {
        let store = MemoryStore::new();
        let log = log_over(&store);
        let s = stream();
        log.append(&s, events(25), Position::NOT_SET)
            .await
            .expect("append");

        let mut range = log.read_range(&s, 0, None, 10);
        let mut sizes = Vec::new();
        while let Some(batch) = range.next_batch().await.expect("batch") {
            sizes.push(batch.len());
        }
        assert_eq!(sizes, vec![10, 10, 5]);

        let tail = log
            .read_range(&s, 20, Some(22), 100)
            .collect_all()
            .await
            .expect("read");
        let positions: Vec<u64> = tail.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![20, 21, 22]);

        let empty = log
            .read_all(&StreamKey::new("bank", "account", "none"))
            .collect_all()
            .await
            .expect("read");
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn missing_committed_event_is_reported() {
        let store = MemoryStore::new();
        let log = log_over(&store);
        let s = stream();
        log.append(&s, events(3), Position::NOT_SET)
            .await
            .expect("append");
        log.delete_event(&s, 1).await.expect("delete");
        log.delete_event(&s, 1).await.expect("deleting twice is fine");

        let err = log
            .read_all(&s)
            .collect_all()
            .await
            .expect_err("gap should be reported");
        assert!(matches!(
            err,
            BrookError::Storage(StorageError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn oversized_event_fails_without_committing() {
        let store = MemoryStore::with_max_document_size(400);
        let log = log_over(&store);
        let s = stream();
        let batch = vec![
            NewEvent::new("Small", json!({})),
            NewEvent::new("Huge", json!({ "blob": "x".repeat(1_000) })),
        ];

        let err = log
            .append(&s, batch, Position::NOT_SET)
            .await
            .expect_err("oversized event should fail");
        match &err {
            BrookError::PayloadTooLarge { position, .. } => assert_eq!(*position, 1),
            other => panic!("expected PayloadTooLarge, got {other:?}"),
        }
        assert!(err.to_string().contains("smaller"));

        let cursor = log.cursor(&s).await.expect("cursor");
        assert_eq!(cursor.committed, Position::NOT_SET);
        assert_eq!(cursor.pending, None);
        assert!(!log.event_exists(&s, 0).await.expect("exists"));
    }

    #[tokio::test]
    async fn concurrent_appends_at_same_position_admit_one() {
        let store = MemoryStore::new();
        let log = log_over(&store);
        let s = stream();

        let a = {
            let log = log.clone();
            let s = s.clone();
            tokio::spawn(async move { log.append(&s, events(1), Position::NOT_SET).await })
        };
        let b = {
            let log = log.clone();
            let s = s.clone();
            tokio::spawn(async move { log.append(&s, events(1), Position::NOT_SET).await })
        };
        let results = [a.await.expect("task a"), b.await.expect("task b")];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(BrookError::ConcurrencyConflict { .. })))
            .count();
        assert_eq!((ok, conflicts), (1, 1));
        assert_eq!(log.head_position(&s).await.expect("head"), Position::at(0));
    }

    #[tokio::test]
    async fn metrics_record_outcomes() {
        let store = MemoryStore::new();
        let metrics =
            BrookMetrics::new(&prometheus::Registry::new()).expect("registration should succeed");
        let log = log_over(&store).with_metrics(metrics.clone());
        let s = stream();

        log.append(&s, events(1), Position::NOT_SET)
            .await
            .expect("append");
        let _ = log.append(&s, events(1), Position::NOT_SET).await;
        log.read_all(&s).collect_all().await.expect("read");

        assert_eq!(metrics.append_count("account", "committed"), 1.0);
        assert_eq!(metrics.append_failure_count("account", "conflict"), 1.0);
        assert_eq!(metrics.read_count("account"), 1.0);
    }

    /// Lets a second writer expire and steal the stream lease while the
    /// first writer is storing the event at `trigger_key`.
    #[derive(Debug)]
    struct StealDuringPut {
        inner: MemoryStore,
        clock: ManualClock,
        trigger_key: String,
        rival: std::sync::Mutex<Option<EventLog>>,
        rival_outcome: std::sync::Mutex<Option<RecoveryOutcome>>,
    }

    #[async_trait::async_trait]
    impl DocumentStore for StealDuringPut {
        async fn get(&self, key: &str) -> Result<Option<Document>, StorageError> {
            self.inner.get(key).await
        }

        async fn put(
            &self,
            key: &str,
            data: Vec<u8>,
            precondition: Precondition,
        ) -> Result<ETag, StorageError> {
            if key == self.trigger_key {
                let rival = self.rival.lock().expect("rival lock").take();
                if let Some(rival) = rival {
                    self.clock.advance(Duration::from_secs(31));
                    let outcome = rival.recover(&stream()).await.expect("rival recover");
                    *self.rival_outcome.lock().expect("outcome lock") = Some(outcome);
                }
            }
            self.inner.put(key, data, precondition).await
        }

        async fn delete(&self, key: &str, precondition: Precondition) -> Result<(), StorageError> {
            self.inner.delete(key, precondition).await
        }

        async fn scan(
            &self,
            prefix: &str,
            from: Option<&str>,
            to: Option<&str>,
            limit: usize,
        ) -> Result<Vec<(String, Document)>, StorageError> {
            self.inner.scan(prefix, from, to, limit).await
        }

        async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
            self.inner.list_keys(prefix).await
        }
    }

    #[tokio::test]
    async fn lease_lost_mid_append_leaves_cursor_untouched() {
        let memory = MemoryStore::new();
        let clock = ManualClock::new(1_700_000_000_000);
        let shared_clock: SharedClock = Arc::new(clock.clone());
        let s = stream();

        let rival_store: SharedStore = Arc::new(memory.clone());
        let rival = EventLog::new(
            Arc::clone(&rival_store),
            KeyLayout::default(),
            DistributedLock::new(
                rival_store,
                KeyLayout::default(),
                Arc::clone(&shared_clock),
                "rival",
            ),
            Arc::clone(&shared_clock),
        );

        let interloper = Arc::new(StealDuringPut {
            inner: memory.clone(),
            clock: clock.clone(),
            trigger_key: KeyLayout::default().event_key(&s, 1),
            rival: std::sync::Mutex::new(Some(rival)),
            rival_outcome: std::sync::Mutex::new(None),
        });
        let slow: SharedStore = Arc::clone(&interloper) as SharedStore;
        let writer = EventLog::new(
            Arc::clone(&slow),
            KeyLayout::default(),
            DistributedLock::new(
                Arc::clone(&slow),
                KeyLayout::default(),
                Arc::clone(&shared_clock),
                "slow-writer",
            ),
            Arc::clone(&shared_clock),
        );

        let err = writer
            .append(&s, events(3), Position::NOT_SET)
            .await
            .expect_err("append must not commit after losing its lease");
        assert!(matches!(err, BrookError::Lock(LockError::LeaseLost { .. })));
        assert!(err.is_conflict());
        assert_eq!(
            *interloper.rival_outcome.lock().expect("outcome lock"),
            Some(RecoveryOutcome::Discarded)
        );

        let plain = log_over(&memory);
        assert_eq!(plain.head_position(&s).await.expect("head"), Position::NOT_SET);
        assert!(plain.read_all(&s).collect_all().await.expect("read").is_empty());

        // The stream stays writable; the leftover orphan is replaced.
        let last = plain
            .append(&s, events(2), Position::NOT_SET)
            .await
            .expect("append after lost lease");
        assert_eq!(last, Position::at(1));
        assert_eq!(plain.read_all(&s).collect_all().await.expect("read").len(), 2);
    }
}
