//! Building projection snapshots from the event log.
//!
//! [`SnapshotGenerator`] finds the nearest retained snapshot below the
//! requested version, replays the remaining events through the
//! projection's [`RootReducer`], and persists the result (plus any
//! retention checkpoints crossed on the way).

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::brook::EventLog;
use crate::codec::CodecRegistry;
use crate::error::{CodecError, ProjectionError, SnapshotError};
use crate::event::{Position, StreamKey};
use crate::metrics::BrookMetrics;
use crate::projection::Projection;
use crate::reducer::RootReducer;
use crate::snapshot::{
    RetentionPolicy, SnapshotEnvelope, SnapshotKey, SnapshotStore, SnapshotStreamKey,
    find_base_version,
};

/// Projection state as of one stream position.
#[derive(Debug)]
pub struct ProjectionSnapshot<P> {
    /// Last event position folded in, or [`Position::NOT_SET`].
    pub version: Position,
    /// `"<projection_type>/<projection_id>"`.
    pub projection_path: String,
    /// Source stream, as `domain/type/id`.
    pub aggregate_root_path: String,
    /// Hash of the reducer composition that produced `data`.
    pub reducer_hash: String,
    /// The projection state.
    pub data: Arc<P>,
}

/// Something that can produce a snapshot at a given version.
///
/// The cache actor depends on this rather than on [`SnapshotGenerator`]
/// directly.
#[async_trait]
pub trait SnapshotBuilder<P>: Send + Sync {
    /// Build (or load) the snapshot of `projection_id` at `target`.
    async fn build(
        &self,
        stream: &StreamKey,
        projection_id: &str,
        target: Position,
    ) -> Result<ProjectionSnapshot<P>, ProjectionError>;
}

enum Loaded<P> {
    Found(Arc<P>),
    Missing,
    HashMismatch,
}

/// Builds snapshots for projection `P`.
pub struct SnapshotGenerator<P> {
    log: EventLog,
    snapshots: SnapshotStore,
    codecs: CodecRegistry,
    retention: RetentionPolicy,
    reducer: Arc<RootReducer<P>>,
    metrics: Option<BrookMetrics>,
}

impl<P> Clone for SnapshotGenerator<P> {
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
            snapshots: self.snapshots.clone(),
            codecs: self.codecs.clone(),
            retention: self.retention.clone(),
            reducer: Arc::clone(&self.reducer),
            metrics: self.metrics.clone(),
        }
    }
}

impl<P> fmt::Debug for SnapshotGenerator<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotGenerator")
            .field("reducer", &self.reducer)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl<P: Projection> SnapshotGenerator<P> {
    /// Create a generator using `P::reducer()`, JSON encoding, and the
    /// default retention policy.
    pub fn new(log: EventLog, snapshots: SnapshotStore) -> Self {
        Self {
            log,
            snapshots,
            codecs: CodecRegistry::default(),
            retention: RetentionPolicy::default(),
            reducer: Arc::new(P::reducer()),
            metrics: None,
        }
    }

    /// Replace the codec registry.
    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// Replace the retention policy.
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Record build metrics.
    pub fn with_metrics(mut self, metrics: BrookMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Hash of the reducer composition in use.
    pub fn reducer_hash(&self) -> &str {
        self.reducer.reducer_hash()
    }

    /// Build the snapshot of `projection_id` at `target`.
    ///
    /// The returned version is `target` unless the log's head is behind
    /// it, in which case the snapshot is taken at the head.
    ///
    /// # Errors
    ///
    /// * [`ProjectionError::Brook`] -- reading events failed.
    /// * [`ProjectionError::Reducer`] -- a reducer broke the fold contract.
    /// * [`ProjectionError::Snapshot`] -- reading a stored snapshot failed.
    pub async fn build(
        &self,
        stream: &StreamKey,
        projection_id: &str,
        target: Position,
    ) -> Result<ProjectionSnapshot<P>, ProjectionError> {
        let span = tracing::info_span!(
            "build_snapshot",
            stream = %stream,
            projection_type = P::PROJECTION_TYPE,
            projection_id,
            target = %target
        );
        self.build_inner(stream, projection_id, target)
            .instrument(span)
            .await
    }

    /// Build in a detached task; failures are logged.
    pub fn background_build(
        &self,
        stream: &StreamKey,
        projection_id: &str,
        target: Position,
    ) -> JoinHandle<()> {
        let generator = self.clone();
        let stream = stream.clone();
        let projection_id = projection_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = generator.build(&stream, &projection_id, target).await {
                tracing::warn!(
                    stream = %stream,
                    projection_type = P::PROJECTION_TYPE,
                    projection_id = %projection_id,
                    target = %target,
                    error = %e,
                    "background snapshot build failed"
                );
            }
        })
    }

    async fn build_inner(
        &self,
        stream: &StreamKey,
        projection_id: &str,
        target: Position,
    ) -> Result<ProjectionSnapshot<P>, ProjectionError> {
        let family = SnapshotStreamKey::new(
            stream.clone(),
            P::PROJECTION_TYPE,
            projection_id,
            self.reducer.reducer_hash(),
        );
        let Some(target_offset) = target.offset() else {
            return Ok(self.snapshot(&family, Position::NOT_SET, Arc::new(P::default())));
        };

        let started = Instant::now();
        let modulus = self.retention.modulus_for(P::PROJECTION_TYPE);
        let (base, mut state) = match self.load(&family.at(target_offset)).await? {
            Loaded::Found(state) => {
                tracing::debug!(version = target_offset, "exact snapshot found");
                return Ok(self.snapshot(&family, target, state));
            }
            Loaded::HashMismatch => (None, Arc::new(P::default())),
            Loaded::Missing if target_offset == 0 => (None, Arc::new(P::default())),
            Loaded::Missing => self.find_base(&family, target_offset, modulus).await?,
        };

        let mut reached = base;
        let mut replayed: u64 = 0;
        let mut range = self.log.read_range(
            stream,
            base.map_or(0, |b| b + 1),
            Some(target_offset),
            self.log.config().read_batch_size,
        );
        while let Some(batch) = range.next_batch().await? {
            for event in &batch {
                state = self.reducer.reduce(state, event)?;
                replayed += 1;
                reached = Some(event.position);
                if event.position < target_offset && event.position % modulus == 0 {
                    self.persist_logged(&family.at(event.position), &state).await;
                }
            }
        }

        let version = reached.map_or(Position::NOT_SET, Position::at);
        if let Some(reached) = reached
            && replayed > 0
        {
            self.persist_logged(&family.at(reached), &state).await;
            if let Err(e) = self.snapshots.prune(&family, &[modulus]).await {
                tracing::warn!(family = %family, error = %e, "snapshot prune failed");
            }
        }

        let secs = started.elapsed().as_secs_f64();
        if let Some(metrics) = &self.metrics {
            metrics.snapshot_built(P::PROJECTION_TYPE, secs, replayed);
        }
        tracing::debug!(
            base = ?base,
            version = %version,
            replayed,
            secs,
            "snapshot built"
        );
        Ok(self.snapshot(&family, version, state))
    }

    /// Walk back from the computed base one modulus at a time until a
    /// usable snapshot is found; fall back to the empty state.
    async fn find_base(
        &self,
        family: &SnapshotStreamKey,
        target: u64,
        modulus: u64,
    ) -> Result<(Option<u64>, Arc<P>), ProjectionError> {
        let mut candidate = find_base_version(target, modulus);
        loop {
            match self.load(&family.at(candidate)).await? {
                Loaded::Found(state) => return Ok((Some(candidate), state)),
                Loaded::HashMismatch => break,
                Loaded::Missing => {}
            }
            if candidate == 0 {
                break;
            }
            candidate = candidate.saturating_sub(modulus);
        }
        Ok((None, Arc::new(P::default())))
    }

    async fn load(&self, key: &SnapshotKey) -> Result<Loaded<P>, ProjectionError> {
        let envelope = match self.snapshots.read(key).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return Ok(Loaded::Missing),
            Err(SnapshotError::Corrupt { key, source }) => {
                tracing::warn!(key = %key, error = %source, "corrupt snapshot; treating as missing");
                return Ok(Loaded::Missing);
            }
            Err(e) => return Err(e.into()),
        };

        if envelope.reducer_hash != self.reducer.reducer_hash() {
            tracing::warn!(
                family = %key.family,
                version = key.version,
                stored = %envelope.reducer_hash,
                current = %self.reducer.reducer_hash(),
                "reducer hash mismatch; rebuilding from the start"
            );
            if let Some(metrics) = &self.metrics {
                metrics.reducer_hash_mismatch(P::PROJECTION_TYPE);
            }
            return Ok(Loaded::HashMismatch);
        }

        match self.decode(&envelope) {
            Ok(state) => Ok(Loaded::Found(Arc::new(state))),
            Err(e) => {
                tracing::warn!(
                    family = %key.family,
                    version = key.version,
                    error = %e,
                    "undecodable snapshot; treating as missing"
                );
                Ok(Loaded::Missing)
            }
        }
    }

    fn decode(&self, envelope: &SnapshotEnvelope) -> Result<P, CodecError> {
        let value = self
            .codecs
            .get(&envelope.content_type)?
            .decode(&envelope.data)?;
        Ok(serde_json::from_value(value)?)
    }

    fn encode(&self, state: &P) -> Result<SnapshotEnvelope, CodecError> {
        let codec = self.codecs.preferred();
        let value = serde_json::to_value(state)?;
        Ok(SnapshotEnvelope {
            content_type: codec.content_type().to_string(),
            reducer_hash: self.reducer.reducer_hash().to_string(),
            data: codec.encode(&value)?,
        })
    }

    async fn persist(&self, key: &SnapshotKey, state: &P) -> Result<(), ProjectionError> {
        let envelope = self.encode(state)?;
        self.snapshots.write(key, &envelope).await?;
        Ok(())
    }

    /// A failed write only costs a later build some replay.
    async fn persist_logged(&self, key: &SnapshotKey, state: &P) {
        if let Err(e) = self.persist(key, state).await {
            tracing::warn!(
                family = %key.family,
                version = key.version,
                error = %e,
                "snapshot persist failed"
            );
        }
    }

    fn snapshot(
        &self,
        family: &SnapshotStreamKey,
        version: Position,
        data: Arc<P>,
    ) -> ProjectionSnapshot<P> {
        ProjectionSnapshot {
            version,
            projection_path: family.projection_path(),
            aggregate_root_path: family.stream.to_string(),
            reducer_hash: family.reducer_hash.clone(),
            data,
        }
    }
}

#[async_trait]
impl<P: Projection> SnapshotBuilder<P> for SnapshotGenerator<P> {
    async fn build(
        &self,
        stream: &StreamKey,
        projection_id: &str,
        target: Position,
    ) -> Result<ProjectionSnapshot<P>, ProjectionError> {
        SnapshotGenerator::build(self, stream, projection_id, target).await
    }
}

#[cfg(test)]
mod tests {
    use prometheus::Registry;

    use super::*;
    use crate::error::ReducerError;
    use crate::storage::{KeyLayout, MemoryStore, SharedStore};
    use crate::test_fixtures::{
        AccountBalance, FundsDeposited, account, deposit, memory_log, opened, withdrawal,
    };

    struct Harness {
        log: EventLog,
        snapshots: SnapshotStore,
        metrics: BrookMetrics,
        memory: MemoryStore,
    }

    fn harness() -> Harness {
        let (log, memory) = memory_log();
        let store: SharedStore = Arc::new(memory.clone());
        let metrics = BrookMetrics::new(&Registry::new()).expect("metrics should register");
        let snapshots =
            SnapshotStore::new(store, KeyLayout::default()).with_metrics(metrics.clone());
        Harness {
            log,
            snapshots,
            metrics,
            memory,
        }
    }

    fn generator(h: &Harness, modulus: u64) -> SnapshotGenerator<AccountBalance> {
        SnapshotGenerator::new(h.log.clone(), h.snapshots.clone())
            .with_retention(RetentionPolicy {
                default_modulus: modulus,
                ..RetentionPolicy::default()
            })
            .with_metrics(h.metrics.clone())
    }

    async fn append_deposits(h: &Harness, count: usize) -> Position {
        let stream = account("acc-1");
        let mut head = h.log.head_position(&stream).await.expect("head");
        for _ in 0..count {
            head = h
                .log
                .append(&stream, vec![deposit(10)], head)
                .await
                .expect("append should succeed");
        }
        head
    }

    fn family(generator: &SnapshotGenerator<AccountBalance>) -> SnapshotStreamKey {
        SnapshotStreamKey::new(
            account("acc-1"),
            "account-balance",
            "acc-1",
            generator.reducer_hash(),
        )
    }

    #[tokio::test]
    async fn not_set_target_is_the_default_state() {
        let h = harness();
        let generator = generator(&h, 10);
        let snapshot = generator
            .build(&account("acc-1"), "acc-1", Position::NOT_SET)
            .await
            .expect("build should succeed");
        assert_eq!(snapshot.version, Position::NOT_SET);
        assert_eq!(*snapshot.data, AccountBalance::default());
        assert!(h.memory.keys().iter().all(|k| !k.starts_with("snapshots/")));
    }

    #[tokio::test]
    async fn builds_bank_balance_and_describes_itself() {
        let h = harness();
        let stream = account("acc-1");
        let head = h
            .log
            .append(
                &stream,
                vec![opened("ada", 100), deposit(50), withdrawal(20)],
                Position::NOT_SET,
            )
            .await
            .expect("append should succeed");

        let generator = generator(&h, 100);
        let snapshot = generator
            .build(&stream, "acc-1", head)
            .await
            .expect("build should succeed");
        assert_eq!(snapshot.version, Position::at(2));
        assert_eq!(snapshot.data.balance, 130);
        assert!(snapshot.data.is_open);
        assert_eq!(snapshot.projection_path, "account-balance/acc-1");
        assert_eq!(snapshot.aggregate_root_path, "bank/account/acc-1");
        assert_eq!(snapshot.reducer_hash, generator.reducer_hash());
        assert_eq!(h.metrics.events_replayed_total("account-balance"), 3.0);
    }

    #[tokio::test]
    async fn exact_snapshot_is_returned_without_replay() {
        let h = harness();
        let head = append_deposits(&h, 3).await;
        let generator = generator(&h, 100);
        generator
            .build(&account("acc-1"), "acc-1", head)
            .await
            .expect("first build");
        let replayed = h.metrics.events_replayed_total("account-balance");

        let again = generator
            .build(&account("acc-1"), "acc-1", head)
            .await
            .expect("second build");
        assert_eq!(again.data.balance, 30);
        assert_eq!(h.metrics.events_replayed_total("account-balance"), replayed);
        assert_eq!(h.metrics.snapshot_build_count("account-balance"), 1);
    }

    #[tokio::test]
    async fn later_builds_resume_from_a_retained_checkpoint() {
        let h = harness();
        let generator = generator(&h, 2);
        let head = append_deposits(&h, 5).await;
        generator
            .build(&account("acc-1"), "acc-1", head)
            .await
            .expect("first build");
        assert_eq!(
            h.snapshots.versions(&family(&generator)).await.expect("versions"),
            vec![0, 2, 4]
        );

        let head = append_deposits(&h, 2).await;
        let before = h.metrics.events_replayed_total("account-balance");
        let snapshot = generator
            .build(&account("acc-1"), "acc-1", head)
            .await
            .expect("second build");
        assert_eq!(snapshot.version, Position::at(6));
        assert_eq!(snapshot.data.balance, 70);
        assert_eq!(h.metrics.events_replayed_total("account-balance") - before, 2.0);
    }

    #[tokio::test]
    async fn pruned_base_falls_back_one_modulus() {
        let h = harness();
        let generator = generator(&h, 2);
        append_deposits(&h, 5).await;
        generator
            .build(&account("acc-1"), "acc-1", Position::at(4))
            .await
            .expect("first build");
        h.snapshots
            .delete(&family(&generator).at(4))
            .await
            .expect("delete");

        let head = append_deposits(&h, 2).await;
        let before = h.metrics.events_replayed_total("account-balance");
        let snapshot = generator
            .build(&account("acc-1"), "acc-1", head)
            .await
            .expect("build after prune");
        assert_eq!(snapshot.data.balance, 70);
        assert_eq!(h.metrics.events_replayed_total("account-balance") - before, 4.0);
    }

    #[tokio::test]
    async fn corrupt_base_is_skipped() {
        let h = harness();
        let generator = generator(&h, 2);
        let head = append_deposits(&h, 4).await;
        let fam = family(&generator);
        let key = KeyLayout::snapshot_version_key(
            &KeyLayout::default().snapshot_family_prefix(
                &fam.stream,
                &fam.projection_type,
                &fam.projection_id,
                &fam.reducer_hash,
            ),
            2,
        );
        h.memory.insert_raw(key, b"garbage".to_vec());

        let snapshot = generator
            .build(&account("acc-1"), "acc-1", head)
            .await
            .expect("build should succeed");
        assert_eq!(snapshot.data.balance, 40);
    }

    #[tokio::test]
    async fn hash_mismatch_forces_full_rebuild() {
        let h = harness();
        let generator = generator(&h, 2);
        let head = append_deposits(&h, 3).await;
        let forged = SnapshotEnvelope {
            content_type: "application/json".into(),
            reducer_hash: "stale-hash".into(),
            data: br#"{"balance":9999,"is_open":true,"owner":null}"#.to_vec(),
        };
        h.snapshots
            .write(&family(&generator).at(2), &forged)
            .await
            .expect("write forged");

        let snapshot = generator
            .build(&account("acc-1"), "acc-1", head)
            .await
            .expect("build should succeed");
        assert_eq!(snapshot.data.balance, 30);
        assert_eq!(h.metrics.reducer_hash_mismatch_count("account-balance"), 1.0);
        assert_eq!(h.metrics.events_replayed_total("account-balance"), 3.0);
    }

    #[tokio::test]
    async fn target_beyond_head_is_clamped() {
        let h = harness();
        append_deposits(&h, 2).await;
        let snapshot = generator(&h, 100)
            .build(&account("acc-1"), "acc-1", Position::at(50))
            .await
            .expect("build should succeed");
        assert_eq!(snapshot.version, Position::at(1));
        assert_eq!(snapshot.data.balance, 20);
    }

    #[tokio::test]
    async fn immutability_violation_fails_the_build() {
        #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
        struct Broken;

        impl Projection for Broken {
            const PROJECTION_TYPE: &'static str = "broken";

            fn reducer() -> RootReducer<Self> {
                RootReducer::builder()
                    .register(crate::reducer::shared_reducer(
                        |s: &Arc<Broken>, _: &FundsDeposited| Arc::clone(s),
                    ))
                    .build()
            }
        }

        let h = harness();
        let head = append_deposits(&h, 1).await;
        let err = SnapshotGenerator::<Broken>::new(h.log.clone(), h.snapshots.clone())
            .build(&account("acc-1"), "acc-1", head)
            .await
            .expect_err("build should fail");
        assert!(matches!(
            err,
            ProjectionError::Reducer(ReducerError::ImmutabilityViolation { .. })
        ));
    }

    #[tokio::test]
    async fn background_build_persists_snapshot() {
        let h = harness();
        let head = append_deposits(&h, 3).await;
        let generator = generator(&h, 100);
        generator
            .background_build(&account("acc-1"), "acc-1", head)
            .await
            .expect("task should not panic");
        assert_eq!(
            h.snapshots.versions(&family(&generator)).await.expect("versions"),
            vec![0, 2]
        );
    }
}
