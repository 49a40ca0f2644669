//! Bank-account scenarios exercising the full stack through the public API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use brook_es::reducer::reducer;
use brook_es::storage::{Document, ETag, Precondition};
use brook_es::{
    BrookError, CacheConfig, DocumentStore, DomainEvent, EventStore, FsStore, KeyLayout,
    LockError, ManualClock, MemoryStore, NewEvent, Position, Projection, RecoveryOutcome,
    RetryPolicy, RootReducer, SharedClock, StorageError, StreamKey,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccountOpened {
    owner: String,
    initial_deposit: i64,
}

impl DomainEvent for AccountOpened {
    const EVENT_TYPE: &'static str = "AccountOpened";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FundsDeposited {
    amount: i64,
}

impl DomainEvent for FundsDeposited {
    const EVENT_TYPE: &'static str = "FundsDeposited";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FundsWithdrawn {
    amount: i64,
}

impl DomainEvent for FundsWithdrawn {
    const EVENT_TYPE: &'static str = "FundsWithdrawn";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Balance {
    balance: i64,
    is_open: bool,
}

impl Projection for Balance {
    const PROJECTION_TYPE: &'static str = "balance";

    fn reducer() -> RootReducer<Self> {
        RootReducer::builder()
            .register(reducer(|_: &Balance, e: &AccountOpened| Balance {
                balance: e.initial_deposit,
                is_open: true,
            }))
            .register(reducer(|s: &Balance, e: &FundsDeposited| Balance {
                balance: s.balance + e.amount,
                ..s.clone()
            }))
            .register(reducer(|s: &Balance, e: &FundsWithdrawn| Balance {
                balance: s.balance - e.amount,
                ..s.clone()
            }))
            .build()
    }
}

fn account(id: &str) -> StreamKey {
    StreamKey::new("bank", "account", id)
}

fn history() -> Vec<NewEvent> {
    vec![
        NewEvent::from_domain(&AccountOpened {
            owner: "ada".into(),
            initial_deposit: 100,
        })
        .expect("serialize"),
        NewEvent::from_domain(&FundsDeposited { amount: 50 }).expect("serialize"),
        NewEvent::from_domain(&FundsWithdrawn { amount: 20 }).expect("serialize"),
    ]
}

fn quick_retries() -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        ..RetryPolicy::default()
    }
}

#[tokio::test]
async fn balance_is_folded_and_cached() {
    let store = EventStore::builder()
        .retry_policy(quick_retries())
        .build()
        .expect("store should build");
    let stream = account("acc-1");

    let head = store
        .append(&stream, history(), Position::NOT_SET)
        .await
        .expect("append should succeed");
    assert_eq!(head, Position::at(2));

    let facade = store.projection::<Balance>(&stream).await;
    let snapshot = facade.get().await.expect("get should succeed");
    assert_eq!(snapshot.data.balance, 130);
    assert!(snapshot.data.is_open);
    assert_eq!(snapshot.version, head);
    assert_eq!(
        snapshot.reducer_hash,
        Balance::reducer().reducer_hash().to_string()
    );

    facade.get().await.expect("second get should succeed");
    assert_eq!(store.metrics().snapshot_build_count("balance"), 1);
}

#[tokio::test]
async fn stale_expected_position_conflicts() {
    let store = EventStore::builder()
        .retry_policy(quick_retries())
        .build()
        .expect("store should build");
    let stream = account("acc-1");
    store
        .append(&stream, history(), Position::NOT_SET)
        .await
        .expect("first append should succeed");

    let err = store
        .append(
            &stream,
            vec![NewEvent::from_domain(&FundsDeposited { amount: 1 }).expect("serialize")],
            Position::at(0),
        )
        .await
        .expect_err("stale position must be rejected");
    assert!(err.is_conflict());
    assert_eq!(
        store.log().head_position(&stream).await.expect("head"),
        Position::at(2)
    );
}

#[tokio::test]
async fn concurrent_writers_with_one_expectation_admit_one() {
    let store = EventStore::builder()
        .retry_policy(quick_retries())
        .build()
        .expect("store should build");
    let stream = account("acc-race");

    let mut tasks = Vec::new();
    for amount in 1..=4 {
        let store = store.clone();
        let stream = stream.clone();
        tasks.push(tokio::spawn(async move {
            store
                .append(
                    &stream,
                    vec![NewEvent::from_domain(&FundsDeposited { amount }).expect("serialize")],
                    Position::NOT_SET,
                )
                .await
        }));
    }

    let mut winners = 0;
    for task in tasks {
        match task.await.expect("task should not panic") {
            Ok(position) => {
                assert_eq!(position, Position::at(0));
                winners += 1;
            }
            Err(e) => assert!(e.is_conflict(), "unexpected error: {e}"),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn snapshots_survive_a_restart_on_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stream = account("acc-disk");

    let first = EventStore::builder()
        .backend(Arc::new(FsStore::new(dir.path())))
        .retry_policy(quick_retries())
        .build()
        .expect("store should build");
    first
        .append(&stream, history(), Position::NOT_SET)
        .await
        .expect("append should succeed");
    let built = first
        .projection::<Balance>(&stream)
        .await
        .get()
        .await
        .expect("get should succeed");
    assert_eq!(built.data.balance, 130);

    let second = EventStore::builder()
        .backend(Arc::new(FsStore::new(dir.path())))
        .retry_policy(quick_retries())
        .build()
        .expect("store should build");
    let reloaded = second
        .projection::<Balance>(&stream)
        .await
        .get()
        .await
        .expect("get should succeed");
    assert_eq!(reloaded.data, built.data);
    assert_eq!(second.metrics().snapshot_build_count("balance"), 0);
}

/// Backend that lets a second store recover the stream, after the lease
/// has expired, while the first store is writing `trigger_key`.
#[derive(Debug)]
struct RivalRecoversDuringPut {
    inner: MemoryStore,
    clock: ManualClock,
    trigger_key: String,
    rival: std::sync::Mutex<Option<EventStore>>,
    outcome: std::sync::Mutex<Option<RecoveryOutcome>>,
}

#[async_trait]
impl DocumentStore for RivalRecoversDuringPut {
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
                let outcome = rival
                    .log()
                    .recover(&account("acc-slow"))
                    .await
                    .expect("rival recover");
                *self.outcome.lock().expect("outcome lock") = Some(outcome);
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
async fn append_outliving_its_lease_does_not_commit() {
    let memory = MemoryStore::new();
    let clock = ManualClock::new(1_700_000_000_000);
    let shared_clock: SharedClock = Arc::new(clock.clone());
    let stream = account("acc-slow");

    let rival = EventStore::builder()
        .backend(Arc::new(memory.clone()))
        .clock(Arc::clone(&shared_clock))
        .holder("rival")
        .build()
        .expect("store should build");
    let backend = Arc::new(RivalRecoversDuringPut {
        inner: memory.clone(),
        clock,
        trigger_key: KeyLayout::default().event_key(&stream, 1),
        rival: std::sync::Mutex::new(Some(rival)),
        outcome: std::sync::Mutex::new(None),
    });
    let slow = EventStore::builder()
        .backend(Arc::clone(&backend) as Arc<dyn DocumentStore>)
        .clock(Arc::clone(&shared_clock))
        .holder("slow")
        .build()
        .expect("store should build");

    let err = slow
        .append(&stream, history(), Position::NOT_SET)
        .await
        .expect_err("a writer that lost its lease must not commit");
    assert!(matches!(err, BrookError::Lock(LockError::LeaseLost { .. })));
    assert_eq!(
        *backend.outcome.lock().expect("outcome lock"),
        Some(RecoveryOutcome::Discarded)
    );

    let reader = EventStore::builder()
        .backend(Arc::new(memory))
        .clock(shared_clock)
        .build()
        .expect("store should build");
    assert_eq!(
        reader.log().head_position(&stream).await.expect("head"),
        Position::NOT_SET
    );
    let events = reader
        .log()
        .read_all(&stream)
        .collect_all()
        .await
        .expect("the log must stay readable");
    assert!(events.is_empty());

    let head = reader
        .append(&stream, history(), Position::NOT_SET)
        .await
        .expect("the stream must stay writable");
    assert_eq!(head, Position::at(2));
    let balance = reader
        .projection::<Balance>(&stream)
        .await
        .get()
        .await
        .expect("get should succeed");
    assert_eq!(balance.data.balance, 130);
}

#[tokio::test]
async fn idle_projections_release_their_caches() {
    let store = EventStore::builder()
        .retry_policy(quick_retries())
        .cache_config(CacheConfig {
            idle_timeout: Duration::from_millis(50),
            ..CacheConfig::default()
        })
        .build()
        .expect("store should build");

    for id in ["acc-1", "acc-2", "acc-3"] {
        let stream = account(id);
        store
            .append(&stream, history(), Position::NOT_SET)
            .await
            .expect("append should succeed");
        store
            .projection::<Balance>(&stream)
            .await
            .get()
            .await
            .expect("get should succeed");
    }
    assert_eq!(store.cached_projections().await, 3);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.cached_projections().await, 0);

    let again = store
        .projection::<Balance>(&account("acc-2"))
        .await
        .get()
        .await
        .expect("get after eviction");
    assert_eq!(again.data.balance, 130);
    assert_eq!(store.cached_projections().await, 1);
}
