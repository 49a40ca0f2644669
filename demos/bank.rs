//! Self-contained demo of appends, projections, and version notifications
//! against an in-memory backend.
//!
//! Run with: `cargo run --example bank`
//!
//! Set `RUST_LOG=brook_es=debug` to watch snapshot builds.

use std::sync::Arc;

use brook_es::reducer::reducer;
use brook_es::{
    BroadcastRelay, DomainEvent, EventContext, EventStore, LocalGroups, NewEvent,
    NotificationHub, Position, Projection, RetentionPolicy, RootReducer, StreamKey, metrics,
};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

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

// ---------------------------------------------------------------------------
// AccountBalance projection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AccountBalance {
    balance: i64,
    is_open: bool,
    owner: Option<String>,
}

impl Projection for AccountBalance {
    const PROJECTION_TYPE: &'static str = "account-balance";

    fn reducer() -> RootReducer<Self> {
        RootReducer::builder()
            .register(reducer(|_: &AccountBalance, e: &AccountOpened| AccountBalance {
                balance: e.initial_deposit,
                is_open: true,
                owner: Some(e.owner.clone()),
            }))
            .register(reducer(|s: &AccountBalance, e: &FundsDeposited| AccountBalance {
                balance: s.balance + e.amount,
                ..s.clone()
            }))
            .register(reducer(|s: &AccountBalance, e: &FundsWithdrawn| AccountBalance {
                balance: s.balance - e.amount,
                ..s.clone()
            }))
            .build()
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("brook_es=info")),
        )
        .init();

    // A local hub stands in for a websocket gateway.
    let groups = LocalGroups::new();
    let hub = NotificationHub::start(
        Arc::new(groups.clone()),
        Arc::new(BroadcastRelay::default()),
    );
    let (connection, mut notifications) = groups.connect();
    hub.subscribe(connection, AccountBalance::PROJECTION_TYPE, "acc-1")
        .await;

    let store = EventStore::builder()
        .namespace("demo")
        .retention(RetentionPolicy::default().with_override(AccountBalance::PROJECTION_TYPE, 2))
        .hub(hub)
        .notify::<AccountBalance>("account")
        .build()?;

    let stream = StreamKey::new("bank", "account", "acc-1");
    let ctx = EventContext::default().with_actor("demo-runner");

    let head = store
        .append(
            &stream,
            vec![
                NewEvent::from_domain(&AccountOpened {
                    owner: "ada".into(),
                    initial_deposit: 100,
                })?
                .with_context(&ctx),
                NewEvent::from_domain(&FundsDeposited { amount: 50 })?.with_context(&ctx),
            ],
            Position::NOT_SET,
        )
        .await?;
    let head = store
        .append(
            &stream,
            vec![NewEvent::from_domain(&FundsWithdrawn { amount: 20 })?.with_context(&ctx)],
            head,
        )
        .await?;

    while let Ok(Some(change)) =
        tokio::time::timeout(std::time::Duration::from_millis(100), notifications.next()).await
    {
        println!(
            "notified: {} {} now at {}",
            change.projection_type, change.entity_id, change.version
        );
    }

    let balance = store.projection::<AccountBalance>(&stream).await.get().await?;
    println!(
        "{} has {} at version {} (reducer {})",
        balance.data.owner.as_deref().unwrap_or("?"),
        balance.data.balance,
        balance.version,
        &balance.reducer_hash[..12]
    );

    assert_eq!(balance.version, head);
    assert_eq!(balance.data.balance, 130);
    assert!(balance.data.is_open);

    println!("{}", metrics::encode_text(store.registry())?);
    Ok(())
}
