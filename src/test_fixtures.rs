//! Shared bank-account fixtures for unit tests.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::brook::EventLog;
use crate::clock::{ManualClock, SharedClock};
use crate::event::{DomainEvent, EventRecord, NewEvent, StreamKey};
use crate::lock::DistributedLock;
use crate::projection::Projection;
use crate::reducer::{RootReducer, reducer};
use crate::storage::{KeyLayout, MemoryStore, SharedStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct AccountOpened {
    pub owner: String,
    pub initial_deposit: i64,
}

impl DomainEvent for AccountOpened {
    const EVENT_TYPE: &'static str = "AccountOpened";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct FundsDeposited {
    pub amount: i64,
}

impl DomainEvent for FundsDeposited {
    const EVENT_TYPE: &'static str = "FundsDeposited";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct FundsWithdrawn {
    pub amount: i64,
}

impl DomainEvent for FundsWithdrawn {
    const EVENT_TYPE: &'static str = "FundsWithdrawn";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct AccountBalance {
    pub balance: i64,
    pub is_open: bool,
    pub owner: Option<String>,
}

impl Projection for AccountBalance {
    const PROJECTION_TYPE: &'static str = "account-balance";

    fn reducer() -> RootReducer<Self> {
        RootReducer::builder()
            .register(reducer(|_: &AccountBalance, e: &AccountOpened| {
                AccountBalance {
                    balance: e.initial_deposit,
                    is_open: true,
                    owner: Some(e.owner.clone()),
                }
            }))
            .register(reducer(|s: &AccountBalance, e: &FundsDeposited| {
                AccountBalance {
                    balance: s.balance + e.amount,
                    ..s.clone()
                }
            }))
            .register(reducer(|s: &AccountBalance, e: &FundsWithdrawn| {
                AccountBalance {
                    balance: s.balance - e.amount,
                    ..s.clone()
                }
            }))
            .build()
    }
}

pub(crate) fn account(id: &str) -> StreamKey {
    StreamKey::new("bank", "account", id)
}

/// A committed record at `position` carrying `event`.
pub(crate) fn record<E: DomainEvent>(position: u64, event: &E) -> EventRecord {
    NewEvent::from_domain(event)
        .expect("fixture events serialize")
        .into_record(position, 1_000 + position)
}

pub(crate) fn deposit(amount: i64) -> NewEvent {
    NewEvent::from_domain(&FundsDeposited { amount }).expect("fixture events serialize")
}

pub(crate) fn opened(owner: &str, initial_deposit: i64) -> NewEvent {
    NewEvent::from_domain(&AccountOpened {
        owner: owner.to_string(),
        initial_deposit,
    })
    .expect("fixture events serialize")
}

pub(crate) fn withdrawal(amount: i64) -> NewEvent {
    NewEvent::from_domain(&FundsWithdrawn { amount }).expect("fixture events serialize")
}

/// An event log over a fresh in-memory store and a manual clock.
pub(crate) fn memory_log() -> (EventLog, MemoryStore) {
    let memory = MemoryStore::new();
    let store: SharedStore = Arc::new(memory.clone());
    let clock: SharedClock = Arc::new(ManualClock::new(1_000));
    let layout = KeyLayout::default();
    let lock = DistributedLock::new(
        Arc::clone(&store),
        layout.clone(),
        Arc::clone(&clock),
        "test-holder",
    );
    (EventLog::new(store, layout, lock, clock), memory)
}
