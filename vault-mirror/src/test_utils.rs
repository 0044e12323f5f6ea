// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Scripted ledger doubles and event builders for tests.

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vault_ledger::{
    BalanceSource, EventKind, EventPayload, EventSubscription, LedgerEvent, LedgerSource,
    MalformedEvent, RangeBatch, SourceError, SourceResult, SubscriptionItem,
};

pub const ALICE: &str = "0x00000000000000000000000000000000000A11CE";
pub const BOB: &str = "0x0000000000000000000000000000000000000B0B";

pub fn address(s: &str) -> Address {
    s.parse().unwrap()
}

fn tx_hash(block: u64, log_index: u64) -> H256 {
    H256::from_low_u64_be((block << 16) | log_index)
}

pub fn deposit_event(user: &str, block: u64, log_index: u64, amount: u64) -> LedgerEvent {
    LedgerEvent {
        actor: address(user),
        payload: EventPayload::Deposited {
            amount: U256::from(amount),
        },
        block_number: block,
        transaction_hash: tx_hash(block, log_index),
        log_index,
        block_timestamp: 1_700_000_000 + block * 12,
    }
}

pub fn withdraw_event(
    user: &str,
    block: u64,
    log_index: u64,
    amount: u64,
    unlock_time: u64,
) -> LedgerEvent {
    LedgerEvent {
        payload: EventPayload::WithdrawRequested {
            amount: U256::from(amount),
            unlock_time,
        },
        ..deposit_event(user, block, log_index, amount)
    }
}

pub fn malformed_at(kind: EventKind, block: u64) -> MalformedEvent {
    MalformedEvent {
        kind: Some(kind),
        block_number: Some(block),
        transaction_hash: Some(tx_hash(block, 99)),
        log_index: Some(99),
        reason: "abi decode failed".to_string(),
    }
}

/// Ledger whose history, head, live stream and failures are set by the test
#[derive(Default)]
pub struct MockLedgerSource {
    head: AtomicU64,
    history: Mutex<Vec<LedgerEvent>>,
    malformed: Mutex<Vec<MalformedEvent>>,
    range_failures: Mutex<HashMap<EventKind, usize>>,
    range_calls: Mutex<Vec<(EventKind, u64, u64)>>,
    subscriptions: Mutex<Vec<(Vec<EventKind>, mpsc::Sender<SubscriptionItem>)>>,
}

impl MockLedgerSource {
    pub fn new(head: u64) -> Self {
        let source = Self::default();
        source.set_head(head);
        source
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    /// Make an event visible to range queries
    pub fn add_history(&self, event: LedgerEvent) {
        self.history.lock().unwrap().push(event);
    }

    pub fn add_malformed(&self, malformed: MalformedEvent) {
        self.malformed.lock().unwrap().push(malformed);
    }

    /// Fail the next `count` range queries for `kind`
    pub fn fail_next_ranges(&self, kind: EventKind, count: usize) {
        self.range_failures.lock().unwrap().insert(kind, count);
    }

    pub fn range_calls(&self, kind: EventKind) -> Vec<(u64, u64)> {
        self.range_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, from, to)| (*from, *to))
            .collect()
    }

    pub fn subscribe_count(&self, kind: EventKind) -> usize {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .filter(|(kinds, _)| kinds.contains(&kind))
            .count()
    }

    /// Deliver `item` on the newest subscription covering `kind`
    pub async fn push_live(&self, kind: EventKind, item: SubscriptionItem) {
        let sender = self
            .subscriptions
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(kinds, _)| kinds.contains(&kind))
            .map(|(_, sender)| sender.clone())
            .expect("no subscription for kind");
        sender.send(item).await.expect("subscription closed");
    }
}

#[async_trait]
impl LedgerSource for MockLedgerSource {
    async fn subscribe(&self, kinds: &[EventKind]) -> SourceResult<EventSubscription> {
        let (tx, rx) = mpsc::channel(64);
        self.subscriptions
            .lock()
            .unwrap()
            .push((kinds.to_vec(), tx));
        Ok(EventSubscription::new(rx, CancellationToken::new()))
    }

    async fn query_range(
        &self,
        kind: EventKind,
        from_block: u64,
        to_block: u64,
    ) -> SourceResult<RangeBatch> {
        self.range_calls
            .lock()
            .unwrap()
            .push((kind, from_block, to_block));

        if let Some(remaining) = self.range_failures.lock().unwrap().get_mut(&kind) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SourceError::Rpc("scripted failure".to_string()));
            }
        }

        let in_range = |block: u64| from_block <= block && block <= to_block;
        let mut events: Vec<LedgerEvent> = self
            .history
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind() == kind && in_range(e.block_number))
            .cloned()
            .collect();
        vault_ledger::sort_by_position(&mut events);
        let malformed = self
            .malformed
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.kind == Some(kind) && m.block_number.map_or(false, in_range))
            .cloned()
            .collect();
        Ok(RangeBatch { events, malformed })
    }

    async fn current_head(&self) -> SourceResult<u64> {
        Ok(self.head.load(Ordering::SeqCst))
    }
}

/// Ledger balance double
#[derive(Default)]
pub struct MockBalanceSource {
    balances: Mutex<HashMap<Address, U256>>,
    failure: Mutex<Option<SourceError>>,
    calls: AtomicUsize,
}

impl MockBalanceSource {
    pub fn set_balance(&self, user: &str, balance: U256) {
        self.balances.lock().unwrap().insert(address(user), balance);
    }

    pub fn fail_with(&self, error: SourceError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BalanceSource for MockBalanceSource {
    async fn balance_of(&self, user: Address) -> SourceResult<U256> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(&user)
            .copied()
            .unwrap_or_default())
    }
}

/// Re-evaluate an async condition until it holds, failing the test after
/// five seconds.
macro_rules! wait_until {
    ($cond:expr) => {{
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while !($cond) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached: {}",
                stringify!($cond)
            );
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }};
}
pub(crate) use wait_until;
