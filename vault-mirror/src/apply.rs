// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Turning ledger events into mirror writes.

use crate::store::{
    DepositRecord, InsertOutcome, RecordStore, StoreError, WithdrawRequestRecord, WithdrawStatus,
};
use ethers::utils::format_ether;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use vault_ledger::{format_address, format_hash, EventKind, EventPayload, EventPosition, LedgerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplyOutcome {
    Inserted,
    AlreadyExists,
    Upserted,
    /// Older than a request already applied; not written
    Stale,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Inserted => "inserted",
            ApplyOutcome::AlreadyExists => "already_exists",
            ApplyOutcome::Upserted => "upserted",
            ApplyOutcome::Stale => "stale",
        }
    }
}

/// Write one event to the store.
pub async fn apply_event<R: RecordStore + ?Sized>(
    records: &R,
    event: &LedgerEvent,
) -> Result<ApplyOutcome, StoreError> {
    let user = format_address(&event.actor);
    let transaction_hash = format_hash(&event.transaction_hash);

    match &event.payload {
        EventPayload::Deposited { amount } => {
            let record = DepositRecord {
                user,
                amount: amount.to_string(),
                transaction_hash,
                block_number: event.block_number,
                block_timestamp: event.block_timestamp,
                log_index: event.log_index,
            };
            let (user, tx) = (record.user.clone(), record.transaction_hash.clone());
            match records.insert_deposit(record).await? {
                InsertOutcome::Inserted => {
                    info!(
                        "[Apply] deposit {} ETH by {} (tx {} #{}, block {})",
                        format_ether(*amount),
                        user,
                        tx,
                        event.log_index,
                        event.block_number
                    );
                    Ok(ApplyOutcome::Inserted)
                }
                InsertOutcome::AlreadyExists => {
                    info!(
                        "[Apply] deposit tx {} #{} already mirrored, skipping",
                        tx, event.log_index
                    );
                    Ok(ApplyOutcome::AlreadyExists)
                }
            }
        }
        EventPayload::WithdrawRequested {
            amount,
            unlock_time,
        } => {
            let record = WithdrawRequestRecord {
                user,
                amount: amount.to_string(),
                unlock_time: *unlock_time,
                status: WithdrawStatus::Pending,
                block_number: event.block_number,
                log_index: event.log_index,
            };
            info!(
                "[Apply] withdraw request {} ETH by {} unlocking at {} (block {})",
                format_ether(*amount),
                record.user,
                unlock_time,
                event.block_number
            );
            records.upsert_withdraw_request(record).await?;
            Ok(ApplyOutcome::Upserted)
        }
    }
}

const LATEST_REQUEST_CACHE_LIMIT: usize = 10_000;

/// Applies events for a single worker, remembering per user the position of
/// the newest withdraw request already in the store.
///
/// A withdraw request at or below that position is reported as
/// [`ApplyOutcome::Stale`] instead of overwriting the newer row. Requests of
/// other users are unaffected.
pub struct EventApplier<R: ?Sized> {
    records: Arc<R>,
    latest_requests: HashMap<String, EventPosition>,
}

impl<R: RecordStore + ?Sized> EventApplier<R> {
    pub fn new(records: Arc<R>) -> Self {
        Self {
            records,
            latest_requests: HashMap::new(),
        }
    }

    /// Position of the newest request applied for `user`, falling back to
    /// the stored row on a cache miss.
    pub async fn latest_request(&mut self, user: &str) -> Result<Option<EventPosition>, StoreError> {
        if let Some(position) = self.latest_requests.get(user) {
            return Ok(Some(*position));
        }
        let stored = self
            .records
            .get_withdraw_request(user)
            .await?
            .map(|row| EventPosition::new(row.block_number, row.log_index));
        if let Some(position) = stored {
            self.remember(user.to_string(), position);
        }
        Ok(stored)
    }

    pub async fn apply(&mut self, event: &LedgerEvent) -> Result<ApplyOutcome, StoreError> {
        if event.kind() != EventKind::WithdrawRequested {
            return apply_event(self.records.as_ref(), event).await;
        }

        let user = format_address(&event.actor);
        let position = event.position();
        if let Some(latest) = self.latest_request(&user).await? {
            if position <= latest {
                debug!(
                    "[Apply] skipping stale withdraw request by {} at {} (newest {})",
                    user, position, latest
                );
                return Ok(ApplyOutcome::Stale);
            }
        }

        let outcome = apply_event(self.records.as_ref(), event).await?;
        self.remember(user, position);
        Ok(outcome)
    }

    fn remember(&mut self, user: String, position: EventPosition) {
        if self.latest_requests.len() >= LATEST_REQUEST_CACHE_LIMIT {
            self.latest_requests.clear();
        }
        self.latest_requests.insert(user, position);
    }
}
