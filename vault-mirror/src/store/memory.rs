// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-process store. Nothing survives a restart.

use crate::checkpoint::{check_advance, CheckpointStore};
use crate::store::{
    DepositRecord, InsertOutcome, RecordStore, StoreError, WithdrawRequestRecord,
};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use vault_ledger::EventKind;

#[derive(Default)]
struct DepositTable {
    rows: HashMap<(String, u64), DepositRecord>,
    by_user: HashMap<String, Vec<(String, u64)>>,
}

/// Records and checkpoints held in memory behind `RwLock`s
#[derive(Default)]
pub struct MemoryStore {
    deposits: RwLock<DepositTable>,
    withdraw_requests: RwLock<HashMap<String, WithdrawRequestRecord>>,
    checkpoints: RwLock<HashMap<EventKind, u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn deposit_count(&self) -> usize {
        self.deposits.read().await.rows.len()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_deposit(&self, record: DepositRecord) -> Result<InsertOutcome, StoreError> {
        let mut table = self.deposits.write().await;
        let key = record.identity();
        if table.rows.contains_key(&key) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        table
            .by_user
            .entry(record.user.clone())
            .or_default()
            .push(key.clone());
        table.rows.insert(key, record);
        Ok(InsertOutcome::Inserted)
    }

    async fn upsert_withdraw_request(
        &self,
        record: WithdrawRequestRecord,
    ) -> Result<(), StoreError> {
        self.withdraw_requests
            .write()
            .await
            .insert(record.user.clone(), record);
        Ok(())
    }

    async fn query_history(&self, user: &str) -> Result<Vec<DepositRecord>, StoreError> {
        let table = self.deposits.read().await;
        let mut history: Vec<DepositRecord> = table
            .by_user
            .get(user)
            .into_iter()
            .flatten()
            .filter_map(|key| table.rows.get(key).cloned())
            .collect();
        history.sort_by(|a, b| {
            (b.block_number, b.log_index).cmp(&(a.block_number, a.log_index))
        });
        Ok(history)
    }

    async fn get_withdraw_request(
        &self,
        user: &str,
    ) -> Result<Option<WithdrawRequestRecord>, StoreError> {
        Ok(self.withdraw_requests.read().await.get(user).cloned())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn get(&self, kind: EventKind) -> Result<u64, StoreError> {
        Ok(self
            .checkpoints
            .read()
            .await
            .get(&kind)
            .copied()
            .unwrap_or(0))
    }

    async fn advance(&self, kind: EventKind, to_block: u64) -> Result<(), StoreError> {
        let mut checkpoints = self.checkpoints.write().await;
        let current = checkpoints.get(&kind).copied().unwrap_or(0);
        if check_advance(kind, current, to_block)? {
            checkpoints.insert(kind, to_block);
        }
        Ok(())
    }
}
