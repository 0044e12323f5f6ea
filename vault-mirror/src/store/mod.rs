// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Durable mirror records and the stores that hold them.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use vault_ledger::EventKind;

pub mod memory;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgRecordStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositRecord {
    pub user: String,
    /// uint256 as a decimal string
    pub amount: String,
    pub transaction_hash: String,
    pub block_number: u64,
    pub block_timestamp: u64,
    pub log_index: u64,
}

impl DepositRecord {
    /// Deduplication key
    pub fn identity(&self) -> (String, u64) {
        (self.transaction_hash.clone(), self.log_index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WithdrawStatus {
    Pending,
    Completed,
}

impl WithdrawStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawStatus::Pending => "PENDING",
            WithdrawStatus::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for WithdrawStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WithdrawStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(WithdrawStatus::Pending),
            "COMPLETED" => Ok(WithdrawStatus::Completed),
            other => Err(StoreError::Backend(format!(
                "unknown withdraw status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawRequestRecord {
    pub user: String,
    pub amount: String,
    pub unlock_time: u64,
    pub status: WithdrawStatus,
    /// Ledger position of the request this row mirrors
    pub block_number: u64,
    pub log_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("checkpoint for {kind} cannot move backward from {current} to {requested}")]
    Regression {
        kind: EventKind,
        current: u64,
        requested: u64,
    },

    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<anyhow::Error> for StoreError {
    fn from(e: anyhow::Error) -> Self {
        StoreError::Backend(format!("{:#}", e))
    }
}

/// Write-side and query-side access to mirrored records
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert unless a record with the same `(transaction_hash, log_index)`
    /// exists. Existing records are never overwritten.
    async fn insert_deposit(&self, record: DepositRecord) -> Result<InsertOutcome, StoreError>;

    /// Replace whatever request the user had.
    async fn upsert_withdraw_request(&self, record: WithdrawRequestRecord)
        -> Result<(), StoreError>;

    /// Deposits of `user`, newest first by `(block_number, log_index)`.
    async fn query_history(&self, user: &str) -> Result<Vec<DepositRecord>, StoreError>;

    async fn get_withdraw_request(
        &self,
        user: &str,
    ) -> Result<Option<WithdrawRequestRecord>, StoreError>;
}
