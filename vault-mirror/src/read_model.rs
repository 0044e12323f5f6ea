// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Query side of the mirror.
//!
//! Balances always come from the ledger itself. History and withdraw
//! requests come from the mirror and never touch the ledger.

use crate::store::{RecordStore, StoreError, WithdrawRequestRecord};
use ethers::types::Address;
use serde::Serialize;
use std::sync::Arc;
use vault_ledger::{format_address, BalanceSource, SourceError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("balance query failed: {0}")]
    StateQuery(#[source] SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One deposit as returned by [`ReadModel::get_history`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub user: String,
    pub amount: String,
    pub transaction_hash: String,
    pub block_number: u64,
    pub timestamp: u64,
}

pub struct ReadModel<B, R> {
    ledger: Arc<B>,
    records: Arc<R>,
}

impl<B: BalanceSource, R: RecordStore> ReadModel<B, R> {
    pub fn new(ledger: Arc<B>, records: Arc<R>) -> Self {
        Self { ledger, records }
    }

    /// The ledger's balance for `address`, as a decimal string. Not retried.
    pub async fn get_current_balance(&self, address: &str) -> Result<String, ReadError> {
        let user = parse_address(address)?;
        let balance = self
            .ledger
            .balance_of(user)
            .await
            .map_err(ReadError::StateQuery)?;
        Ok(balance.to_string())
    }

    /// Mirrored deposits of `address`, newest first.
    pub async fn get_history(&self, address: &str) -> Result<Vec<HistoryEntry>, ReadError> {
        let user = format_address(&parse_address(address)?);
        let records = self.records.query_history(&user).await?;
        Ok(records
            .into_iter()
            .map(|record| HistoryEntry {
                user: record.user,
                amount: record.amount,
                transaction_hash: record.transaction_hash,
                block_number: record.block_number,
                timestamp: record.block_timestamp,
            })
            .collect())
    }

    pub async fn get_withdraw_request(
        &self,
        address: &str,
    ) -> Result<Option<WithdrawRequestRecord>, ReadError> {
        let user = format_address(&parse_address(address)?);
        Ok(self.records.get_withdraw_request(&user).await?)
    }
}

/// `0x` followed by exactly 40 hex digits, any case
fn parse_address(address: &str) -> Result<Address, ReadError> {
    let trimmed = address.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| ReadError::InvalidAddress(address.to_string()))?;
    if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ReadError::InvalidAddress(address.to_string()));
    }
    hex.parse()
        .map_err(|_| ReadError::InvalidAddress(address.to_string()))
}
