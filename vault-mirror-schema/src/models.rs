// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::schema::{checkpoints, deposits, withdraw_requests};
use diesel::prelude::*;

/// One row per `(transaction_hash, log_index)`. Never updated.
#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = deposits, check_for_backend(diesel::pg::Pg))]
pub struct Deposit {
    pub transaction_hash: String,
    pub log_index: i64,
    pub user_address: String,
    /// uint256 as a decimal string
    pub amount: String,
    pub block_number: i64,
    pub block_timestamp: i64,
}

/// Latest request per user
#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = withdraw_requests, check_for_backend(diesel::pg::Pg))]
pub struct WithdrawRequest {
    pub user_address: String,
    pub amount: String,
    pub unlock_time: i64,
    /// `PENDING` or `COMPLETED`
    pub status: String,
    pub block_number: i64,
    pub log_index: i64,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = checkpoints)]
pub struct NewCheckpoint<'a> {
    pub event_kind: &'a str,
    pub last_processed_block: i64,
}
