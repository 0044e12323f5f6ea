// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! PostgreSQL-backed [`RecordStore`].

use crate::store::{
    DepositRecord, InsertOutcome, RecordStore, StoreError, WithdrawRequestRecord,
};
use anyhow::Context;
use async_trait::async_trait;
use diesel::upsert::excluded;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use tracing::debug;
use vault_mirror_pg_db::Db;
use vault_mirror_schema::models::{Deposit, WithdrawRequest};
use vault_mirror_schema::schema::{deposits, withdraw_requests};

#[derive(Clone)]
pub struct PgRecordStore {
    db: Db,
}

impl PgRecordStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

impl From<DepositRecord> for Deposit {
    fn from(record: DepositRecord) -> Self {
        Deposit {
            transaction_hash: record.transaction_hash,
            log_index: record.log_index as i64,
            user_address: record.user,
            amount: record.amount,
            block_number: record.block_number as i64,
            block_timestamp: record.block_timestamp as i64,
        }
    }
}

impl From<Deposit> for DepositRecord {
    fn from(row: Deposit) -> Self {
        DepositRecord {
            user: row.user_address,
            amount: row.amount,
            transaction_hash: row.transaction_hash,
            block_number: row.block_number as u64,
            block_timestamp: row.block_timestamp as u64,
            log_index: row.log_index as u64,
        }
    }
}

impl From<WithdrawRequestRecord> for WithdrawRequest {
    fn from(record: WithdrawRequestRecord) -> Self {
        WithdrawRequest {
            user_address: record.user,
            amount: record.amount,
            unlock_time: record.unlock_time as i64,
            status: record.status.as_str().to_string(),
            block_number: record.block_number as i64,
            log_index: record.log_index as i64,
        }
    }
}

impl TryFrom<WithdrawRequest> for WithdrawRequestRecord {
    type Error = StoreError;

    fn try_from(row: WithdrawRequest) -> Result<Self, Self::Error> {
        Ok(WithdrawRequestRecord {
            status: row.status.parse()?,
            user: row.user_address,
            amount: row.amount,
            unlock_time: row.unlock_time as u64,
            block_number: row.block_number as u64,
            log_index: row.log_index as u64,
        })
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn insert_deposit(&self, record: DepositRecord) -> Result<InsertOutcome, StoreError> {
        let row = Deposit::from(record);
        let mut conn = self.db.connect().await?;
        let inserted = diesel::insert_into(deposits::table)
            .values(&row)
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .await
            .context("Failed to insert deposit")?;

        if inserted == 0 {
            debug!(
                "[PgStore] deposit {}#{} already present",
                row.transaction_hash, row.log_index
            );
            Ok(InsertOutcome::AlreadyExists)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn upsert_withdraw_request(
        &self,
        record: WithdrawRequestRecord,
    ) -> Result<(), StoreError> {
        use withdraw_requests::dsl;

        let row = WithdrawRequest::from(record);
        let mut conn = self.db.connect().await?;
        diesel::insert_into(dsl::withdraw_requests)
            .values(&row)
            .on_conflict(dsl::user_address)
            .do_update()
            .set((
                dsl::amount.eq(excluded(dsl::amount)),
                dsl::unlock_time.eq(excluded(dsl::unlock_time)),
                dsl::status.eq(excluded(dsl::status)),
                dsl::block_number.eq(excluded(dsl::block_number)),
                dsl::log_index.eq(excluded(dsl::log_index)),
            ))
            .execute(&mut conn)
            .await
            .context("Failed to upsert withdraw request")?;
        Ok(())
    }

    async fn query_history(&self, user: &str) -> Result<Vec<DepositRecord>, StoreError> {
        use deposits::dsl;

        let mut conn = self.db.connect().await?;
        let rows: Vec<Deposit> = dsl::deposits
            .filter(dsl::user_address.eq(user))
            .order((dsl::block_number.desc(), dsl::log_index.desc()))
            .select(Deposit::as_select())
            .load(&mut conn)
            .await
            .context("Failed to query deposit history")?;
        Ok(rows.into_iter().map(DepositRecord::from).collect())
    }

    async fn get_withdraw_request(
        &self,
        user: &str,
    ) -> Result<Option<WithdrawRequestRecord>, StoreError> {
        use withdraw_requests::dsl;

        let mut conn = self.db.connect().await?;
        let row: Option<WithdrawRequest> = dsl::withdraw_requests
            .filter(dsl::user_address.eq(user))
            .select(WithdrawRequest::as_select())
            .first(&mut conn)
            .await
            .optional()
            .context("Failed to read withdraw request")?;
        row.map(WithdrawRequestRecord::try_from).transpose()
    }
}
