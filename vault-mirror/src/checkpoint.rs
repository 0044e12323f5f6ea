// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-kind checkpoints: the last block whose events are all mirrored.
//!
//! A checkpoint only ever moves forward, and only after the records it
//! covers are committed. Replaying from a stale checkpoint is harmless
//! because deposit inserts are deduplicated.

use crate::store::StoreError;
use anyhow::Context;
use async_trait::async_trait;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl};
use diesel_async::RunQueryDsl;
use tracing::debug;
use vault_ledger::EventKind;
use vault_mirror_pg_db::Db;
use vault_mirror_schema::models::NewCheckpoint;
use vault_mirror_schema::schema::checkpoints;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// 0 when nothing has been recorded for `kind`
    async fn get(&self, kind: EventKind) -> Result<u64, StoreError>;

    /// Moving to the current value is a no-op. Moving backward fails with
    /// [`StoreError::Regression`].
    async fn advance(&self, kind: EventKind, to_block: u64) -> Result<(), StoreError>;
}

/// Returns whether `requested` needs to be written.
pub(crate) fn check_advance(
    kind: EventKind,
    current: u64,
    requested: u64,
) -> Result<bool, StoreError> {
    if requested < current {
        return Err(StoreError::Regression {
            kind,
            current,
            requested,
        });
    }
    Ok(requested > current)
}

/// Checkpoints in the `checkpoints` table. Assumes one writer per kind.
#[derive(Clone)]
pub struct PgCheckpointStore {
    db: Db,
}

impl PgCheckpointStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    async fn load(&self, kind: EventKind) -> anyhow::Result<Option<u64>> {
        use checkpoints::dsl;

        let mut conn = self.db.connect().await?;
        let block: Option<i64> = dsl::checkpoints
            .filter(dsl::event_kind.eq(kind.as_str()))
            .select(dsl::last_processed_block)
            .first(&mut conn)
            .await
            .optional()
            .context("Failed to read checkpoint")?;
        Ok(block.map(|b| b as u64))
    }

    async fn store(&self, kind: EventKind, block: u64) -> anyhow::Result<()> {
        use checkpoints::dsl;
        use diesel::dsl::now;

        let mut conn = self.db.connect().await?;
        diesel::insert_into(dsl::checkpoints)
            .values(NewCheckpoint {
                event_kind: kind.as_str(),
                last_processed_block: block as i64,
            })
            .on_conflict(dsl::event_kind)
            .do_update()
            .set((
                dsl::last_processed_block.eq(block as i64),
                dsl::updated_at.eq(now),
            ))
            .execute(&mut conn)
            .await
            .context("Failed to update checkpoint")?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn get(&self, kind: EventKind) -> Result<u64, StoreError> {
        Ok(self.load(kind).await?.unwrap_or(0))
    }

    async fn advance(&self, kind: EventKind, to_block: u64) -> Result<(), StoreError> {
        let current = self.load(kind).await?.unwrap_or(0);
        if check_advance(kind, current, to_block)? {
            self.store(kind, to_block).await?;
            debug!(
                "[PgCheckpoint] {} advanced {} -> {}",
                kind, current, to_block
            );
        }
        Ok(())
    }
}
