// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Vault mirror: keeps a queryable copy of vault deposits and withdraw
//! requests in step with the ledger.

pub mod apply;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod read_model;
pub mod state;
pub mod store;

#[cfg(test)]
pub(crate) mod test_utils;

pub use apply::{apply_event, ApplyOutcome, EventApplier};
pub use checkpoint::{CheckpointStore, PgCheckpointStore};
pub use config::{EngineConfig, MirrorConfig};
pub use engine::{EngineError, EngineHandle, IngestionEngine};
pub use read_model::{HistoryEntry, ReadError, ReadModel};
pub use state::{EngineStatus, WorkerState};
pub use store::{MemoryStore, PgRecordStore, RecordStore, StoreError};
