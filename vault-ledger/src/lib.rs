// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Ledger-facing half of the vault mirror.
//!
//! This crate knows how to read the vault contract: its event model, the
//! [`LedgerSource`] / [`BalanceSource`] traits the engine consumes, and an
//! ethers-backed implementation of both.

pub mod abi;
pub mod config;
pub mod eth_source;
pub mod events;
pub mod source;

pub use config::{FetchConfig, LedgerSourceConfig};
pub use eth_source::EthLedgerSource;
pub use events::{
    format_address, format_hash, sort_by_position, EventKind, EventPayload, EventPosition,
    LedgerEvent, MalformedEvent,
};
pub use source::{
    BalanceSource, EventSubscription, LedgerSource, RangeBatch, SourceError, SourceResult,
    SubscriptionItem,
};

/// Retries `$func` with jittered exponential backoff until it succeeds or
/// `$max_elapsed_time` runs out. Evaluates to `Ok(result)` on success and to
/// `Err(last_error)` once the budget is exhausted.
#[macro_export]
macro_rules! retry_with_max_elapsed_time {
    ($func:expr, $max_elapsed_time:expr) => {{
        // 0.4, 0.8, 1.6, 3.2, ... capped at 30s per attempt, with jitter
        let backoff = backoff::ExponentialBackoff {
            initial_interval: std::time::Duration::from_millis(400),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: std::time::Duration::from_secs(30),
            max_elapsed_time: Some($max_elapsed_time),
            ..Default::default()
        };
        backoff::future::retry(backoff, || {
            let fut = async {
                match $func.await {
                    Ok(value) => Ok(value),
                    Err(e) => {
                        tracing::debug!("[Ledger] retrying after error: {:?}", e);
                        Err(backoff::Error::transient(e))
                    }
                }
            };
            std::boxed::Box::pin(fut)
        })
        .await
    }};
}
