// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The seams between the mirror and the ledger.

use crate::events::{EventKind, LedgerEvent, MalformedEvent};
use async_trait::async_trait;
use ethers::types::{Address, U256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type SourceResult<T> = Result<T, SourceError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Transport lost: {0}")]
    TransportLost(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl SourceError {
    /// Whether the engine should back off and try again
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SourceError::Rpc(_) | SourceError::TransportLost(_) | SourceError::Timeout(_)
        )
    }
}

/// One item pulled off a live subscription
#[derive(Debug, Clone)]
pub enum SubscriptionItem {
    Event(LedgerEvent),
    Malformed(MalformedEvent),
    /// The transport is gone. Nothing more will arrive on this subscription.
    Fault(SourceError),
}

/// Result of a historical range query
#[derive(Debug, Clone, Default)]
pub struct RangeBatch {
    /// Ascending `(block_number, log_index)` order
    pub events: Vec<LedgerEvent>,
    pub malformed: Vec<MalformedEvent>,
}

/// Handle to a live event stream.
///
/// Dropping the handle stops the task feeding it.
pub struct EventSubscription {
    receiver: mpsc::Receiver<SubscriptionItem>,
    cancel: CancellationToken,
}

impl EventSubscription {
    pub fn new(receiver: mpsc::Receiver<SubscriptionItem>, cancel: CancellationToken) -> Self {
        Self { receiver, cancel }
    }

    /// Next item. A feeder that went away without saying why is reported as
    /// a transport fault, so silence is never mistaken for a quiet ledger.
    pub async fn next(&mut self) -> SubscriptionItem {
        match self.receiver.recv().await {
            Some(item) => item,
            None => SubscriptionItem::Fault(SourceError::TransportLost(
                "subscription feeder stopped".to_string(),
            )),
        }
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Read access to vault events
#[async_trait]
pub trait LedgerSource: Send + Sync {
    /// Open a fresh live stream of the given kinds. Every call dials a new
    /// transport.
    async fn subscribe(&self, kinds: &[EventKind]) -> SourceResult<EventSubscription>;

    /// All emissions of `kind` in `[from_block, to_block]`. Safe to call with
    /// overlapping ranges.
    async fn query_range(
        &self,
        kind: EventKind,
        from_block: u64,
        to_block: u64,
    ) -> SourceResult<RangeBatch>;

    async fn current_head(&self) -> SourceResult<u64>;
}

/// The ledger's own view of a user's balance
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn balance_of(&self, user: Address) -> SourceResult<U256>;
}
