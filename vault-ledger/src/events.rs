// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Vault events as the mirror sees them.
//!
//! A [`LedgerEvent`] is the chain-agnostic shape shared by the live
//! subscription and historical range queries, so both paths feed the same
//! apply logic.

use crate::abi::{DepositedFilter, VaultEvents, WithdrawRequestedFilter};
use ethers::abi::RawLog;
use ethers::contract::{EthEvent, EthLogDecode};
use ethers::types::{Address, Log, H256, U256};
use std::fmt;
use std::str::FromStr;

/// The two vault events the mirror ingests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Deposited,
    WithdrawRequested,
}

impl EventKind {
    pub const ALL: [EventKind; 2] = [EventKind::Deposited, EventKind::WithdrawRequested];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Deposited => "Deposited",
            EventKind::WithdrawRequested => "WithdrawRequested",
        }
    }

    /// topic0 of the event
    pub fn signature(&self) -> H256 {
        match self {
            EventKind::Deposited => DepositedFilter::signature(),
            EventKind::WithdrawRequested => WithdrawRequestedFilter::signature(),
        }
    }

    pub fn from_signature(topic: &H256) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.signature() == *topic)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Deposited" => Ok(EventKind::Deposited),
            "WithdrawRequested" => Ok(EventKind::WithdrawRequested),
            other => Err(format!("unknown event kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    Deposited { amount: U256 },
    WithdrawRequested { amount: U256, unlock_time: u64 },
}

/// Position of an emission in ledger order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventPosition {
    pub block_number: u64,
    pub log_index: u64,
}

impl EventPosition {
    pub fn new(block_number: u64, log_index: u64) -> Self {
        Self {
            block_number,
            log_index,
        }
    }

    /// A position past every emission in `block_number`.
    pub fn end_of_block(block_number: u64) -> Self {
        Self::new(block_number, u64::MAX)
    }
}

impl fmt::Display for EventPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block_number, self.log_index)
    }
}

/// A decoded vault emission with its ledger coordinates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEvent {
    pub actor: Address,
    pub payload: EventPayload,
    pub block_number: u64,
    pub transaction_hash: H256,
    pub log_index: u64,
    /// Unix seconds
    pub block_timestamp: u64,
}

impl LedgerEvent {
    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::Deposited { .. } => EventKind::Deposited,
            EventPayload::WithdrawRequested { .. } => EventKind::WithdrawRequested,
        }
    }

    pub fn position(&self) -> EventPosition {
        EventPosition::new(self.block_number, self.log_index)
    }

    pub fn amount(&self) -> U256 {
        match self.payload {
            EventPayload::Deposited { amount } => amount,
            EventPayload::WithdrawRequested { amount, .. } => amount,
        }
    }

    /// Decode a raw vault log. `block_timestamp` is the timestamp of the
    /// block the log was included in.
    pub fn from_log(log: &Log, block_timestamp: u64) -> Result<Self, MalformedEvent> {
        let malformed = |reason: String| MalformedEvent::from_log(log, reason);

        let block_number = log
            .block_number
            .ok_or_else(|| malformed("missing block number".to_string()))?
            .as_u64();
        let transaction_hash = log
            .transaction_hash
            .ok_or_else(|| malformed("missing transaction hash".to_string()))?;
        let log_index = log
            .log_index
            .ok_or_else(|| malformed("missing log index".to_string()))?;
        if log_index > U256::from(u64::MAX) {
            return Err(malformed(format!("log index {} out of range", log_index)));
        }

        let raw = RawLog {
            topics: log.topics.clone(),
            data: log.data.to_vec(),
        };
        let decoded = VaultEvents::decode_log(&raw)
            .map_err(|e| malformed(format!("abi decode failed: {}", e)))?;

        let (actor, payload) = match decoded {
            VaultEvents::DepositedFilter(event) => {
                (event.user, EventPayload::Deposited { amount: event.amount })
            }
            VaultEvents::WithdrawRequestedFilter(event) => {
                if event.unlock_time > U256::from(u64::MAX) {
                    return Err(malformed(format!(
                        "unlock time {} does not fit in 64 bits",
                        event.unlock_time
                    )));
                }
                (
                    event.user,
                    EventPayload::WithdrawRequested {
                        amount: event.amount,
                        unlock_time: event.unlock_time.as_u64(),
                    },
                )
            }
        };

        Ok(Self {
            actor,
            payload,
            block_number,
            transaction_hash,
            log_index: log_index.as_u64(),
            block_timestamp,
        })
    }
}

/// A log that could not be turned into a [`LedgerEvent`]. Carries whatever
/// identity was recoverable so it can be traced on chain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "malformed event (kind: {kind:?}, block: {block_number:?}, tx: {transaction_hash:?}, log_index: {log_index:?}): {reason}"
)]
pub struct MalformedEvent {
    pub kind: Option<EventKind>,
    pub block_number: Option<u64>,
    pub transaction_hash: Option<H256>,
    pub log_index: Option<u64>,
    pub reason: String,
}

impl MalformedEvent {
    pub fn from_log(log: &Log, reason: String) -> Self {
        Self {
            kind: log.topics.first().and_then(EventKind::from_signature),
            block_number: log.block_number.map(|n| n.as_u64()),
            transaction_hash: log.transaction_hash,
            log_index: log
                .log_index
                .filter(|i| *i <= U256::from(u64::MAX))
                .map(|i| i.as_u64()),
            reason,
        }
    }
}

/// Sort into ascending `(block_number, log_index)` order.
pub fn sort_by_position(events: &mut [LedgerEvent]) {
    events.sort_by_key(|event| event.position());
}

/// Lowercase, `0x`-prefixed, full-width hex.
pub fn format_address(address: &Address) -> String {
    format!("{:?}", address)
}

pub fn format_hash(hash: &H256) -> String {
    format!("{:?}", hash)
}
