// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where the vault lives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSourceConfig {
    /// HTTP JSON-RPC endpoint used for range queries, head and balance reads
    pub rpc_url: String,
    /// WebSocket endpoint for live logs. Without it, live events are polled.
    #[serde(default)]
    pub ws_url: Option<String>,
    pub vault_address: String,
    #[serde(default)]
    pub fetch: FetchConfig,
}

/// Tuning for the RPC side of the adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Maximum number of blocks per `eth_getLogs` call in the polling pump
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,

    /// Interval between head checks when polling for live logs
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How often a live WebSocket is probed
    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,

    /// Maximum retry duration for a single failing RPC call
    #[serde(default = "default_max_retry_seconds")]
    pub max_retry_seconds: u64,

    /// Buffer between the pump task and the subscriber
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_block_range: default_max_block_range(),
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_seconds: default_heartbeat_interval_seconds(),
            max_retry_seconds: default_max_retry_seconds(),
            channel_size: default_channel_size(),
        }
    }
}

impl FetchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds.max(1))
    }

    pub fn max_retry_duration(&self) -> Duration {
        Duration::from_secs(self.max_retry_seconds)
    }
}

fn default_max_block_range() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_heartbeat_interval_seconds() -> u64 {
    15
}

fn default_max_retry_seconds() -> u64 {
    30
}

fn default_channel_size() -> usize {
    1024
}
