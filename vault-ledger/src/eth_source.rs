// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! ethers-backed [`LedgerSource`] and [`BalanceSource`].
//!
//! Range queries, head reads and balance reads go over HTTP. Live delivery
//! either follows an `eth_subscribe("logs")` WebSocket or, without a
//! WebSocket URL, polls `eth_getLogs` behind the head.

use crate::abi::Vault;
use crate::config::{FetchConfig, LedgerSourceConfig};
use crate::events::{EventKind, LedgerEvent, MalformedEvent};
use crate::retry_with_max_elapsed_time;
use crate::source::{
    BalanceSource, EventSubscription, LedgerSource, RangeBatch, SourceError, SourceResult,
    SubscriptionItem,
};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider, Ws};
use ethers::types::{Address, Filter, Log, ValueOrArray, H256, U256};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tap::TapFallible;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const TIMESTAMP_CACHE_LIMIT: usize = 256;

pub struct EthLedgerSource {
    vault_address: Address,
    ws_url: Option<String>,
    fetch: FetchConfig,
    vault: Vault<Provider<Http>>,
    decoder: LogDecoder,
}

impl EthLedgerSource {
    pub fn new(config: LedgerSourceConfig) -> anyhow::Result<Self> {
        let vault_address: Address = config
            .vault_address
            .parse()
            .map_err(|e| anyhow!("invalid vault address {}: {:?}", config.vault_address, e))?;
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .with_context(|| format!("invalid rpc url {}", config.rpc_url))?;
        let provider = Arc::new(provider);

        info!(
            "[Ledger] vault {:?} via {} (live: {})",
            vault_address,
            config.rpc_url,
            config.ws_url.as_deref().unwrap_or("polling")
        );

        Ok(Self {
            vault_address,
            ws_url: config.ws_url,
            vault: Vault::new(vault_address, provider.clone()),
            decoder: LogDecoder {
                provider,
                vault_address,
                max_retry_duration: config.fetch.max_retry_duration(),
            },
            fetch: config.fetch,
        })
    }

    pub fn vault_address(&self) -> Address {
        self.vault_address
    }

    fn filter(&self, kinds: &[EventKind]) -> Filter {
        let topics: Vec<Option<H256>> = kinds.iter().map(|kind| Some(kind.signature())).collect();
        Filter::new()
            .address(self.vault_address)
            .topic0(ValueOrArray::Array(topics))
    }
}

#[async_trait]
impl LedgerSource for EthLedgerSource {
    async fn subscribe(&self, kinds: &[EventKind]) -> SourceResult<EventSubscription> {
        let (tx, rx) = mpsc::channel(self.fetch.channel_size);
        let cancel = CancellationToken::new();
        let filter = self.filter(kinds);

        match &self.ws_url {
            Some(url) => {
                let ws = Provider::<Ws>::connect(url.as_str())
                    .await
                    .map_err(|e| SourceError::TransportLost(format!("connect {}: {}", url, e)))?;
                debug!("[Ledger] websocket connected for {:?}", kinds);
                tokio::spawn(run_ws_pump(
                    ws,
                    filter,
                    self.decoder.clone(),
                    self.fetch.heartbeat_interval(),
                    tx,
                    cancel.clone(),
                ));
            }
            None => {
                let head = self.current_head().await?;
                debug!("[Ledger] polling {:?} from block {}", kinds, head + 1);
                tokio::spawn(run_poll_pump(
                    self.decoder.clone(),
                    filter,
                    head + 1,
                    self.fetch.clone(),
                    tx,
                    cancel.clone(),
                ));
            }
        }

        Ok(EventSubscription::new(rx, cancel))
    }

    async fn query_range(
        &self,
        kind: EventKind,
        from_block: u64,
        to_block: u64,
    ) -> SourceResult<RangeBatch> {
        let filter = self.filter(&[kind]).from_block(from_block).to_block(to_block);
        let logs = retry_with_max_elapsed_time!(
            self.decoder.provider.get_logs(&filter),
            self.fetch.max_retry_duration()
        )
        .map_err(|e| SourceError::Rpc(format!("get_logs failed: {}", e)))
        .tap_err(|e| {
            error!(
                "[Ledger] {} range {}..={} failed: {}",
                kind, from_block, to_block, e
            )
        })?;

        let mut cache = HashMap::new();
        self.decoder.decode_all(logs, &mut cache).await
    }

    async fn current_head(&self) -> SourceResult<u64> {
        retry_with_max_elapsed_time!(
            self.decoder.provider.get_block_number(),
            self.fetch.max_retry_duration()
        )
        .map(|n| n.as_u64())
        .map_err(|e| SourceError::Rpc(format!("get_block_number failed: {}", e)))
    }
}

#[async_trait]
impl BalanceSource for EthLedgerSource {
    async fn balance_of(&self, user: Address) -> SourceResult<U256> {
        self.vault
            .balances(user)
            .call()
            .await
            .map_err(|e| SourceError::Rpc(format!("balances({:?}) failed: {}", user, e)))
    }
}

/// Turns raw logs into ledger events, fetching block timestamps as needed
#[derive(Clone)]
struct LogDecoder {
    provider: Arc<Provider<Http>>,
    vault_address: Address,
    max_retry_duration: Duration,
}

impl LogDecoder {
    async fn block_timestamp(
        &self,
        number: u64,
        cache: &mut HashMap<u64, u64>,
    ) -> SourceResult<u64> {
        if let Some(timestamp) = cache.get(&number) {
            return Ok(*timestamp);
        }
        let block = retry_with_max_elapsed_time!(
            self.provider.get_block(number),
            self.max_retry_duration
        )
        .map_err(|e| SourceError::Rpc(format!("get_block({}) failed: {}", number, e)))?
        .ok_or_else(|| SourceError::InvalidResponse(format!("block {} not found", number)))?;

        let timestamp = block.timestamp.low_u64();
        if cache.len() >= TIMESTAMP_CACHE_LIMIT {
            cache.clear();
        }
        cache.insert(number, timestamp);
        Ok(timestamp)
    }

    /// `None` for logs that were reorged out.
    async fn decode(
        &self,
        log: Log,
        cache: &mut HashMap<u64, u64>,
    ) -> SourceResult<Option<Result<LedgerEvent, MalformedEvent>>> {
        if log.removed == Some(true) {
            warn!(
                "[Ledger] skipping removed log tx {:?} index {:?} at block {:?}",
                log.transaction_hash, log.log_index, log.block_number
            );
            return Ok(None);
        }
        if log.address != self.vault_address {
            return Ok(Some(Err(MalformedEvent::from_log(
                &log,
                format!("emitted by {:?}", log.address),
            ))));
        }
        let timestamp = match log.block_number {
            Some(number) => self.block_timestamp(number.as_u64(), cache).await?,
            None => 0,
        };
        Ok(Some(LedgerEvent::from_log(&log, timestamp)))
    }

    async fn decode_all(
        &self,
        logs: Vec<Log>,
        cache: &mut HashMap<u64, u64>,
    ) -> SourceResult<RangeBatch> {
        let mut batch = RangeBatch::default();
        for log in logs {
            match self.decode(log, cache).await? {
                Some(Ok(event)) => batch.events.push(event),
                Some(Err(malformed)) => batch.malformed.push(malformed),
                None => {}
            }
        }
        crate::events::sort_by_position(&mut batch.events);
        Ok(batch)
    }
}

async fn run_ws_pump(
    provider: Provider<Ws>,
    filter: Filter,
    decoder: LogDecoder,
    heartbeat_interval: Duration,
    tx: mpsc::Sender<SubscriptionItem>,
    cancel: CancellationToken,
) {
    let mut stream = match provider.subscribe_logs(&filter).await {
        Ok(stream) => stream,
        Err(e) => {
            let fault = SourceError::TransportLost(format!("eth_subscribe failed: {}", e));
            let _ = tx.send(SubscriptionItem::Fault(fault)).await;
            return;
        }
    };

    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.tick().await;
    let mut cache = HashMap::new();

    loop {
        let fault = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("[Ledger] websocket pump cancelled");
                return;
            }
            _ = heartbeat.tick() => {
                match tokio::time::timeout(heartbeat_interval, provider.get_block_number()).await {
                    Ok(Ok(_)) => continue,
                    Ok(Err(e)) => SourceError::TransportLost(format!("heartbeat failed: {}", e)),
                    Err(_) => SourceError::Timeout("heartbeat timed out".to_string()),
                }
            }
            next = stream.next() => match next {
                Some(log) => match decoder.decode(log, &mut cache).await {
                    Ok(Some(decoded)) => {
                        let item = match decoded {
                            Ok(event) => SubscriptionItem::Event(event),
                            Err(malformed) => SubscriptionItem::Malformed(malformed),
                        };
                        if tx.send(item).await.is_err() {
                            return;
                        }
                        continue;
                    }
                    Ok(None) => continue,
                    Err(e) => e,
                },
                None => SourceError::TransportLost("log stream closed".to_string()),
            },
        };

        warn!("[Ledger] live subscription ended: {}", fault);
        let _ = tx.send(SubscriptionItem::Fault(fault)).await;
        return;
    }
}

async fn run_poll_pump(
    decoder: LogDecoder,
    filter: Filter,
    mut next_block: u64,
    fetch: FetchConfig,
    tx: mpsc::Sender<SubscriptionItem>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(fetch.poll_interval());
    let mut cache = HashMap::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("[Ledger] polling pump cancelled");
                return;
            }
            _ = ticker.tick() => {}
        }

        cache.clear();
        match poll_once(&decoder, &filter, &mut next_block, &fetch, &tx, &mut cache).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(fault) => {
                warn!("[Ledger] polling subscription ended: {}", fault);
                let _ = tx.send(SubscriptionItem::Fault(fault)).await;
                return;
            }
        }
    }
}

/// Forward everything up to the current head. `Ok(false)` once the
/// subscriber is gone.
async fn poll_once(
    decoder: &LogDecoder,
    filter: &Filter,
    next_block: &mut u64,
    fetch: &FetchConfig,
    tx: &mpsc::Sender<SubscriptionItem>,
    cache: &mut HashMap<u64, u64>,
) -> SourceResult<bool> {
    let head = retry_with_max_elapsed_time!(
        decoder.provider.get_block_number(),
        fetch.max_retry_duration()
    )
    .map_err(|e| SourceError::TransportLost(format!("get_block_number failed: {}", e)))?
    .as_u64();

    let range = fetch.max_block_range.max(1);
    while *next_block <= head {
        let end = head.min(next_block.saturating_add(range - 1));
        let chunk = filter.clone().from_block(*next_block).to_block(end);
        let logs = retry_with_max_elapsed_time!(
            decoder.provider.get_logs(&chunk),
            fetch.max_retry_duration()
        )
        .map_err(|e| SourceError::TransportLost(format!("get_logs failed: {}", e)))?;

        let batch = decoder.decode_all(logs, cache).await?;
        let items = batch
            .malformed
            .into_iter()
            .map(SubscriptionItem::Malformed)
            .chain(batch.events.into_iter().map(SubscriptionItem::Event));
        for item in items {
            if tx.send(item).await.is_err() {
                return Ok(false);
            }
        }
        *next_block = end + 1;
    }
    Ok(true)
}
