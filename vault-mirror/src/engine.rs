// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Ingestion engine
//!
//! One worker per event kind, each running
//! `INIT -> BACKFILLING -> LIVE -> (RECONNECTING -> BACKFILLING -> LIVE)* -> STOPPED`.
//!
//! - BACKFILLING walks `(checkpoint, head - confirmation_depth]` in chunks of
//!   `max_block_range`, committing the checkpoint after each chunk.
//! - LIVE applies subscription events in sorted micro-batches and re-runs a
//!   backfill sweep every `sweep_interval_seconds`.
//! - Any transport or store fault moves the worker to RECONNECTING, which
//!   waits out an exponential backoff and backfills the outage window.
//! - A checkpoint regression halts the worker for good.

use crate::apply::{ApplyOutcome, EventApplier};
use crate::checkpoint::CheckpointStore;
use crate::config::EngineConfig;
use crate::metrics::MirrorMetrics;
use crate::state::{EngineStatus, WorkerState, WorkerTracker};
use crate::store::{RecordStore, StoreError};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::sync::Arc;
use std::time::Instant;
use tap::TapFallible;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vault_ledger::{
    sort_by_position, EventKind, EventSubscription, LedgerEvent, LedgerSource, MalformedEvent,
    SourceError, SubscriptionItem,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("{kind} worker halted: {source}")]
    Halted {
        kind: EventKind,
        #[source]
        source: StoreError,
    },

    #[error("{kind} worker aborted: {reason}")]
    Aborted { kind: EventKind, reason: String },
}

pub struct IngestionEngine<L, C, R> {
    config: EngineConfig,
    source: Arc<L>,
    checkpoints: Arc<C>,
    records: Arc<R>,
    metrics: Option<Arc<MirrorMetrics>>,
    status: Arc<EngineStatus>,
}

impl<L, C, R> IngestionEngine<L, C, R>
where
    L: LedgerSource + 'static,
    C: CheckpointStore + 'static,
    R: RecordStore + 'static,
{
    pub fn new(config: EngineConfig, source: Arc<L>, checkpoints: Arc<C>, records: Arc<R>) -> Self {
        Self {
            config,
            source,
            checkpoints,
            records,
            metrics: None,
            status: Arc::new(EngineStatus::new(&EventKind::ALL)),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MirrorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn status(&self) -> Arc<EngineStatus> {
        self.status.clone()
    }

    /// Spawn one worker per event kind. Workers run until `cancel` fires or
    /// they halt.
    pub fn start(self, cancel: CancellationToken) -> EngineHandle {
        let mut workers = Vec::with_capacity(EventKind::ALL.len());
        for kind in EventKind::ALL {
            let Some(tracker) = self.status.tracker(kind) else {
                continue;
            };
            let worker = KindWorker {
                kind,
                config: self.config.clone(),
                source: self.source.clone(),
                checkpoints: self.checkpoints.clone(),
                applier: EventApplier::new(self.records.clone()),
                metrics: self.metrics.clone(),
                tracker,
                cancel: cancel.clone(),
                checkpoint: 0,
                tail_open: false,
            };
            workers.push((kind, tokio::spawn(worker.run())));
        }
        info!("[Engine] started {} workers", workers.len());

        EngineHandle {
            cancel,
            status: self.status,
            workers,
        }
    }
}

pub struct EngineHandle {
    cancel: CancellationToken,
    status: Arc<EngineStatus>,
    workers: Vec<(EventKind, JoinHandle<Result<(), EngineError>>)>,
}

impl EngineHandle {
    pub fn status(&self) -> Arc<EngineStatus> {
        self.status.clone()
    }

    /// Wait for every worker to finish.
    pub async fn join(self) -> Vec<(EventKind, Result<(), EngineError>)> {
        let mut results = Vec::with_capacity(self.workers.len());
        for (kind, handle) in self.workers {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(EngineError::Aborted {
                    kind,
                    reason: e.to_string(),
                }),
            };
            results.push((kind, result));
        }
        results
    }

    /// Cancel and wait. In-flight batches finish first.
    pub async fn shutdown(self) -> Vec<(EventKind, Result<(), EngineError>)> {
        self.cancel.cancel();
        self.join().await
    }
}

/// Why a worker left BACKFILLING or LIVE
enum Interrupt {
    Cancelled,
    Fault(String),
    Halted(StoreError),
}

impl From<SourceError> for Interrupt {
    fn from(e: SourceError) -> Self {
        Interrupt::Fault(format!("ledger source: {}", e))
    }
}

impl From<StoreError> for Interrupt {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Regression { .. } => Interrupt::Halted(e),
            StoreError::Backend(reason) => Interrupt::Fault(format!("store: {}", reason)),
        }
    }
}

struct KindWorker<L, C, R> {
    kind: EventKind,
    config: EngineConfig,
    source: Arc<L>,
    checkpoints: Arc<C>,
    applier: EventApplier<R>,
    metrics: Option<Arc<MirrorMetrics>>,
    tracker: Arc<WorkerTracker>,
    cancel: CancellationToken,
    /// Last committed checkpoint
    checkpoint: u64,
    /// The checkpoint block may still hold logs that were never applied.
    /// True for a loaded checkpoint and after a live commit, since a live
    /// batch can end partway through a block.
    tail_open: bool,
}

impl<L, C, R> KindWorker<L, C, R>
where
    L: LedgerSource,
    C: CheckpointStore,
    R: RecordStore,
{
    async fn run(mut self) -> Result<(), EngineError> {
        let result = self.run_states().await;
        match &result {
            Ok(()) => self.tracker.set_state(WorkerState::Stopped),
            Err(e) => {
                error!("[Engine:{}] {}", self.kind, e);
                self.tracker.set_state(WorkerState::Halted);
            }
        }
        result
    }

    async fn run_states(&mut self) -> Result<(), EngineError> {
        let mut backoff = self.new_backoff();

        let checkpoint = loop {
            match self.checkpoints.get(self.kind).await {
                Ok(block) => break block,
                Err(e) => {
                    warn!("[Engine:{}] failed to load checkpoint: {}", self.kind, e);
                    if !self.wait_backoff(&mut backoff).await {
                        return Ok(());
                    }
                }
            }
        };
        self.set_checkpoint(checkpoint);
        self.tail_open = checkpoint > 0;
        info!("[Engine:{}] resuming after block {}", self.kind, checkpoint);

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            self.tracker.set_state(WorkerState::Backfilling);

            let interrupt = match self.sweep().await {
                Ok(()) => self.follow_live(&mut backoff).await,
                Err(interrupt) => interrupt,
            };

            match interrupt {
                Interrupt::Cancelled => return Ok(()),
                Interrupt::Halted(source) => {
                    return Err(EngineError::Halted {
                        kind: self.kind,
                        source,
                    })
                }
                Interrupt::Fault(reason) => {
                    warn!("[Engine:{}] {}, reconnecting", self.kind, reason);
                    self.tracker.set_state(WorkerState::Reconnecting);
                    if let Some(metrics) = &self.metrics {
                        metrics
                            .reconnects
                            .with_label_values(&[self.kind.as_str()])
                            .inc();
                    }
                    if !self.wait_backoff(&mut backoff).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Backfill `(checkpoint, head - confirmation_depth]`, head observed once.
    /// An open checkpoint block is queried again; replays are absorbed by
    /// deposit dedup and the per-user withdraw guard.
    async fn sweep(&mut self) -> Result<(), Interrupt> {
        let head = self.source.current_head().await?;
        let target = head.saturating_sub(self.config.confirmation_depth);
        let first = if self.tail_open {
            self.checkpoint
        } else {
            self.checkpoint + 1
        };
        if target < first {
            debug!(
                "[Engine:{}] nothing to backfill (checkpoint {}, target {})",
                self.kind, self.checkpoint, target
            );
            return Ok(());
        }

        let started = Instant::now();
        let chunk = self.config.max_block_range.max(1);
        let mut applied = 0usize;
        let mut from = first;
        while from <= target {
            if self.cancel.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }
            let to = target.min(from.saturating_add(chunk - 1));
            let batch = self.source.query_range(self.kind, from, to).await?;
            for malformed in &batch.malformed {
                self.report_malformed(malformed);
            }

            let mut events = batch.events;
            sort_by_position(&mut events);
            for event in &events {
                self.apply(event).await?;
            }
            applied += events.len();

            self.commit(to).await?;
            from = to + 1;
        }
        self.tail_open = false;

        let elapsed = started.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics
                .backfill_latency
                .with_label_values(&[self.kind.as_str()])
                .observe(elapsed.as_secs_f64());
        }
        info!(
            "[Engine:{}] backfilled blocks {}..={} ({} events) in {:?}",
            self.kind, first, target, applied, elapsed
        );
        Ok(())
    }

    /// Stay LIVE until something interrupts.
    async fn follow_live(&mut self, backoff: &mut ExponentialBackoff) -> Interrupt {
        let mut subscription = match self.source.subscribe(&[self.kind]).await {
            Ok(subscription) => subscription,
            Err(e) => return Interrupt::Fault(format!("subscribe failed: {}", e)),
        };
        self.tracker.set_state(WorkerState::Live);
        backoff.reset();

        // the first tick fires at once and closes the gap between the
        // backfill head and the moment the subscription opened
        let mut sweep_timer = tokio::time::interval(self.config.sweep_interval());
        sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Interrupt::Cancelled,
                _ = sweep_timer.tick() => {
                    if let Err(interrupt) = self.sweep().await {
                        return interrupt;
                    }
                }
                item = subscription.next() => {
                    if let Err(interrupt) = self.apply_live(item, &mut subscription).await {
                        return interrupt;
                    }
                }
            }
        }
    }

    /// Gather a micro-batch starting with `first`, then apply it in ledger
    /// order and advance the checkpoint to its highest block.
    async fn apply_live(
        &mut self,
        first: SubscriptionItem,
        subscription: &mut EventSubscription,
    ) -> Result<(), Interrupt> {
        let mut batch = Vec::new();
        let mut fault = self.collect(first, &mut batch);
        if fault.is_none() && !batch.is_empty() {
            let deadline = tokio::time::Instant::now() + self.config.live_batch_window();
            while fault.is_none() && batch.len() < self.config.live_batch_size {
                match tokio::time::timeout_at(deadline, subscription.next()).await {
                    Ok(item) => fault = self.collect(item, &mut batch),
                    Err(_) => break,
                }
            }
        }

        if !batch.is_empty() {
            sort_by_position(&mut batch);
            for event in &batch {
                self.apply(event).await?;
            }
            let highest = batch
                .iter()
                .map(|event| event.block_number)
                .max()
                .unwrap_or(self.checkpoint);
            self.commit(highest).await?;
            if highest == self.checkpoint {
                self.tail_open = true;
            }
            debug!(
                "[Engine:{}] applied live batch of {} through block {}",
                self.kind,
                batch.len(),
                highest
            );
        }

        match fault {
            Some(e) => Err(Interrupt::Fault(format!("subscription lost: {}", e))),
            None => Ok(()),
        }
    }

    fn collect(&self, item: SubscriptionItem, batch: &mut Vec<LedgerEvent>) -> Option<SourceError> {
        match item {
            SubscriptionItem::Event(event) => {
                batch.push(event);
                None
            }
            SubscriptionItem::Malformed(malformed) => {
                self.report_malformed(&malformed);
                None
            }
            SubscriptionItem::Fault(e) => Some(e),
        }
    }

    async fn apply(&mut self, event: &LedgerEvent) -> Result<(), Interrupt> {
        if event.kind() != self.kind {
            warn!(
                "[Engine:{}] ignoring {} event at {}",
                self.kind,
                event.kind(),
                event.position()
            );
            return Ok(());
        }
        let outcome = self.applier.apply(event).await?;
        self.record_outcome(outcome);
        Ok(())
    }

    /// Advance the checkpoint once the writes it covers are committed.
    async fn commit(&mut self, block: u64) -> Result<(), Interrupt> {
        if block <= self.checkpoint {
            return Ok(());
        }
        self.checkpoints
            .advance(self.kind, block)
            .await
            .tap_err(|e| {
                if matches!(e, StoreError::Regression { .. }) {
                    error!("[Engine:{}] checkpoint regression: {}", self.kind, e);
                }
            })?;
        self.set_checkpoint(block);
        Ok(())
    }

    fn set_checkpoint(&mut self, block: u64) {
        self.checkpoint = block;
        self.tracker.set_checkpoint(block);
        if let Some(metrics) = &self.metrics {
            metrics
                .checkpoint
                .with_label_values(&[self.kind.as_str()])
                .set(block as i64);
        }
    }

    fn record_outcome(&self, outcome: ApplyOutcome) {
        if let Some(metrics) = &self.metrics {
            metrics
                .events_applied
                .with_label_values(&[self.kind.as_str(), outcome.as_str()])
                .inc();
        }
    }

    fn report_malformed(&self, malformed: &MalformedEvent) {
        warn!("[Engine:{}] skipping {}", self.kind, malformed);
        if let Some(metrics) = &self.metrics {
            metrics
                .malformed_events
                .with_label_values(&[self.kind.as_str()])
                .inc();
        }
    }

    fn new_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.config.initial_backoff(),
            initial_interval: self.config.initial_backoff(),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: self.config.max_backoff(),
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Sleep for the next backoff interval. `false` if cancelled meanwhile.
    async fn wait_backoff(&self, backoff: &mut ExponentialBackoff) -> bool {
        let delay = backoff.next_backoff().unwrap_or(self.config.max_backoff());
        debug!("[Engine:{}] retrying in {:?}", self.kind, delay);
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::apply_event;
    use crate::store::MemoryStore;
    use crate::test_utils::{
        deposit_event, malformed_at, wait_until, withdraw_event, MockLedgerSource, ALICE, BOB,
    };
    use std::time::Duration;
    use vault_ledger::format_address;

    fn test_config() -> EngineConfig {
        EngineConfig {
            max_block_range: 2,
            sweep_interval_seconds: 3600,
            live_batch_size: 16,
            live_batch_window_ms: 100,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            confirmation_depth: 0,
        }
    }

    fn start(
        config: EngineConfig,
        source: &Arc<MockLedgerSource>,
        store: &Arc<MemoryStore>,
    ) -> (EngineHandle, Arc<MirrorMetrics>) {
        let metrics = Arc::new(MirrorMetrics::new_for_testing());
        let handle = IngestionEngine::new(config, source.clone(), store.clone(), store.clone())
            .with_metrics(metrics.clone())
            .start(CancellationToken::new());
        (handle, metrics)
    }

    async fn wait_state(status: &EngineStatus, kind: EventKind, state: WorkerState) {
        let reached = tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(kind, |s| s == state),
        )
        .await;
        assert_eq!(reached, Ok(Some(state)), "{} never reached {}", kind, state);
    }

    fn applied(metrics: &MirrorMetrics, kind: EventKind, outcome: ApplyOutcome) -> u64 {
        metrics
            .events_applied
            .with_label_values(&[kind.as_str(), outcome.as_str()])
            .get()
    }

    #[tokio::test]
    async fn test_backfill_recovers_gap_in_chunks() {
        let source = Arc::new(MockLedgerSource::new(105));
        source.add_history(deposit_event(ALICE, 90, 0, 1));
        for block in 101..=105 {
            source.add_history(deposit_event(ALICE, block, 0, block));
        }
        let store = Arc::new(MemoryStore::new());
        store.advance(EventKind::Deposited, 100).await.unwrap();

        let (handle, _) = start(test_config(), &source, &store);
        let status = handle.status();
        wait_state(&status, EventKind::Deposited, WorkerState::Live).await;

        assert_eq!(store.deposit_count().await, 5);
        assert_eq!(store.get(EventKind::Deposited).await.unwrap(), 105);
        assert_eq!(status.checkpoint(EventKind::Deposited), Some(105));
        assert_eq!(
            source.range_calls(EventKind::Deposited),
            vec![(100, 101), (102, 103), (104, 105)]
        );

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_replay_after_crash_does_not_duplicate() {
        let source = Arc::new(MockLedgerSource::new(105));
        for block in 101..=105 {
            source.add_history(deposit_event(ALICE, block, 0, block));
        }
        let store = Arc::new(MemoryStore::new());
        store.advance(EventKind::Deposited, 100).await.unwrap();
        // committed before the crash, checkpoint never advanced
        apply_event(store.as_ref(), &deposit_event(ALICE, 103, 0, 103))
            .await
            .unwrap();

        let (handle, metrics) = start(test_config(), &source, &store);
        wait_state(&handle.status(), EventKind::Deposited, WorkerState::Live).await;

        assert_eq!(store.deposit_count().await, 5);
        assert_eq!(store.get(EventKind::Deposited).await.unwrap(), 105);
        assert_eq!(
            applied(&metrics, EventKind::Deposited, ApplyOutcome::AlreadyExists),
            1
        );
        assert_eq!(
            applied(&metrics, EventKind::Deposited, ApplyOutcome::Inserted),
            4
        );

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_live_withdraw_requests_keep_newest() {
        let source = Arc::new(MockLedgerSource::new(5));
        let store = Arc::new(MemoryStore::new());
        let (handle, _) = start(test_config(), &source, &store);
        let status = handle.status();
        wait_state(&status, EventKind::WithdrawRequested, WorkerState::Live).await;

        let newer = withdraw_event(ALICE, 12, 0, 12, 1_800_000_012);
        let older = withdraw_event(ALICE, 10, 0, 10, 1_800_000_010);
        let user = format_address(&newer.actor);
        source
            .push_live(EventKind::WithdrawRequested, SubscriptionItem::Event(newer))
            .await;
        source
            .push_live(EventKind::WithdrawRequested, SubscriptionItem::Event(older))
            .await;

        wait_until!(status.checkpoint(EventKind::WithdrawRequested) == Some(12));
        // let any trailing batch drain
        tokio::time::sleep(Duration::from_millis(200)).await;

        let request = store.get_withdraw_request(&user).await.unwrap().unwrap();
        assert_eq!(request.block_number, 12);
        assert_eq!(request.amount, "12");
        assert_eq!(request.unlock_time, 1_800_000_012);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_late_request_of_another_user_is_kept() {
        let source = Arc::new(MockLedgerSource::new(5));
        let store = Arc::new(MemoryStore::new());
        let (handle, _) = start(test_config(), &source, &store);
        let status = handle.status();
        wait_state(&status, EventKind::WithdrawRequested, WorkerState::Live).await;

        let bob = withdraw_event(BOB, 20, 0, 20, 1_800_000_020);
        source
            .push_live(EventKind::WithdrawRequested, SubscriptionItem::Event(bob))
            .await;
        wait_until!(status.checkpoint(EventKind::WithdrawRequested) == Some(20));

        let alice = withdraw_event(ALICE, 15, 0, 15, 1_800_000_015);
        let user = format_address(&alice.actor);
        source
            .push_live(EventKind::WithdrawRequested, SubscriptionItem::Event(alice))
            .await;

        wait_until!(store.get_withdraw_request(&user).await.unwrap().is_some());
        let request = store.get_withdraw_request(&user).await.unwrap().unwrap();
        assert_eq!(request.block_number, 15);
        assert_eq!(request.amount, "15");
        assert_eq!(status.checkpoint(EventKind::WithdrawRequested), Some(20));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnect_requeries_partially_applied_block() {
        let source = Arc::new(MockLedgerSource::new(5));
        let first = deposit_event(ALICE, 10, 0, 1);
        source.add_history(first.clone());
        source.add_history(deposit_event(BOB, 10, 1, 2));
        let store = Arc::new(MemoryStore::new());

        let config = EngineConfig {
            live_batch_size: 1,
            ..test_config()
        };
        let (handle, metrics) = start(config, &source, &store);
        let status = handle.status();
        wait_state(&status, EventKind::Deposited, WorkerState::Live).await;

        // only the first log of block 10 arrives before the socket drops
        source
            .push_live(EventKind::Deposited, SubscriptionItem::Event(first))
            .await;
        wait_until!(status.checkpoint(EventKind::Deposited) == Some(10));
        source.set_head(10);
        source
            .push_live(
                EventKind::Deposited,
                SubscriptionItem::Fault(SourceError::TransportLost("socket closed".into())),
            )
            .await;

        wait_until!(
            source.subscribe_count(EventKind::Deposited) == 2
                && status.state(EventKind::Deposited) == Some(WorkerState::Live)
        );
        assert_eq!(store.deposit_count().await, 2);
        assert!(source
            .range_calls(EventKind::Deposited)
            .contains(&(10, 10)));
        assert_eq!(
            applied(&metrics, EventKind::Deposited, ApplyOutcome::AlreadyExists),
            1
        );
        assert_eq!(store.get(EventKind::Deposited).await.unwrap(), 10);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_live_deposits_advance_checkpoint() {
        let source = Arc::new(MockLedgerSource::new(5));
        let store = Arc::new(MemoryStore::new());
        let (handle, _) = start(test_config(), &source, &store);
        let status = handle.status();
        wait_state(&status, EventKind::Deposited, WorkerState::Live).await;

        for event in [deposit_event(ALICE, 9, 2, 1), deposit_event(BOB, 7, 0, 2)] {
            source
                .push_live(EventKind::Deposited, SubscriptionItem::Event(event))
                .await;
        }

        wait_until!(store.get(EventKind::Deposited).await.unwrap() == 9);
        assert_eq!(store.deposit_count().await, 2);
        assert_eq!(status.checkpoint(EventKind::Deposited), Some(9));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_events_are_skipped() {
        let source = Arc::new(MockLedgerSource::new(103));
        source.add_history(deposit_event(ALICE, 101, 0, 1));
        source.add_malformed(malformed_at(EventKind::Deposited, 102));
        source.add_history(deposit_event(ALICE, 103, 0, 3));
        let store = Arc::new(MemoryStore::new());
        store.advance(EventKind::Deposited, 100).await.unwrap();

        let (handle, metrics) = start(test_config(), &source, &store);
        wait_state(&handle.status(), EventKind::Deposited, WorkerState::Live).await;

        assert_eq!(store.deposit_count().await, 2);
        assert_eq!(store.get(EventKind::Deposited).await.unwrap(), 103);

        source
            .push_live(
                EventKind::Deposited,
                SubscriptionItem::Malformed(malformed_at(EventKind::Deposited, 104)),
            )
            .await;
        source
            .push_live(
                EventKind::Deposited,
                SubscriptionItem::Event(deposit_event(BOB, 104, 1, 4)),
            )
            .await;

        wait_until!(store.deposit_count().await == 3);
        let malformed = metrics
            .malformed_events
            .with_label_values(&[EventKind::Deposited.as_str()])
            .get();
        assert_eq!(malformed, 2);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_transport_fault_backfills_outage() {
        let source = Arc::new(MockLedgerSource::new(5));
        let store = Arc::new(MemoryStore::new());
        let (handle, metrics) = start(test_config(), &source, &store);
        let status = handle.status();
        wait_state(&status, EventKind::Deposited, WorkerState::Live).await;

        // emitted while the socket is down
        source.add_history(deposit_event(ALICE, 7, 0, 7));
        source.add_history(deposit_event(BOB, 8, 1, 8));
        source.set_head(8);
        source
            .push_live(
                EventKind::Deposited,
                SubscriptionItem::Fault(SourceError::TransportLost("socket closed".into())),
            )
            .await;

        wait_until!(
            source.subscribe_count(EventKind::Deposited) == 2
                && status.state(EventKind::Deposited) == Some(WorkerState::Live)
        );
        assert_eq!(store.deposit_count().await, 2);
        assert_eq!(store.get(EventKind::Deposited).await.unwrap(), 8);
        assert_eq!(
            metrics
                .reconnects
                .with_label_values(&[EventKind::Deposited.as_str()])
                .get(),
            1
        );

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_range_query_is_retried() {
        let source = Arc::new(MockLedgerSource::new(3));
        source.add_history(deposit_event(ALICE, 2, 0, 2));
        source.fail_next_ranges(EventKind::Deposited, 1);
        let store = Arc::new(MemoryStore::new());

        let (handle, metrics) = start(test_config(), &source, &store);
        wait_state(&handle.status(), EventKind::Deposited, WorkerState::Live).await;

        assert_eq!(store.deposit_count().await, 1);
        assert_eq!(store.get(EventKind::Deposited).await.unwrap(), 3);
        assert_eq!(
            metrics
                .reconnects
                .with_label_values(&[EventKind::Deposited.as_str()])
                .get(),
            1
        );
        assert_eq!(
            source.range_calls(EventKind::Deposited),
            vec![(1, 2), (1, 2), (3, 3)]
        );

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_confirmation_depth_limits_backfill() {
        let source = Arc::new(MockLedgerSource::new(105));
        for block in 101..=105 {
            source.add_history(deposit_event(ALICE, block, 0, block));
        }
        let store = Arc::new(MemoryStore::new());
        store.advance(EventKind::Deposited, 100).await.unwrap();

        let config = EngineConfig {
            confirmation_depth: 2,
            ..test_config()
        };
        let (handle, _) = start(config, &source, &store);
        wait_state(&handle.status(), EventKind::Deposited, WorkerState::Live).await;

        assert_eq!(store.deposit_count().await, 3);
        assert_eq!(store.get(EventKind::Deposited).await.unwrap(), 103);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_checkpoint_regression_halts_worker() {
        let source = Arc::new(MockLedgerSource::new(100));
        let store = Arc::new(MemoryStore::new());
        store.advance(EventKind::Deposited, 100).await.unwrap();

        let (handle, _) = start(test_config(), &source, &store);
        let status = handle.status();
        wait_state(&status, EventKind::Deposited, WorkerState::Live).await;
        wait_state(&status, EventKind::WithdrawRequested, WorkerState::Live).await;

        // another writer moved the checkpoint past us
        store.advance(EventKind::Deposited, 500).await.unwrap();
        source
            .push_live(
                EventKind::Deposited,
                SubscriptionItem::Event(deposit_event(ALICE, 105, 0, 1)),
            )
            .await;

        wait_state(&status, EventKind::Deposited, WorkerState::Halted).await;
        assert_eq!(
            status.state(EventKind::WithdrawRequested),
            Some(WorkerState::Live)
        );
        assert_eq!(store.get(EventKind::Deposited).await.unwrap(), 500);

        let results = handle.shutdown().await;
        for (kind, result) in results {
            match kind {
                EventKind::Deposited => assert!(matches!(
                    result,
                    Err(EngineError::Halted {
                        source: StoreError::Regression {
                            current: 500,
                            requested: 105,
                            ..
                        },
                        ..
                    })
                )),
                EventKind::WithdrawRequested => assert_eq!(result, Ok(())),
            }
        }
    }

    #[tokio::test]
    async fn test_shutdown_reaches_stopped() {
        let source = Arc::new(MockLedgerSource::new(10));
        let store = Arc::new(MemoryStore::new());
        let (handle, _) = start(test_config(), &source, &store);
        let status = handle.status();

        tokio::time::timeout(Duration::from_secs(5), status.wait_all_live())
            .await
            .unwrap();

        let results = handle.shutdown().await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, result)| result.is_ok()));
        for kind in EventKind::ALL {
            assert_eq!(status.state(kind), Some(WorkerState::Stopped));
        }
    }
}
