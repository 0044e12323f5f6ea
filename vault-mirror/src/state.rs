// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-kind worker state, published on watch channels.
//!
//! Each ingestion worker owns one [`WorkerTracker`]. [`EngineStatus`]
//! bundles them so callers can inspect progress or wait until every kind is
//! following the ledger live.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use vault_ledger::EventKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Init,
    Backfilling,
    Live,
    Reconnecting,
    /// Shut down on request
    Stopped,
    /// Checkpoint regression; needs an operator
    Halted,
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Halted)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Init => "INIT",
            WorkerState::Backfilling => "BACKFILLING",
            WorkerState::Live => "LIVE",
            WorkerState::Reconnecting => "RECONNECTING",
            WorkerState::Stopped => "STOPPED",
            WorkerState::Halted => "HALTED",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct WorkerTracker {
    kind: EventKind,
    sender: watch::Sender<WorkerState>,
    checkpoint: AtomicU64,
}

impl WorkerTracker {
    pub fn new(kind: EventKind) -> Self {
        let (sender, _) = watch::channel(WorkerState::Init);
        Self {
            kind,
            sender,
            checkpoint: AtomicU64::new(0),
        }
    }

    pub fn set_state(&self, state: WorkerState) {
        let previous = self.sender.send_replace(state);
        if previous != state {
            info!("[Engine:{}] {} -> {}", self.kind, previous, state);
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.sender.subscribe()
    }

    pub fn set_checkpoint(&self, block: u64) {
        self.checkpoint.store(block, Ordering::SeqCst);
    }

    /// Last checkpoint this worker committed
    pub fn checkpoint(&self) -> u64 {
        self.checkpoint.load(Ordering::SeqCst)
    }
}

/// Shared view of every worker
#[derive(Debug)]
pub struct EngineStatus {
    trackers: BTreeMap<EventKind, Arc<WorkerTracker>>,
}

impl EngineStatus {
    pub fn new(kinds: &[EventKind]) -> Self {
        Self {
            trackers: kinds
                .iter()
                .map(|kind| (*kind, Arc::new(WorkerTracker::new(*kind))))
                .collect(),
        }
    }

    pub fn tracker(&self, kind: EventKind) -> Option<Arc<WorkerTracker>> {
        self.trackers.get(&kind).cloned()
    }

    pub fn state(&self, kind: EventKind) -> Option<WorkerState> {
        self.trackers.get(&kind).map(|t| t.state())
    }

    pub fn checkpoint(&self, kind: EventKind) -> Option<u64> {
        self.trackers.get(&kind).map(|t| t.checkpoint())
    }

    pub fn snapshot(&self) -> BTreeMap<EventKind, WorkerState> {
        self.trackers
            .iter()
            .map(|(kind, tracker)| (*kind, tracker.state()))
            .collect()
    }

    pub fn all_live(&self) -> bool {
        self.trackers
            .values()
            .all(|t| t.state() == WorkerState::Live)
    }

    /// Resolves once `kind` reports a state matching `predicate`, or `None`
    /// if the kind is not tracked.
    pub async fn wait_for(
        &self,
        kind: EventKind,
        predicate: impl Fn(WorkerState) -> bool,
    ) -> Option<WorkerState> {
        let mut receiver = self.trackers.get(&kind)?.subscribe();
        let state = receiver.wait_for(|state| predicate(*state)).await.ok()?;
        Some(*state)
    }

    /// Resolves once every kind is LIVE at the same time.
    pub async fn wait_all_live(&self) {
        let mut receivers: Vec<_> = self.trackers.values().map(|t| t.subscribe()).collect();
        loop {
            if self.all_live() {
                info!("[EngineStatus] all workers are live");
                return;
            }
            let changes = receivers.iter_mut().map(|rx| Box::pin(rx.changed()));
            let _ = futures::future::select_all(changes).await;
        }
    }
}
