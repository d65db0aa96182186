// Copyright (c) The LedgerMirror Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sync scheduler.
//!
//! Owns the cache store's write path. While running it drives three
//! tasks under one cancellation token:
//! - a timer task ticking every `interval_ms` (tick phase is never
//!   reset by out-of-band cycles),
//! - an event task consuming the gateway subscription, appending to
//!   the event log and requesting an immediate resync,
//! - a cycle worker draining the trigger channel.
//!
//! Cycles never run concurrently. The trigger channel has capacity
//! one, so a request arriving mid-cycle is deferred to run exactly
//! once after the current cycle; a burst of events collapses into that
//! single deferred run. Manual syncs *join* the in-flight cycle
//! instead, sharing its outcome.

use crate::cache::CacheStore;
use crate::config::{SyncConfig, TrackedContract};
use crate::error::{MirrorError, MirrorResult};
use crate::gateway::{GatewayEvent, LedgerGateway};
use crate::metrics::MirrorMetrics;
use crate::types::{now_ms, ContractSnapshot, LedgerEvent, SnapshotSet, SyncStatus};
use futures::future;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};


/// Why a cycle was requested; used for logs and the latency metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncTrigger {
    Timer,
    Event,
    Manual,
}

impl SyncTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Timer => "timer",
            SyncTrigger::Event => "event",
            SyncTrigger::Manual => "manual",
        }
    }
}

type CycleOutcome = MirrorResult<SnapshotSet>;
type CycleSlot = (u64, watch::Receiver<Option<CycleOutcome>>);

struct RunState {
    cancel: CancellationToken,
    trigger_tx: mpsc::Sender<SyncTrigger>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct StateSyncer {
    inner: Arc<SyncerInner>,
    run_state: Mutex<Option<RunState>>,
}

struct SyncerInner {
    config: SyncConfig,
    gateway: Arc<dyn LedgerGateway>,
    store: Arc<CacheStore>,
    metrics: Arc<MirrorMetrics>,
    status: RwLock<SyncStatus>,
    // Cycles are mutually exclusive; waiters queue here
    cycle_lock: tokio::sync::Mutex<()>,
    // The in-flight (or queued) cycle manual syncs may join
    inflight: Mutex<Option<CycleSlot>>,
    cycle_seq: AtomicU64,
    next_event_id: AtomicU64,
}

impl StateSyncer {
    pub fn new(
        config: SyncConfig,
        gateway: Arc<dyn LedgerGateway>,
        store: Arc<CacheStore>,
        metrics: Arc<MirrorMetrics>,
    ) -> Self {
        let status = SyncStatus {
            is_running: false,
            interval_ms: config.interval_ms,
            last_sync_ms: None,
        };
        Self {
            inner: Arc::new(SyncerInner {
                config,
                gateway,
                store,
                metrics,
                status: RwLock::new(status),
                cycle_lock: tokio::sync::Mutex::new(()),
                inflight: Mutex::new(None),
                cycle_seq: AtomicU64::new(0),
                next_event_id: AtomicU64::new(0),
            }),
            run_state: Mutex::new(None),
        }
    }

    /// Stopped -> Running. Subscribes to gateway events and spawns the
    /// timer, event and cycle-worker tasks. Idempotent.
    pub async fn start(&self) -> MirrorResult<()> {
        {
            let run_state = self.run_state.lock().expect("run state poisoned");
            if run_state.is_some() {
                warn!("Syncer already running, ignoring start()");
                return Ok(());
            }
        }

        let cancel = CancellationToken::new();
        // Capacity 1: one deferred cycle at most, bursts coalesce
        let (trigger_tx, trigger_rx) = mpsc::channel(1);

        let contracts: Vec<String> = self
            .inner
            .config
            .contracts
            .iter()
            .map(|c| c.name.clone())
            .collect();
        let subscription = self.inner.gateway.subscribe(&contracts).await?;

        let mut tasks = Vec::new();

        let inner = self.inner.clone();
        let tx = trigger_tx.clone();
        let task_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            run_timer_task(inner, tx, task_cancel).await;
        }));

        let inner = self.inner.clone();
        let tx = trigger_tx.clone();
        let task_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            run_event_task(inner, subscription, tx, task_cancel).await;
        }));

        let inner = self.inner.clone();
        let task_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            run_cycle_worker(inner, trigger_rx, task_cancel).await;
        }));

        {
            let mut run_state = self.run_state.lock().expect("run state poisoned");
            *run_state = Some(RunState {
                cancel,
                trigger_tx,
                tasks,
            });
        }
        self.inner.status.write().await.is_running = true;
        info!(
            "Syncer started: {} contract(s), interval {}ms",
            self.inner.config.contracts.len(),
            self.inner.config.interval_ms
        );
        Ok(())
    }

    /// Running -> Stopped. Cancels the timer and the event
    /// subscription; an in-flight cycle is allowed to finish.
    pub async fn stop(&self) {
        let run_state = {
            let mut slot = self.run_state.lock().expect("run state poisoned");
            slot.take()
        };
        let Some(run_state) = run_state else {
            debug!("Syncer not running, ignoring stop()");
            return;
        };

        run_state.cancel.cancel();
        for contract in &self.inner.config.contracts {
            self.inner.gateway.unsubscribe(&contract.name).await;
        }
        self.inner.status.write().await.is_running = false;
        info!("Syncer stopped (in-flight cycle drains)");
        // Task handles drop here; the tasks themselves drain on their own
        drop(run_state.tasks);
    }

    /// Run a cycle on demand. Joins an in-flight cycle if one exists
    /// (idempotent-safe), otherwise runs a fresh one under the same
    /// no-concurrent-cycle rule.
    pub async fn sync_now(&self) -> MirrorResult<SnapshotSet> {
        self.inner
            .join_or_spawn_cycle(false, SyncTrigger::Manual)
            .await
    }

    /// Scheduler status, by value.
    pub async fn status(&self) -> SyncStatus {
        self.inner.status.read().await.clone()
    }

    /// Last synchronized snapshot set; typed failure before the first
    /// successful cycle.
    pub async fn snapshots(&self) -> MirrorResult<SnapshotSet> {
        self.inner
            .store
            .load_snapshots()
            .await
            .ok_or(MirrorError::NotYetSynced)
    }

    pub async fn events(&self, limit: usize, contract: Option<&str>) -> Vec<LedgerEvent> {
        self.inner.store.list_events(limit, contract).await
    }

    /// Retention sweep; a cache write, so it runs through the owner of
    /// the store's write path.
    pub async fn purge_events(&self, days_to_keep: u64) -> MirrorResult<usize> {
        let cutoff_ms = now_ms().saturating_sub(days_to_keep * 24 * 60 * 60 * 1_000);
        let removed = self.inner.store.purge_events_older_than(cutoff_ms).await?;
        self.inner.metrics.events_purged.inc_by(removed as u64);
        self.inner
            .metrics
            .event_log_size
            .set(self.inner.store.event_count().await as i64);
        Ok(removed)
    }
}

impl SyncerInner {
    /// Join the in-flight cycle, or spawn one. `fresh` forces a new
    /// cycle (queued behind the current via the cycle lock) and is
    /// used by the trigger paths; manual syncs pass `false` and share
    /// the in-flight outcome.
    async fn join_or_spawn_cycle(
        self: &Arc<Self>,
        fresh: bool,
        trigger: SyncTrigger,
    ) -> CycleOutcome {
        let mut rx = {
            let mut slot = self.inflight.lock().expect("inflight slot poisoned");
            match (&*slot, fresh) {
                (Some((_, rx)), false) => rx.clone(),
                _ => {
                    let entry = self.spawn_cycle(trigger);
                    let rx = entry.1.clone();
                    *slot = Some(entry);
                    rx
                }
            }
        };
        // Bound to a local so the watch::Ref temporary is released
        // before rx goes out of scope
        let outcome = match rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => outcome.clone().expect("settled cycle has an outcome"),
            Err(_) => Err(MirrorError::Generic("sync cycle was aborted".to_string())),
        };
        outcome
    }

    fn spawn_cycle(self: &Arc<Self>, trigger: SyncTrigger) -> CycleSlot {
        let seq = self.cycle_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = watch::channel(None);
        let inner = self.clone();
        tokio::spawn(async move {
            let _permit = inner.cycle_lock.lock().await;
            let result = inner.run_cycle_once(trigger).await;
            {
                // Clear the slot first so late arrivals start fresh
                let mut slot = inner.inflight.lock().expect("inflight slot poisoned");
                if slot.as_ref().map(|(s, _)| *s == seq).unwrap_or(false) {
                    *slot = None;
                }
            }
            let _ = tx.send(Some(result));
        });
        (seq, rx)
    }

    /// One full pull-and-cache-replace pass over all tracked
    /// contracts. Per-contract failures keep the previous snapshot
    /// (partial success); only a cache write failure fails the cycle.
    async fn run_cycle_once(&self, trigger: SyncTrigger) -> CycleOutcome {
        let start = Instant::now();
        let previous = self.store.load_snapshots().await;

        let fetches = self
            .config
            .contracts
            .iter()
            .map(|contract| async move { (contract, self.fetch_contract(contract).await) });
        let results = future::join_all(fetches).await;

        let mut contracts = BTreeMap::new();
        for (tracked, result) in results {
            match result {
                Ok(snapshot) => {
                    contracts.insert(tracked.name.clone(), snapshot);
                }
                Err(e) => {
                    self.metrics
                        .sync_contract_fetch_failures
                        .with_label_values(&[&tracked.name])
                        .inc();
                    warn!("Fetch failed for {}: {} (keeping previous snapshot)", tracked.name, e);
                    if let Some(old) = previous
                        .as_ref()
                        .and_then(|p| p.contracts.get(&tracked.name))
                    {
                        contracts.insert(tracked.name.clone(), old.clone());
                    }
                }
            }
        }

        let set = SnapshotSet {
            contracts,
            last_sync_ms: now_ms(),
        };

        if let Err(e) = self.store.save_snapshots(set.clone()).await {
            self.metrics.sync_cycle_failures.inc();
            error!("Cycle failed to persist snapshots: {}", e);
            return Err(e);
        }

        self.status.write().await.last_sync_ms = Some(set.last_sync_ms);
        self.metrics.sync_cycles_total.inc();
        self.metrics
            .last_sync_timestamp_ms
            .set(set.last_sync_ms as i64);
        self.metrics
            .sync_cycle_latency
            .with_label_values(&[trigger.as_str()])
            .observe(start.elapsed().as_secs_f64());
        debug!(
            "Sync cycle done ({:?} trigger, {} contract(s), {:?})",
            trigger,
            set.contracts.len(),
            start.elapsed()
        );
        Ok(set)
    }

    /// Pull every configured field of one contract in parallel.
    async fn fetch_contract(&self, tracked: &TrackedContract) -> MirrorResult<ContractSnapshot> {
        let fields = tracked.fields.iter().map(|(field, method)| async move {
            let value = self.gateway.call(&tracked.name, method, &[]).await?;
            Ok::<(String, Value), MirrorError>((field.clone(), value))
        });
        let fields: BTreeMap<String, Value> =
            future::try_join_all(fields).await?.into_iter().collect();

        Ok(ContractSnapshot {
            name: tracked.name.clone(),
            fields,
            contract_address: tracked.address.clone(),
            last_updated_ms: now_ms(),
        })
    }

    /// Record one delivered chain event, dropping exact duplicate
    /// deliveries when a block number makes them identifiable.
    /// Returns whether the event was appended.
    async fn record_chain_event(&self, event: GatewayEvent) -> MirrorResult<bool> {
        let record = LedgerEvent {
            id: self.alloc_event_id(),
            contract: event.contract,
            event_name: event.event_name,
            payload: event.payload,
            timestamp_ms: now_ms(),
            block_number: event.block_number,
        };

        if self.store.contains_recent_duplicate(&record).await {
            self.metrics.events_deduped.inc();
            debug!(
                "Dropping duplicate delivery of {}.{} (block {:?})",
                record.contract, record.event_name, record.block_number
            );
            return Ok(false);
        }

        let record = self.store.append_event(record).await?;
        self.metrics.events_appended.inc();
        self.metrics
            .event_log_size
            .set(self.store.event_count().await as i64);
        info!(
            "Recorded event {}.{} (block {:?})",
            record.contract, record.event_name, record.block_number
        );
        Ok(true)
    }

    /// Strictly increasing, roughly time-based event ids.
    fn alloc_event_id(&self) -> u64 {
        let now = now_ms();
        let prev = self
            .next_event_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev + 1))
            })
            .expect("fetch_update closure always returns Some");
        now.max(prev + 1)
    }
}

/// Requests a cycle on every interval tick. The interval keeps its
/// phase regardless of event-triggered cycles: a chain event 5s into a
/// 30s interval does not move the next tick.
async fn run_timer_task(
    inner: Arc<SyncerInner>,
    trigger_tx: mpsc::Sender<SyncTrigger>,
    cancel: CancellationToken,
) {
    let mut interval = time::interval(inner.config.interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Timer task cancelled");
                return;
            }
            _ = interval.tick() => {
                // A full channel means a cycle is already queued
                let _ = trigger_tx.try_send(SyncTrigger::Timer);
            }
        }
    }
}

/// Consumes the gateway subscription: append to the event log, then
/// request an immediate out-of-band cycle.
async fn run_event_task(
    inner: Arc<SyncerInner>,
    mut subscription: crate::gateway::EventSubscription,
    trigger_tx: mpsc::Sender<SyncTrigger>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Event task cancelled");
                return;
            }
            maybe_event = subscription.recv() => {
                let Some(event) = maybe_event else {
                    warn!("Gateway event feed closed");
                    return;
                };
                if let Err(e) = inner.record_chain_event(event).await {
                    error!("Failed to record chain event: {}", e);
                }
                let _ = trigger_tx.try_send(SyncTrigger::Event);
            }
        }
    }
}

/// Drains the trigger channel, running one cycle per trigger. Cancel
/// is only honored between cycles, so an in-flight cycle drains.
async fn run_cycle_worker(
    inner: Arc<SyncerInner>,
    mut trigger_rx: mpsc::Receiver<SyncTrigger>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Cycle worker cancelled");
                return;
            }
            maybe_trigger = trigger_rx.recv() => {
                let Some(trigger) = maybe_trigger else { return };
                if let Err(e) = inner.join_or_spawn_cycle(true, trigger).await {
                    warn!("Sync cycle failed ({} trigger): {}", trigger.as_str(), e);
                }
            }
        }
    }
}
