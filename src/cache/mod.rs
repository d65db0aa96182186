// Copyright (c) The LedgerMirror Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Durable cache for contract snapshots and the bounded event log.
//!
//! Two JSON files under the data directory: `contracts.json` holds the
//! last synchronized snapshot set, `events.json` the newest-first
//! event log. The in-memory copy is authoritative for reads; every
//! mutation persists to disk before it is committed to memory, so a
//! failed write leaves the previous state standing.
//!
//! Write ordering is guaranteed by the caller: all mutations flow
//! through the sync scheduler's single control path.

use crate::error::{MirrorError, MirrorResult};
use crate::types::{LedgerEvent, SnapshotSet};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{info, warn};

const CONTRACTS_FILE: &str = "contracts.json";
const EVENTS_FILE: &str = "events.json";

/// How many recent log entries are scanned for duplicate deliveries.
const DEDUPE_WINDOW: usize = 64;

#[derive(Debug, Default)]
struct CacheState {
    snapshots: Option<SnapshotSet>,
    // Newest first
    events: Vec<LedgerEvent>,
}

#[derive(Debug)]
pub struct CacheStore {
    contracts_file: PathBuf,
    events_file: PathBuf,
    event_cap: usize,
    inner: RwLock<CacheState>,
}

impl CacheStore {
    /// Open (or create) the cache under `data_dir`.
    ///
    /// A missing or corrupt file degrades to empty state with a logged
    /// warning; only write failures are surfaced as errors. The event
    /// cap must be positive.
    pub fn open(data_dir: &Path, event_cap: usize) -> MirrorResult<Self> {
        if event_cap == 0 {
            return Err(MirrorError::Cache(
                "event log cap must be positive".to_string(),
            ));
        }
        std::fs::create_dir_all(data_dir).map_err(|e| {
            MirrorError::Cache(format!(
                "Failed to create data dir {}: {}",
                data_dir.display(),
                e
            ))
        })?;

        let contracts_file = data_dir.join(CONTRACTS_FILE);
        let events_file = data_dir.join(EVENTS_FILE);

        let snapshots: Option<SnapshotSet> = read_json(&contracts_file);
        let events: Vec<LedgerEvent> = read_json(&events_file).unwrap_or_default();

        info!(
            "Cache opened at {} ({} snapshot(s), {} event(s))",
            data_dir.display(),
            snapshots.as_ref().map(|s| s.contracts.len()).unwrap_or(0),
            events.len()
        );

        Ok(Self {
            contracts_file,
            events_file,
            event_cap,
            inner: RwLock::new(CacheState { snapshots, events }),
        })
    }

    /// Last synchronized snapshot set, `None` before the first
    /// successful cycle.
    pub async fn load_snapshots(&self) -> Option<SnapshotSet> {
        self.inner.read().await.snapshots.clone()
    }

    /// Atomically replace the snapshot set.
    pub async fn save_snapshots(&self, set: SnapshotSet) -> MirrorResult<()> {
        let mut state = self.inner.write().await;
        persist_json(&self.contracts_file, &set)?;
        state.snapshots = Some(set);
        Ok(())
    }

    /// Prepend an event and truncate the log to its cap. Appending the
    /// cap+1'th event drops exactly one entry, the oldest.
    pub async fn append_event(&self, event: LedgerEvent) -> MirrorResult<LedgerEvent> {
        let mut state = self.inner.write().await;
        let mut events = Vec::with_capacity((state.events.len() + 1).min(self.event_cap));
        events.push(event.clone());
        events.extend(state.events.iter().take(self.event_cap - 1).cloned());
        persist_json(&self.events_file, &events)?;
        state.events = events;
        Ok(event)
    }

    /// Whether an identical delivery was appended recently. Content
    /// identity requires a block number; events without one never
    /// match.
    pub async fn contains_recent_duplicate(&self, event: &LedgerEvent) -> bool {
        let Some(key) = event.content_key() else {
            return false;
        };
        let state = self.inner.read().await;
        state
            .events
            .iter()
            .take(DEDUPE_WINDOW)
            .any(|existing| existing.content_key() == Some(key))
    }

    /// Most recent events, newest first, optionally filtered by contract.
    pub async fn list_events(&self, limit: usize, contract: Option<&str>) -> Vec<LedgerEvent> {
        let state = self.inner.read().await;
        state
            .events
            .iter()
            .filter(|e| contract.map(|c| e.contract == c).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Remove events observed strictly before `cutoff_ms`. Returns the
    /// removed count.
    pub async fn purge_events_older_than(&self, cutoff_ms: u64) -> MirrorResult<usize> {
        let mut state = self.inner.write().await;
        let kept: Vec<LedgerEvent> = state
            .events
            .iter()
            .filter(|e| e.timestamp_ms >= cutoff_ms)
            .cloned()
            .collect();
        let removed = state.events.len() - kept.len();
        if removed > 0 {
            persist_json(&self.events_file, &kept)?;
            state.events = kept;
            info!("Purged {} event(s) older than {}", removed, cutoff_ms);
        }
        Ok(removed)
    }

    pub async fn event_count(&self) -> usize {
        self.inner.read().await.events.len()
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!("Failed to read {}: {}, treating as empty", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(
                "Corrupt cache file {}: {}, treating as empty",
                path.display(),
                e
            );
            None
        }
    }
}

/// Write via a temp file and rename, so readers never observe a
/// half-written file and a failed write leaves the old one intact.
fn persist_json<T: Serialize>(path: &Path, value: &T) -> MirrorResult<()> {
    let contents = serde_json::to_string_pretty(value)
        .map_err(|e| MirrorError::Cache(format!("Failed to serialize {}: {}", path.display(), e)))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, contents)
        .map_err(|e| MirrorError::Cache(format!("Failed to write {}: {}", tmp.display(), e)))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| MirrorError::Cache(format!("Failed to replace {}: {}", path.display(), e)))
}
