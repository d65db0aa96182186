// Copyright (c) The LedgerMirror Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Core data types shared across the mirror service.
//!
//! These are pure data and can be consumed by the HTTP layer and tests
//! without coupling to the syncer implementation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in milliseconds
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Full cached state of one tracked contract as of the last successful sync.
///
/// Replaced wholesale on each successful cycle, never partially merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractSnapshot {
    /// Tracked contract name (e.g. "Counter")
    pub name: String,
    /// Decoded view-method results, keyed by field name
    pub fields: BTreeMap<String, Value>,
    /// On-ledger address of the contract
    pub contract_address: String,
    /// When this snapshot was fetched (unix millis)
    pub last_updated_ms: u64,
}

/// The full snapshot set persisted by a sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSet {
    /// Exactly one snapshot per tracked contract name
    pub contracts: BTreeMap<String, ContractSnapshot>,
    /// When the cycle that produced this set completed (unix millis)
    pub last_sync_ms: u64,
}

/// Immutable record of one observed contract event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Monotonic id allocated at append time
    pub id: u64,
    /// Contract that emitted the event
    pub contract: String,
    /// Event name (e.g. "CountIncreased")
    pub event_name: String,
    /// Decoded event arguments
    pub payload: BTreeMap<String, Value>,
    /// When the event was observed (unix millis)
    pub timestamp_ms: u64,
    /// Block number, when the gateway provided one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
}

impl LedgerEvent {
    /// Content identity used for at-least-once dedupe.
    ///
    /// Only meaningful when a block number is present; without one,
    /// two identical deliveries are indistinguishable from two
    /// occurrences and both are kept.
    pub fn content_key(&self) -> Option<(u64, &str, &str, &BTreeMap<String, Value>)> {
        self.block_number
            .map(|block| (block, self.contract.as_str(), self.event_name.as_str(), &self.payload))
    }
}

/// Scheduler status, read-only snapshot for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_running: bool,
    pub interval_ms: u64,
    /// Completion time of the last successful cycle (unix millis)
    pub last_sync_ms: Option<u64>,
}

/// Receipt for a confirmed ledger mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_id: String,
    pub block_number: u64,
    pub confirmations: u64,
}

/// Result of a gateway connectivity probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityStatus {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_block: Option<u64>,
}
