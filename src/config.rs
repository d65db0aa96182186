// Copyright (c) The LedgerMirror Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Node configuration, loaded from a YAML or JSON file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MirrorNodeConfig {
    // The port that the HTTP API server listens on.
    #[serde(default = "default_server_listen_port")]
    pub server_listen_port: u16,
    // Directory holding the durable cache files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    // Ledger gateway configuration
    pub gateway: GatewayConfig,
    // Sync scheduler configuration
    #[serde(default)]
    pub sync: SyncConfig,
    // Event log configuration
    #[serde(default)]
    pub events: EventLogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GatewayConfig {
    // Rpc url for the ledger gateway, used for queries and transaction submission.
    pub rpc_url: String,
    /// Confirmations required before a submitted transaction is
    /// considered settled
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    /// Interval between event long-poll queries
    #[serde(default = "default_event_poll_interval_ms")]
    pub event_poll_interval_ms: u64,
    /// Per-request deadline enforced by the HTTP client
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl GatewayConfig {
    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_millis(self.event_poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SyncConfig {
    /// Interval between scheduled sync cycles
    #[serde(default = "default_sync_interval_ms")]
    pub interval_ms: u64,
    /// Contracts whose state is mirrored each cycle
    #[serde(default = "default_tracked_contracts")]
    pub contracts: Vec<TrackedContract>,
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_sync_interval_ms(),
            contracts: default_tracked_contracts(),
        }
    }
}

/// One mirrored contract: which view methods populate which snapshot fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TrackedContract {
    pub name: String,
    pub address: String,
    /// snapshot field name -> view method to call
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EventLogConfig {
    /// Maximum retained event count; appending past the cap evicts the oldest
    #[serde(default = "default_event_cap")]
    pub cap: usize,
    /// Default retention window for the age-based purge sweep
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            cap: default_event_cap(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_server_listen_port() -> u16 {
    3001
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_confirmations() -> u64 {
    1
}

fn default_event_poll_interval_ms() -> u64 {
    2_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_sync_interval_ms() -> u64 {
    30_000
}

fn default_event_cap() -> usize {
    1_000
}

fn default_retention_days() -> u64 {
    30
}

fn default_tracked_contracts() -> Vec<TrackedContract> {
    vec![
        TrackedContract {
            name: "Counter".to_string(),
            address: "0x5FbDB2315678afecb367f032d93F642f64180aa3".to_string(),
            fields: BTreeMap::from([
                ("count".to_string(), "getCount".to_string()),
                ("owner".to_string(), "getOwner".to_string()),
            ]),
        },
        TrackedContract {
            name: "Greeting".to_string(),
            address: "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512".to_string(),
            fields: BTreeMap::from([
                ("greeting".to_string(), "getGreeting".to_string()),
                ("fullGreeting".to_string(), "getFullGreeting".to_string()),
                ("changeCount".to_string(), "getChangeCount".to_string()),
                ("owner".to_string(), "owner".to_string()),
            ]),
        },
        TrackedContract {
            name: "TodoList".to_string(),
            address: "0x9fE46736679d2D9a65F0992F2272dE9f3c7fa6e0".to_string(),
            fields: BTreeMap::from([("todos".to_string(), "getTodos".to_string())]),
        },
    ]
}

impl MirrorNodeConfig {
    /// Load from YAML or JSON, chosen by file extension.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.gateway.rpc_url.is_empty() {
            anyhow::bail!("gateway rpc-url must not be empty");
        }
        if self.sync.contracts.is_empty() {
            anyhow::bail!("at least one tracked contract is required");
        }
        if self.events.cap == 0 {
            anyhow::bail!("event log cap must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_track_all_three_contracts() {
        let sync = SyncConfig::default();
        assert_eq!(sync.interval_ms, 30_000);
        let names: Vec<&str> = sync.contracts.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Counter", "Greeting", "TodoList"]);
    }

    #[test]
    fn test_load_yaml_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.yaml");
        std::fs::write(
            &path,
            "gateway:\n  rpc-url: http://localhost:8545\n",
        )
        .unwrap();
        let config = MirrorNodeConfig::load(&path).unwrap();
        assert_eq!(config.gateway.rpc_url, "http://localhost:8545");
        assert_eq!(config.gateway.confirmations, 1);
        assert_eq!(config.events.cap, 1_000);
        assert_eq!(config.server_listen_port, 3001);
    }

    #[test]
    fn test_validate_rejects_empty_rpc_url() {
        let config = MirrorNodeConfig {
            server_listen_port: 3001,
            data_dir: PathBuf::from("data"),
            gateway: GatewayConfig {
                rpc_url: String::new(),
                confirmations: 1,
                event_poll_interval_ms: 2_000,
                request_timeout_ms: 30_000,
            },
            sync: SyncConfig::default(),
            events: EventLogConfig::default(),
        };
        assert!(config.validate().is_err());
    }
}
