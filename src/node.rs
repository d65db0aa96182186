// Copyright (c) The LedgerMirror Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Node assembly: wires the gateway, cache, syncer, ops tables and the
//! HTTP server together. All components are constructed here and
//! handed their dependencies explicitly.

use crate::cache::CacheStore;
use crate::config::MirrorNodeConfig;
use crate::gateway::{LedgerGateway, RpcLedgerGateway};
use crate::metrics::MirrorMetrics;
use crate::ops::ContractOps;
use crate::server::{run_server, AppState};
use crate::syncer::StateSyncer;
use anyhow::Context;
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Running node. Dropping the handle does not stop the node; call
/// [`MirrorNodeHandle::shutdown`] to drain it.
pub struct MirrorNodeHandle {
    pub syncer: Arc<StateSyncer>,
    server: JoinHandle<()>,
}

impl MirrorNodeHandle {
    /// Stop the syncer (in-flight cycle drains) and tear the server down.
    pub async fn shutdown(self) {
        self.syncer.stop().await;
        self.server.abort();
        info!("Mirror node shut down");
    }
}

pub async fn run_mirror_node(
    config: MirrorNodeConfig,
    registry: Registry,
) -> anyhow::Result<MirrorNodeHandle> {
    let metrics = Arc::new(MirrorMetrics::new(&registry));

    let gateway = RpcLedgerGateway::new(&config.gateway)
        .context("Failed to build ledger gateway")?
        .with_metrics(metrics.clone());
    // Connectivity probe; a down gateway is not fatal, cycles retry
    match gateway.connect().await {
        Ok(head) => info!("Connected to ledger gateway, head block {}", head),
        Err(e) => warn!("Ledger gateway unreachable at startup: {}", e),
    }
    let gateway: Arc<dyn LedgerGateway> = Arc::new(gateway);

    let store = Arc::new(
        CacheStore::open(&config.data_dir, config.events.cap)
            .context("Failed to open cache store")?,
    );

    let syncer = Arc::new(StateSyncer::new(
        config.sync.clone(),
        gateway.clone(),
        store,
        metrics.clone(),
    ));
    syncer.start().await.context("Failed to start syncer")?;

    let ops = Arc::new(ContractOps::new(gateway.clone()).with_metrics(metrics.clone()));

    let state = Arc::new(AppState {
        syncer: syncer.clone(),
        ops,
        gateway,
        metrics,
        registry,
        retention_days: config.events.retention_days,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_listen_port));
    let server = run_server(addr, state)
        .await
        .context("Failed to start HTTP server")?;

    Ok(MirrorNodeHandle { syncer, server })
}
