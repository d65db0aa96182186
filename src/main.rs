// Copyright (c) The LedgerMirror Core Contributors
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use ledger_mirror::config::MirrorNodeConfig;
use ledger_mirror::node::run_mirror_node;
use prometheus::Registry;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "ledger-mirror", about = "Chain state mirror and write-dedup node")]
struct Args {
    /// Path to the node config (YAML or JSON)
    #[arg(long, short)]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = MirrorNodeConfig::load(&args.config_path)?;
    info!("Starting ledger-mirror with config {:?}", args.config_path);

    let node = run_mirror_node(config, Registry::new()).await?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    node.shutdown().await;
    Ok(())
}
