// Copyright (c) 2026 Lumen Labs. MIT License.
// See LICENSE for details.

//! # Lumen Validator Node
//!
//! Entry point for the `lumen-node` binary. Parses CLI flags into the
//! protocol configuration record, initializes logging, brings up the node
//! state (block store, pool, live db), and runs the consensus event loop
//! until ctrl-c.

mod cli;
mod logging;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;

use lumen_protocol::config::PROTOCOL_VERSION;
use lumen_protocol::network::{ConsensusRunner, LoopbackTransport, Node};

use cli::NodeCli;
use logging::LogFormat;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = NodeCli::parse();
    logging::init_logging(
        "lumen_node=info,lumen_protocol=info",
        LogFormat::from_str_lossy(&cli.log_format),
    );

    let config = cli.to_config();
    tracing::info!(
        protocol = PROTOCOL_VERSION,
        port = config.port,
        stake = config.consensus.stake,
        first_node = config.is_first_node,
        data_dir = %config.data_dir.display(),
        "starting lumen-node"
    );

    let is_first_node = config.is_first_node;
    let node = Node::new(config);
    node.init(is_first_node)
        .context("failed to initialize node state")?;

    // Single-node wiring: the loopback transport executes transactions
    // locally and logs outbound traffic. A real peer-to-peer transport
    // plugs in here by implementing TransportOut.
    let transport = Arc::new(LoopbackTransport::new(node.clone()));
    let runner = ConsensusRunner::new(node.clone(), transport);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consensus = tokio::spawn(runner.run(shutdown_rx));

    signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("ctrl-c received, shutting down");
    let _ = shutdown_tx.send(true);

    consensus
        .await
        .context("consensus task panicked")?
        .context("consensus engine failed")?;

    let height = node.bc.read().last_block_number();
    tracing::info!(?height, "node stopped");
    Ok(())
}
