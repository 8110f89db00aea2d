//! Command-line interface for the Lumen validator node.

use std::path::PathBuf;

use clap::Parser;
use lumen_protocol::config::{ConsensusConfig, NodeConfig};

/// Lumen validator node.
#[derive(Debug, Parser)]
#[command(name = "lumen-node", version, about = "Lumen proof-of-stake validator node")]
pub struct NodeCli {
    /// Listen port; also names the chain subdirectory, isolating peers
    /// that share a machine.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Stake to deposit at startup when the account holds none. Zero runs
    /// the node as a non-proposing observer.
    #[arg(long, default_value_t = 0)]
    pub stake: u64,

    /// Use the pre-generated dev keypair at this index instead of a fresh
    /// random key.
    #[arg(long)]
    pub account_index: Option<u32>,

    /// First node of a new network: seed the canonical genesis block.
    #[arg(long)]
    pub first_node: bool,

    /// Root data directory.
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,

    /// Log output format: "pretty" or "json".
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl NodeCli {
    /// Assemble the protocol configuration record from the parsed flags.
    pub fn to_config(&self) -> NodeConfig {
        NodeConfig {
            port: self.port,
            account_index: self.account_index,
            is_first_node: self.first_node,
            data_dir: self.data_dir.clone(),
            consensus: ConsensusConfig {
                stake: self.stake,
                ..ConsensusConfig::default()
            },
        }
    }
}
