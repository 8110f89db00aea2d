//! # Protocol Configuration & Constants
//!
//! Every magic number in Lumen lives here, together with the explicit
//! configuration records that get threaded through construction. There is
//! no ambient process-wide state: if a subsystem needs a knob, it receives
//! it in its constructor.
//!
//! The constants in the "Consensus Parameters" section are consensus-
//! critical — two peers that disagree on any of them will disagree on
//! proposers, garbage collection, or sync windows. Changing them is a
//! protocol version bump.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Protocol version string. The proposer-election sampler (see
/// `crypto::hash::seed_to_unit`) is part of this version: peers running a
/// different sampler elect different proposers and fork immediately.
pub const PROTOCOL_VERSION: &str = "0.1.0";

// ---------------------------------------------------------------------------
// Consensus Parameters
// ---------------------------------------------------------------------------

/// Number of recent blocks kept in memory by the block store. Older blocks
/// are shifted out to disk-only, with their transactions folded into the
/// snapshot state db so the total state stays equivalent.
pub const MAX_BLOCKS_IN_MEMORY: usize = 10;

/// Maximum number of blocks served per chain-subsection request during sync.
pub const CHAIN_SUBSECT_LENGTH: usize = 20;

/// Default window (in heights) of retained `/consensus/number/*` records in
/// the state db. Also the lookback distance for the proposer-election seed
/// block: height n seeds from block `n - MAX_CONSENSUS_STATE_DB` once the
/// chain is longer than the window.
pub const DEFAULT_MAX_CONSENSUS_STATE_DB: u64 = 100;

/// Default wait for a proposal at the current `(number, round)` before the
/// round advances and the proposer is re-elected.
pub const DEFAULT_PROPOSAL_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Default trampoline delay between committing a block and attempting the
/// next height's proposal. This is a yield-to-scheduler, not a protocol
/// delay — it exists to flatten the commit → propose → commit call chain.
pub const DEFAULT_TRANSITION_TIMEOUT: Duration = Duration::from_millis(20);

/// One day, as used by the deposit-expiry grace computation: a consensus
/// deposit counts toward stake only while `expire_at > now + DAY`.
pub const DAY: Duration = Duration::from_millis(86_400_000);

/// Lifetime of a consensus deposit, measured from the timestamp of the
/// transaction that requested it. Processing a request under
/// `/deposit/consensus/<addr>/<push_id>/value` credits the canonical
/// account at `/deposit_accounts/consensus/<addr>` with
/// `expire_at = tx.timestamp + DEPOSIT_EXPIRY`.
pub const DEPOSIT_EXPIRY: Duration = Duration::from_millis(30 * 86_400_000);

// ---------------------------------------------------------------------------
// Genesis
// ---------------------------------------------------------------------------

/// Well-known proposer address recorded on the genesis block. Not a real
/// account; nothing can ever be signed by it.
pub const GENESIS_PROPOSER: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Genesis timestamp. Epoch zero keeps the genesis hash identical on every
/// node regardless of when it first boots.
pub const GENESIS_TIMESTAMP: u64 = 0;

// ---------------------------------------------------------------------------
// Dev Accounts
// ---------------------------------------------------------------------------

/// Seed-domain prefix for the pre-generated development keypairs selected
/// via `account_index`. Index `i` maps to the keypair seeded by
/// `blake3("{DEV_ACCOUNT_SEED_PREFIX}{i}")`.
pub const DEV_ACCOUNT_SEED_PREFIX: &str = "lumen/dev-account/";

// ---------------------------------------------------------------------------
// ConsensusConfig
// ---------------------------------------------------------------------------

/// Consensus-engine knobs.
///
/// `stake` doubles as the local validator's weight at height 1 and the
/// deposit amount issued at init when no stake exists yet. The remaining
/// fields default to the protocol constants above and exist as fields so
/// tests can shrink the timing without touching globals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Stake to deposit at init when the local account has none. Zero means
    /// "observe only": the node never stakes or proposes on its own.
    pub stake: u64,

    /// Window (in heights) of retained `/consensus/number/*` state records;
    /// also the seed-block lookback for proposer election.
    pub max_consensus_state_db: u64,

    /// How long to wait for a proposal before advancing the round.
    pub proposal_timeout: Duration,

    /// Trampoline yield between commit and the next proposal attempt.
    pub transition_timeout: Duration,

    /// Grace period in the deposit-expiry validity check.
    pub day: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            stake: 0,
            max_consensus_state_db: DEFAULT_MAX_CONSENSUS_STATE_DB,
            proposal_timeout: DEFAULT_PROPOSAL_TIMEOUT,
            transition_timeout: DEFAULT_TRANSITION_TIMEOUT,
            day: DAY,
        }
    }
}

// ---------------------------------------------------------------------------
// NodeConfig
// ---------------------------------------------------------------------------

/// Top-level node configuration, assembled by the binary from CLI flags and
/// handed to [`crate::network::node::Node`] at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Listen port. Also used as the block-store subdirectory name so that
    /// several peers on one machine do not share a chain directory.
    pub port: u16,

    /// Select a pre-generated dev keypair by index. `None` generates a
    /// fresh random keypair on every start.
    pub account_index: Option<u32>,

    /// First node of a new network: seed the chain directory with the
    /// canonical genesis block instead of waiting to sync one.
    pub is_first_node: bool,

    /// Root data directory; the chain lives under `<data_dir>/chains/<port>`.
    pub data_dir: PathBuf,

    /// Consensus-engine knobs.
    pub consensus: ConsensusConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            account_index: None,
            is_first_node: false,
            data_dir: PathBuf::from("data"),
            consensus: ConsensusConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Directory holding this node instance's block files.
    pub fn chain_dir(&self) -> PathBuf {
        self.data_dir.join("chains").join(self.port.to_string())
    }
}
