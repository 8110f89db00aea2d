//! Stateless chain-validation predicates.
//!
//! These are pure functions over block slices; the block store calls them
//! when loading a chain from disk and when merging a synced section.

use tracing::warn;

use super::block::Block;

/// Validate the internal consistency of a chain section.
///
/// For every adjacent pair, the later block's `last_hash` must equal the
/// earlier block's hash, and every block after the first must pass
/// [`Block::validate_hashes`]. The first block's own linkage is the
/// caller's concern (it is either the genesis or the local chain tip).
pub fn validate_chain_subsection(chain: &[Block]) -> bool {
    for i in 1..chain.len() {
        if chain[i].last_hash != chain[i - 1].hash {
            warn!(
                number = chain[i].number,
                "chain subsection breaks at block: last_hash does not match predecessor"
            );
            return false;
        }
        if !chain[i].validate_hashes() {
            return false;
        }
    }
    true
}

/// Validate a full chain anchored at the canonical genesis.
///
/// The first block must *be* the canonical genesis (same hash) and pass its
/// own hash validation; the rest follows [`validate_chain_subsection`].
pub fn validate_chain_from_genesis(chain: &[Block]) -> bool {
    let Some(first) = chain.first() else {
        warn!("cannot validate an empty chain against genesis");
        return false;
    };
    if first.hash != Block::genesis().hash {
        warn!("chain does not start at the canonical genesis block");
        return false;
    }
    if !first.validate_hashes() {
        return false;
    }
    validate_chain_subsection(chain)
}
