//! # Block Structure
//!
//! A block is an ordered list of transactions plus chain linkage and the
//! proposer's view of the voted validator set at proposal time.
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  number: u64            (0 = genesis)            │
//! │  hash: String           (BLAKE3, hex)            │
//! │  last_hash: String      ("" for genesis)         │
//! │  timestamp: u64         (Unix ms)                │
//! │  proposer: String       (validator address)      │
//! │  validators: BTreeMap<address, stake>            │
//! │  transactions: Vec<Transaction>                  │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Hash Computation
//!
//! The hash covers every field except itself: `number || last_hash ||
//! timestamp || proposer || canonical-JSON(validators) || tx ids`. The
//! validator map is a `BTreeMap`, so its JSON form is sorted by address and
//! identical on every node — the same property proposer election relies on
//! when it walks the set in lexicographic order.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{GENESIS_PROPOSER, GENESIS_TIMESTAMP};
use crate::crypto::hash::blake3_hex;
use crate::transaction::Transaction;

/// A full Lumen block.
///
/// Blocks are immutable after construction; `hash` is computed from the
/// other fields by the constructors and verified by [`Block::validate_hashes`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Height of this block, contiguous from 0.
    pub number: u64,
    /// BLAKE3 hash of this block's contents, hex.
    pub hash: String,
    /// Hash of the previous block. Empty string for genesis.
    pub last_hash: String,
    /// Unix timestamp (milliseconds) at proposal time.
    pub timestamp: u64,
    /// Ordered transactions included in this block.
    pub transactions: Vec<Transaction>,
    /// Address of the validator that proposed this block.
    pub proposer: String,
    /// The proposer's view of the voted validator set: address → stake.
    pub validators: BTreeMap<String, u64>,
}

impl Block {
    /// The canonical genesis block. Identical on every node: fixed
    /// timestamp, empty parent hash, no transactions, no validators.
    pub fn genesis() -> Self {
        let mut block = Self {
            number: 0,
            hash: String::new(),
            last_hash: String::new(),
            timestamp: GENESIS_TIMESTAMP,
            transactions: Vec::new(),
            proposer: GENESIS_PROPOSER.to_string(),
            validators: BTreeMap::new(),
        };
        block.hash = block.compute_hash();
        block
    }

    /// Construct a block extending `last_hash`, stamped with the current
    /// wall clock.
    pub fn new(
        last_hash: impl Into<String>,
        transactions: Vec<Transaction>,
        number: u64,
        proposer: impl Into<String>,
        validators: BTreeMap<String, u64>,
    ) -> Self {
        Self::with_timestamp(
            last_hash,
            transactions,
            number,
            proposer,
            validators,
            Utc::now().timestamp_millis() as u64,
        )
    }

    /// Construct a block with an explicit timestamp (tests, replay).
    pub fn with_timestamp(
        last_hash: impl Into<String>,
        transactions: Vec<Transaction>,
        number: u64,
        proposer: impl Into<String>,
        validators: BTreeMap<String, u64>,
        timestamp: u64,
    ) -> Self {
        let mut block = Self {
            number,
            hash: String::new(),
            last_hash: last_hash.into(),
            timestamp,
            transactions,
            proposer: proposer.into(),
            validators,
        };
        block.hash = block.compute_hash();
        block
    }

    /// Recompute the block hash from the current field values.
    pub fn compute_hash(&self) -> String {
        let mut preimage = Vec::with_capacity(256);
        preimage.extend_from_slice(&self.number.to_le_bytes());
        preimage.extend_from_slice(self.last_hash.as_bytes());
        preimage.push(0x00);
        preimage.extend_from_slice(&self.timestamp.to_le_bytes());
        preimage.extend_from_slice(self.proposer.as_bytes());
        preimage.push(0x00);
        // BTreeMap serializes sorted by address, so this is canonical.
        let validators_json = serde_json::to_vec(&self.validators)
            .expect("validator map serialization cannot fail: string keys, integer values");
        preimage.extend_from_slice(&validators_json);
        for tx in &self.transactions {
            preimage.extend_from_slice(tx.id.as_bytes());
        }
        blake3_hex(&preimage)
    }

    /// Structural integrity: the stored hash matches the recomputed hash
    /// and every transaction id matches its content.
    pub fn validate_hashes(&self) -> bool {
        if self.hash != self.compute_hash() {
            warn!(number = self.number, "block hash mismatch");
            return false;
        }
        if let Some(tx) = self.transactions.iter().find(|tx| tx.id != tx.compute_id()) {
            warn!(
                number = self.number,
                tx = %tx.id,
                "transaction id mismatch in block"
            );
            return false;
        }
        true
    }

    /// Whether this block has genesis shape: number 0 and no parent hash.
    pub fn is_genesis_shaped(&self) -> bool {
        self.number == 0 && self.last_hash.is_empty()
    }

    /// Full proposal validation: chain linkage against the expected parent,
    /// structural hashes, and transaction signatures (honoring
    /// `skip_verif`).
    ///
    /// `expected_number` / `expected_last_hash` come from the receiving
    /// node's chain tip.
    pub fn validate_proposed_block(&self, expected_number: u64, expected_last_hash: &str) -> bool {
        if self.number != expected_number {
            warn!(
                got = self.number,
                expected = expected_number,
                "proposed block has wrong number"
            );
            return false;
        }
        if self.last_hash != expected_last_hash {
            warn!(number = self.number, "proposed block does not extend the chain tip");
            return false;
        }
        if !self.validate_hashes() {
            return false;
        }
        if let Some(tx) = self.transactions.iter().find(|tx| !tx.verify()) {
            warn!(
                number = self.number,
                tx = %tx.id,
                "proposed block carries an invalid transaction"
            );
            return false;
        }
        true
    }
}
