//! Pending-transaction pool.
//!
//! Transactions wait here between creation (or gossip receipt) and block
//! inclusion, grouped by sender address. The pool tracks the highest
//! *committed* nonce per address so that a proposer only pulls transactions
//! that can actually execute:
//!
//! - non-nonced transactions (`nonce == -1`) are always eligible;
//! - nonced transactions are eligible in consecutive order starting right
//!   after the committed nonce — a gap parks everything behind it.
//!
//! `DashMap` keeps the per-address indices lock-free for readers; the pool
//! is shared between the node, the consensus engine, and the transport.

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, trace};

use crate::storage::Block;
use crate::transaction::Transaction;

/// Errors returned by pool insertion.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// A transaction with the same id is already pending.
    #[error("transaction already pending: {0}")]
    Duplicate(String),

    /// The envelope failed integrity or signature verification.
    #[error("transaction failed verification: {0}")]
    InvalidTransaction(String),

    /// A nonced transaction at or below the committed nonce can never
    /// execute and is rejected outright.
    #[error("stale nonce {nonce} for {address} (committed: {committed})")]
    StaleNonce {
        address: String,
        nonce: i64,
        committed: i64,
    },
}

/// Pending transactions grouped by sender, plus per-sender committed-nonce
/// trackers.
#[derive(Debug, Default)]
pub struct TransactionPool {
    /// address → pending transactions (unordered; sorted on read).
    pending: DashMap<String, Vec<Transaction>>,
    /// address → highest nonce seen in a committed block.
    committed_nonces: DashMap<String, i64>,
}

impl TransactionPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a transaction after verifying it.
    pub fn add(&self, tx: Transaction) -> Result<(), PoolError> {
        if !tx.verify() {
            return Err(PoolError::InvalidTransaction(tx.id));
        }
        if tx.is_nonced() {
            let committed = self.committed_nonce(&tx.address);
            if tx.nonce <= committed {
                return Err(PoolError::StaleNonce {
                    address: tx.address,
                    nonce: tx.nonce,
                    committed,
                });
            }
        }
        let mut list = self.pending.entry(tx.address.clone()).or_default();
        if list.iter().any(|existing| existing.id == tx.id) {
            return Err(PoolError::Duplicate(tx.id));
        }
        trace!(tx = %tx.id, address = %tx.address, nonce = tx.nonce, "transaction pooled");
        list.push(tx);
        Ok(())
    }

    /// The transactions that could execute right now, in a deterministic
    /// order (per-address nonce order, then timestamp across addresses).
    pub fn get_valid_transactions(&self) -> Vec<Transaction> {
        let mut result = Vec::new();
        for entry in self.pending.iter() {
            let committed = self.committed_nonce(entry.key());
            let mut nonced: Vec<&Transaction> =
                entry.value().iter().filter(|tx| tx.is_nonced()).collect();
            nonced.sort_by_key(|tx| tx.nonce);

            // Walk the consecutive run starting right after the committed
            // nonce; a gap parks the remainder.
            let mut expected = committed + 1;
            for tx in nonced {
                if tx.nonce == expected {
                    result.push(tx.clone());
                    expected += 1;
                } else if tx.nonce > expected {
                    break;
                }
            }
            result.extend(entry.value().iter().filter(|tx| !tx.is_nonced()).cloned());
        }
        result.sort_by_key(|tx| (tx.timestamp, tx.id.clone()));
        result
    }

    /// Drop every transaction included in `block` and advance the nonce
    /// trackers past the block's nonced transactions.
    pub fn clean_up_for_new_block(&self, block: &Block) {
        for tx in &block.transactions {
            if let Some(mut list) = self.pending.get_mut(&tx.address) {
                list.retain(|pending| pending.id != tx.id);
            }
        }
        self.pending.retain(|_, list| !list.is_empty());
        self.update_nonce_trackers(&block.transactions);
        debug!(
            committed = block.transactions.len(),
            remaining = self.size(),
            "pool cleaned for block"
        );
    }

    /// Advance committed-nonce trackers to cover `txs`, evicting pending
    /// transactions those trackers now make unexecutable.
    pub fn update_nonce_trackers(&self, txs: &[Transaction]) {
        for tx in txs.iter().filter(|tx| tx.is_nonced()) {
            let mut tracker = self.committed_nonces.entry(tx.address.clone()).or_insert(-1);
            if tx.nonce > *tracker {
                *tracker = tx.nonce;
            }
        }
        // Evict anything at or below its address's tracker.
        for tx in txs.iter().filter(|tx| tx.is_nonced()) {
            let committed = self.committed_nonce(&tx.address);
            if let Some(mut list) = self.pending.get_mut(&tx.address) {
                list.retain(|pending| !pending.is_nonced() || pending.nonce > committed);
            }
        }
    }

    /// Highest committed nonce for `address`; `-1` when none.
    pub fn committed_nonce(&self, address: &str) -> i64 {
        self.committed_nonces.get(address).map(|v| *v).unwrap_or(-1)
    }

    /// Total number of pending transactions.
    pub fn size(&self) -> usize {
        self.pending.iter().map(|entry| entry.value().len()).sum()
    }

    /// Whether the pool holds no pending transactions.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Whether a transaction with this id is pending.
    pub fn contains(&self, tx_id: &str) -> bool {
        self.pending
            .iter()
            .any(|entry| entry.value().iter().any(|tx| tx.id == tx_id))
    }
}
