//! # Node — State Reconstruction & Local Account
//!
//! The `Node` owns the durable sources of truth — the block store, the
//! transaction pool, the live state db — and knows how to rebuild the live
//! view deterministically:
//!
//! ```text
//! live db  =  snapshot db (aged-out blocks)
//!          +  in-memory blocks, in order
//!          +  currently-valid pool transactions
//! ```
//!
//! The result is the node's *speculative head*: committed state plus what
//! the pool would do to it. Reconstruction runs after every committed block
//! and is idempotent — rebuilding twice with no intervening mutation gives
//! the same contents.
//!
//! The node also owns the nonce counter for the local account. On init it
//! recovers the counter by scanning the in-memory chain from newest to
//! oldest for the highest own nonced transaction.
//!
//! Subsystems are individually `Arc`-shared with interior mutability, so a
//! `Node` clone is a handle, not a copy; the consensus engine and the
//! transport each hold one.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::NodeConfig;
use crate::crypto::keys::LumenKeypair;
use crate::network::mempool::TransactionPool;
use crate::storage::store::StoreError;
use crate::storage::{Block, BlockStore, StateDb};
use crate::transaction::{Transaction, TransactionData, NONCE_NON_NONCED};

/// Top-level owner of chain, pool, state, and the local account.
#[derive(Clone)]
pub struct Node {
    /// Node configuration (ports, stake, directories).
    pub config: Arc<NodeConfig>,
    /// The local account keypair.
    pub account: Arc<LumenKeypair>,
    /// The append-only block store.
    pub bc: Arc<RwLock<BlockStore>>,
    /// Pending-transaction pool.
    pub tp: Arc<TransactionPool>,
    /// The live state db (the speculative head view).
    pub db: Arc<RwLock<StateDb>>,
    /// Next nonce for the local account.
    nonce: Arc<AtomicI64>,
}

impl Node {
    /// Create a node over `config`, resolving the account from
    /// `account_index` (or generating a fresh one).
    pub fn new(config: NodeConfig) -> Self {
        let account = match config.account_index {
            Some(index) => LumenKeypair::from_account_index(index),
            None => LumenKeypair::generate(),
        };
        info!(address = %account.address(), port = config.port, "node created");
        let chain_dir = config.chain_dir();
        Self {
            config: Arc::new(config),
            account: Arc::new(account),
            bc: Arc::new(RwLock::new(BlockStore::new(chain_dir))),
            tp: Arc::new(TransactionPool::new()),
            db: Arc::new(RwLock::new(StateDb::new())),
            nonce: Arc::new(AtomicI64::new(0)),
        }
    }

    /// The local account address.
    pub fn address(&self) -> String {
        self.account.address().to_string()
    }

    /// Initialize the node: bring up the block store, recover the local
    /// nonce from the in-memory chain, and build the initial live view.
    pub fn init(&self, is_first_node: bool) -> Result<(), StoreError> {
        self.bc.write().init(is_first_node)?;
        let initial = self.compute_initial_nonce();
        self.nonce.store(initial, Ordering::SeqCst);
        info!(nonce = initial, "node state initialized");
        self.reconstruct();
        Ok(())
    }

    /// Recover `max(own nonce) + 1` by scanning the in-memory chain from
    /// newest to oldest; 0 when the account never transacted.
    fn compute_initial_nonce(&self) -> i64 {
        let address = self.account.address();
        let bc = self.bc.read();
        let highest = bc
            .in_memory_chain()
            .rev()
            .flat_map(|block| block.transactions.iter())
            .filter(|tx| tx.address == address && tx.nonce >= 0)
            .map(|tx| tx.nonce)
            .max();
        highest.map_or(0, |n| n + 1)
    }

    /// Rebuild the live db: snapshot, then every in-memory block's
    /// transactions in order, then the currently-valid pool transactions.
    pub fn reconstruct(&self) {
        let bc = self.bc.read();
        let mut db = self.db.write();
        db.set_db_to_snapshot(bc.snapshot());
        for block in bc.in_memory_chain() {
            db.execute_transaction_list(&block.transactions);
        }
        drop(bc);
        let pool_txs = self.tp.get_valid_transactions();
        db.execute_transaction_list(&pool_txs);
        debug!(pool_txs = pool_txs.len(), "live state reconstructed");
    }

    /// Append a block through the store; on success clean the pool against
    /// it and rebuild the live view.
    pub fn add_new_block(&self, block: Block) -> bool {
        if !self.bc.write().add_new_block(block.clone()) {
            return false;
        }
        self.tp.clean_up_for_new_block(&block);
        self.reconstruct();
        true
    }

    /// Build and sign one transaction.
    ///
    /// Non-nonced transactions carry nonce −1 and skip per-account
    /// ordering; nonced transactions take the next local counter value.
    /// An `address` override disables downstream signature verification
    /// (`skip_verif`), since the local key cannot sign for someone else.
    pub fn create_transaction(&self, data: TransactionData, is_nonced: bool) -> Transaction {
        let nonce = if is_nonced {
            self.nonce.fetch_add(1, Ordering::SeqCst)
        } else {
            NONCE_NON_NONCED
        };
        let (address, skip_verif) = match data.address {
            Some(addr) => (addr, true),
            None => (self.address(), false),
        };
        let mut tx = Transaction::new(data.operation, address, nonce);
        tx.skip_verif = skip_verif;
        tx.sign(&self.account);
        tx
    }

    /// Build a batch of transactions with a shared noncing mode.
    pub fn create_transactions(
        &self,
        batch: Vec<TransactionData>,
        is_nonced: bool,
    ) -> Vec<Transaction> {
        batch
            .into_iter()
            .map(|data| self.create_transaction(data, is_nonced))
            .collect()
    }

    /// Current value of the local nonce counter (next nonce to assign).
    pub fn current_nonce(&self) -> i64 {
        self.nonce.load(Ordering::SeqCst)
    }
}
