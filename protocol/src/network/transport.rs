//! Outbound transport capability.
//!
//! The consensus engine never talks to sockets. It holds a
//! [`TransportOut`] — the four outbound operations the networking layer
//! owes it — and stays ignorant of framing, peers, and discovery. This is
//! also what breaks the engine ↔ server ownership cycle: the engine holds
//! a capability, not the server.
//!
//! [`LoopbackTransport`] is the provided implementation for single-node
//! operation and tests: transactions execute against the local node and
//! outbound broadcasts are logged instead of hitting a wire.

use tracing::{debug, info};

use crate::network::consensus::ConsensusMessage;
use crate::network::node::Node;
use crate::storage::Block;
use crate::transaction::Transaction;

/// The outbound operations the consensus engine may invoke.
///
/// Every method is fire-and-forget from the engine's point of view, and
/// none may call back into the engine synchronously.
pub trait TransportOut: Send + Sync {
    /// Gossip a consensus message to peers.
    fn broadcast_consensus_message(&self, msg: &ConsensusMessage);

    /// Execute a transaction locally and gossip it to peers.
    fn execute_and_broadcast_transaction(&self, tx: &Transaction);

    /// Execute a transaction locally only.
    fn execute_transaction(&self, tx: &Transaction);

    /// Ask a peer for a chain subsection starting at `ref_block`.
    fn request_chain_subsection(&self, ref_block: &Block);
}

/// Loopback transport: executes transactions on the local node, logs what
/// would have been broadcast.
///
/// This is the whole transport story for a single-node devnet — the chain
/// advances without any peer — and the default wiring for tests.
pub struct LoopbackTransport {
    node: Node,
}

impl LoopbackTransport {
    pub fn new(node: Node) -> Self {
        Self { node }
    }

    fn apply_locally(&self, tx: &Transaction) {
        self.node.db.write().execute_transaction(tx);
        // Pool insertion may legitimately fail (duplicate re-delivery);
        // the transaction has already taken effect on the local view.
        if let Err(e) = self.node.tp.add(tx.clone()) {
            debug!(tx = %tx.id, error = %e, "loopback pool insert skipped");
        }
    }
}

impl TransportOut for LoopbackTransport {
    fn broadcast_consensus_message(&self, msg: &ConsensusMessage) {
        match msg {
            ConsensusMessage::Propose(block) => {
                info!(number = block.number, hash = %block.hash, "broadcast: consensus proposal");
            }
        }
    }

    fn execute_and_broadcast_transaction(&self, tx: &Transaction) {
        self.apply_locally(tx);
        info!(tx = %tx.id, "broadcast: transaction");
    }

    fn execute_transaction(&self, tx: &Transaction) {
        self.apply_locally(tx);
    }

    fn request_chain_subsection(&self, ref_block: &Block) {
        info!(
            number = ref_block.number,
            "no peers on loopback transport, chain subsection request dropped"
        );
    }
}
