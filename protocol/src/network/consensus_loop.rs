//! # Consensus Runner — Serialized Event Loop
//!
//! The engine itself is synchronous; this runner is the single logical
//! executor the protocol assumes. Every stimulus — an inbound consensus
//! message, a fired round timeout, the post-commit trampoline — arrives as
//! a [`ConsensusEvent`] on one queue and is dispatched to the engine one
//! at a time. A proposal received while another is mid-commit therefore
//! observes the post-commit state, and timer callbacks self-invalidate
//! through the `(number, round)` check.
//!
//! The trampoline deserves a note: `update_to_state` does not call
//! `try_propose` directly. It schedules an [`ConsensusEvent::Advance`]
//! after `transition_timeout`, which flattens the otherwise unbounded
//! commit → propose → commit call chain into queue hops.
//!
//! Shutdown follows the house pattern: a `tokio::sync::watch` channel,
//! checked between events and inside the select.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::network::consensus::{ConsensusEngine, ConsensusError, ConsensusMessage};
use crate::network::node::Node;
use crate::network::timer::{RoundTimer, TimeoutKey};
use crate::network::transport::TransportOut;

/// A stimulus for the consensus engine.
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    /// An inbound consensus message (from the network layer).
    Message(ConsensusMessage),
    /// A round timeout fired.
    Timeout(TimeoutKey),
    /// Trampoline: attempt the next proposal.
    Advance,
}

/// Drives a [`ConsensusEngine`] from an event queue until shutdown.
pub struct ConsensusRunner {
    engine: ConsensusEngine,
    events_tx: mpsc::UnboundedSender<ConsensusEvent>,
    events_rx: mpsc::UnboundedReceiver<ConsensusEvent>,
    timeouts_rx: mpsc::UnboundedReceiver<TimeoutKey>,
}

impl ConsensusRunner {
    /// Wire up an engine with a live timer and the trampoline channel.
    pub fn new(node: Node, transport: Arc<dyn TransportOut>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (timer_tx, timeouts_rx) = mpsc::unbounded_channel();
        let mut engine = ConsensusEngine::new(node, transport, RoundTimer::live(timer_tx));
        engine.set_event_sender(events_tx.clone());
        Self {
            engine,
            events_tx,
            events_rx,
            timeouts_rx,
        }
    }

    /// A sender the inbound network layer uses to inject consensus
    /// messages into the loop.
    pub fn handle(&self) -> mpsc::UnboundedSender<ConsensusEvent> {
        self.events_tx.clone()
    }

    /// Initialize the engine and process events until the shutdown signal
    /// fires. Returns the engine's init error, if any.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConsensusError> {
        self.engine.init()?;
        info!("consensus runner started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown too.
                    if changed.is_err() || *shutdown.borrow() {
                        self.engine.stop();
                        info!("consensus runner shut down");
                        return Ok(());
                    }
                }
                Some(event) = self.events_rx.recv() => self.dispatch(event),
                Some(key) = self.timeouts_rx.recv() => self.engine.handle_timeout(key),
            }
        }
    }

    fn dispatch(&mut self, event: ConsensusEvent) {
        match event {
            ConsensusEvent::Message(msg) => self.engine.handle_consensus_message(msg),
            ConsensusEvent::Timeout(key) => self.engine.handle_timeout(key),
            ConsensusEvent::Advance => {
                debug!("trampoline advance");
                self.engine.try_propose();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConsensusConfig, NodeConfig};
    use crate::network::transport::LoopbackTransport;
    use std::time::Duration;

    fn fast_config(stake: u64, dir: &std::path::Path) -> NodeConfig {
        NodeConfig {
            port: 9100,
            account_index: Some(0),
            is_first_node: true,
            data_dir: dir.to_path_buf(),
            consensus: ConsensusConfig {
                stake,
                proposal_timeout: Duration::from_millis(200),
                transition_timeout: Duration::from_millis(2),
                ..ConsensusConfig::default()
            },
        }
    }

    #[tokio::test]
    async fn single_validator_chain_advances() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(fast_config(100, dir.path()));
        node.init(true).unwrap();

        let transport = Arc::new(LoopbackTransport::new(node.clone()));
        let runner = ConsensusRunner::new(node.clone(), transport);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(runner.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        // The trampoline drove several proposal/commit cycles.
        let height = node.bc.read().last_block_number().unwrap();
        assert!(height >= 2, "chain stuck at height {height}");
    }

    #[tokio::test]
    async fn observer_without_stake_times_out_rounds() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config(0, dir.path());
        config.consensus.proposal_timeout = Duration::from_millis(20);
        let node = Node::new(config);
        node.init(true).unwrap();

        let transport = Arc::new(LoopbackTransport::new(node.clone()));
        let runner = ConsensusRunner::new(node.clone(), transport);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(runner.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        // No proposer without stake: the chain never advances past genesis.
        assert_eq!(node.bc.read().last_block_number(), Some(0));
    }
}
