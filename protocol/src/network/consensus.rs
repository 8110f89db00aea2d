//! # Proof-of-Stake Consensus Engine
//!
//! The proposer-election + proposal-acceptance state machine. One proposal
//! phase, no finality voting: for each height the engine deterministically
//! elects a proposer from the stake-weighted validator set, either builds
//! and broadcasts a proposal (when elected) or waits for one, and commits
//! the accepted block. A round timeout re-elects with a fresh seed and
//! tries again.
//!
//! ## Status machine
//!
//! ```text
//! Starting -> Initialized -> Running <-> Stopped
//!     ^            |
//!     +--- init() error rewinds ---+
//! ```
//!
//! ## Proposer election
//!
//! For height n the validator set comes from the height-(n−1) registrants
//! that voted for block n−1, falling back to block n−1's `validators`
//! field (height 1 special-cases to the local account with the configured
//! stake). The election seed is `seed_block.hash ‖ decimal(round)`, where
//! the seed block sits `max_consensus_state_db` heights back (or is simply
//! the last block on a young chain). One deterministic sample in `[0, 1)`
//! scaled by the total stake picks the winner along the lexicographically
//! sorted cumulative-stake walk — identical on every honest node.
//!
//! ## Ownership
//!
//! The engine owns its `ConsensusState` and the round timer exclusively.
//! Everything else it touches through capabilities: a [`Node`] handle for
//! chain/pool/state access and a [`TransportOut`] for the four outbound
//! operations.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ConsensusConfig;
use crate::crypto::hash::seed_to_unit;
use crate::network::consensus_loop::ConsensusEvent;
use crate::network::node::Node;
use crate::network::timer::{RoundTimer, TimeoutKey};
use crate::network::transport::TransportOut;
use crate::storage::Block;
use crate::transaction::{Operation, TransactionData};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Wire messages of the consensus protocol.
///
/// Only the proposal phase exists today; the tagged representation leaves
/// room for vote phases without breaking the wire format. Malformed shapes
/// (wrong tag, missing value) fail serde deserialization at the transport
/// boundary and never reach the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum ConsensusMessage {
    /// A block proposed for the current height.
    #[serde(rename = "PROPOSE")]
    Propose(Block),
}

// ---------------------------------------------------------------------------
// Status & State
// ---------------------------------------------------------------------------

/// Lifecycle status of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusStatus {
    /// Constructed but not initialized (also the rewind target when
    /// `init` fails).
    Starting,
    /// Initialized, stake query done, about to run.
    Initialized,
    /// Participating: handling proposals and timeouts.
    Running,
    /// Stopped; state preserved, timers cleared.
    Stopped,
}

/// The engine's view of the height currently being decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusState {
    /// Height being decided: last committed number + 1.
    pub number: u64,
    /// Retry counter within the height; increments on proposal timeout.
    pub round: u64,
    /// Elected proposer for `(number, round)`, if any.
    pub proposer: Option<String>,
}

/// Errors surfaced by the consensus engine.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// A block the chain is supposed to contain cannot be found. Local
    /// state corruption: fatal to the caller, rewinds status to Starting.
    #[error("missing block {0} while resolving the validator set")]
    MissingBlock(u64),
}

// ---------------------------------------------------------------------------
// Election (pure)
// ---------------------------------------------------------------------------

/// Stake-weighted deterministic proposer election.
///
/// Walks the addresses in ascending lexicographic order, accumulating
/// stake; the first address whose cumulative stake exceeds
/// `seed_to_unit(seed) · total` wins. Terminates in at most
/// `validators.len()` comparisons. Returns `None` for an empty or
/// zero-stake set.
pub fn elect_proposer(validators: &BTreeMap<String, u64>, seed: &str) -> Option<String> {
    if validators.is_empty() {
        return None;
    }
    let total: u64 = validators.values().sum();
    if total == 0 {
        return None;
    }
    let target = seed_to_unit(seed) * total as f64;
    let mut cumulative = 0u64;
    for (address, stake) in validators {
        cumulative += stake;
        if cumulative as f64 > target {
            return Some(address.clone());
        }
    }
    // Unreachable while target < total, which seed_to_unit < 1 guarantees.
    warn!(seed, total, "cumulative stake walk selected nobody");
    None
}

// ---------------------------------------------------------------------------
// ConsensusEngine
// ---------------------------------------------------------------------------

/// The consensus state machine. See the module docs for the big picture.
pub struct ConsensusEngine {
    config: ConsensusConfig,
    node: Node,
    transport: Arc<dyn TransportOut>,
    status: ConsensusStatus,
    state: ConsensusState,
    timer: RoundTimer,
    /// Channel back into the runner for the trampoline `Advance` event.
    /// `None` in synchronous test setups, where the caller steps manually.
    events: Option<mpsc::UnboundedSender<ConsensusEvent>>,
}

impl ConsensusEngine {
    /// Build an engine over a node and a transport. The configuration is
    /// taken from the node's config record.
    pub fn new(node: Node, transport: Arc<dyn TransportOut>, timer: RoundTimer) -> Self {
        let config = node.config.consensus.clone();
        Self {
            config,
            node,
            transport,
            status: ConsensusStatus::Starting,
            state: ConsensusState {
                number: 0,
                round: 0,
                proposer: None,
            },
            timer,
            events: None,
        }
    }

    /// Install the runner's event channel; the trampoline between commit
    /// and the next proposal attempt goes through it.
    pub fn set_event_sender(&mut self, events: mpsc::UnboundedSender<ConsensusEvent>) {
        self.events = Some(events);
    }

    /// Current lifecycle status.
    pub fn status(&self) -> ConsensusStatus {
        self.status
    }

    /// The engine's current `(number, round, proposer)` view.
    pub fn state(&self) -> &ConsensusState {
        &self.state
    }

    /// The key in the timer slot, if a timeout is armed.
    pub fn armed_timeout(&self) -> Option<TimeoutKey> {
        self.timer.armed_key()
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Initialize the engine: pin the height to the chain head, query the
    /// local stake (issuing a deposit when configured and absent), and
    /// start running. Any error rewinds the status to `Starting`.
    pub fn init(&mut self) -> Result<(), ConsensusError> {
        let result = self.init_inner();
        if result.is_err() {
            self.status = ConsensusStatus::Starting;
        }
        result
    }

    fn init_inner(&mut self) -> Result<(), ConsensusError> {
        self.state.number = self.node.bc.read().expected_next_number();
        self.status = ConsensusStatus::Initialized;

        let address = self.node.address();
        let current_stake = if self.state.number == 1 {
            self.get_valid_consensus_deposit(&address)
        } else {
            self.get_stake_at_number(self.state.number, &address)?
        };
        info!(
            number = self.state.number,
            stake = current_stake,
            "consensus engine initialized"
        );
        if current_stake == 0 && self.config.stake > 0 {
            self.stake(self.config.stake);
        }
        self.start();
        Ok(())
    }

    /// Begin (or resume) participation. Snaps the state to the chain head.
    pub fn start(&mut self) {
        self.status = ConsensusStatus::Running;
        info!("consensus engine running");
        self.update_to_state();
    }

    /// Stop participating. State is preserved; the timer is cleared.
    pub fn stop(&mut self) {
        self.status = ConsensusStatus::Stopped;
        self.timer.cancel();
        info!("consensus engine stopped");
    }

    // -- Height/round advancement -------------------------------------------

    /// Re-anchor the state to the chain head: `number = last + 1`,
    /// `round = 0`, proposer re-elected. Aborts when the engine is ahead
    /// of the chain (inconsistent; a commit must have failed upstream).
    ///
    /// The follow-up `try_propose` is trampolined through the runner after
    /// `transition_timeout`; in synchronous setups the caller invokes it.
    pub fn update_to_state(&mut self) {
        let next = self.node.bc.read().expected_next_number();
        if self.state.number > next {
            warn!(
                state_number = self.state.number,
                chain_next = next,
                "consensus state is ahead of the chain, aborting state update"
            );
            return;
        }
        self.state.number = next;
        self.state.round = 0;
        self.state.proposer = self.select_proposer();
        debug!(
            number = self.state.number,
            proposer = self.state.proposer.as_deref().unwrap_or("<none>"),
            "advanced to new height"
        );
        self.schedule_advance();
    }

    fn schedule_advance(&self) {
        if let Some(events) = &self.events {
            let events = events.clone();
            let delay = self.config.transition_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(ConsensusEvent::Advance);
            });
        }
    }

    // -- Election -----------------------------------------------------------

    /// Elect the proposer for the current `(number, round)`.
    pub fn select_proposer(&self) -> Option<String> {
        let validators = match self.validators_for_height(self.state.number) {
            Ok(validators) => validators,
            Err(e) => {
                error!(error = %e, "cannot resolve validator set");
                return None;
            }
        };
        let seed_hash = self.seed_block_hash()?;
        let seed = format!("{seed_hash}{}", self.state.round);
        elect_proposer(&validators, &seed)
    }

    /// Hash of the seed block for the current height: the block
    /// `max_consensus_state_db` positions back, or the last block while
    /// the chain is shorter than the window.
    fn seed_block_hash(&self) -> Option<String> {
        let bc = self.node.bc.read();
        if self.state.number <= self.config.max_consensus_state_db {
            return bc.last_block().map(|b| b.hash.clone());
        }
        let seed_number = self.state.number - self.config.max_consensus_state_db;
        match bc.get_block_by_number(seed_number) {
            Some(block) => Some(block.hash),
            None => {
                error!(seed_number, "seed block missing from the chain");
                None
            }
        }
    }

    /// The validator set for deciding height `number`.
    ///
    /// Height ≤ 1: the local account with the configured stake (a network
    /// bootstraps from its first node). Otherwise: the height-(n−1)
    /// registrants that voted for block n−1, or — when nobody registered —
    /// the `validators` field recorded on block n−1.
    fn validators_for_height(&self, number: u64) -> Result<BTreeMap<String, u64>, ConsensusError> {
        if number <= 1 {
            let mut validators = BTreeMap::new();
            if self.config.stake > 0 {
                validators.insert(self.node.address(), self.config.stake);
            }
            return Ok(validators);
        }
        let prev = self
            .node
            .bc
            .read()
            .get_block_by_number(number - 1)
            .ok_or(ConsensusError::MissingBlock(number - 1))?;
        let voted = self.get_validators_voted_for(number - 1, &prev.hash);
        if voted.is_empty() {
            Ok(prev.validators)
        } else {
            Ok(voted)
        }
    }

    /// Registrants of height `number` whose recorded vote names
    /// `block_hash`, as address → stake.
    fn get_validators_voted_for(&self, number: u64, block_hash: &str) -> BTreeMap<String, u64> {
        let registry = self
            .node
            .db
            .read()
            .get_value(&format!("/consensus/number/{number}/register"));
        let mut voted = BTreeMap::new();
        if let Some(Value::Object(entries)) = registry {
            for (address, record) in entries {
                let matches_block = record["block_hash"].as_str() == Some(block_hash);
                let stake = record["stake"].as_u64().unwrap_or(0);
                if matches_block && stake > 0 {
                    voted.insert(address, stake);
                }
            }
        }
        voted
    }

    // -- Proposal attempt ---------------------------------------------------

    /// Arm the round timeout and, when the local account is the elected
    /// proposer, build a proposal and feed it through the local handler as
    /// if it had arrived from the network.
    pub fn try_propose(&mut self) {
        let key = TimeoutKey {
            number: self.state.number,
            round: self.state.round,
        };
        self.timer.arm(key, self.config.proposal_timeout);

        match self.state.proposer.clone() {
            Some(proposer) if proposer == self.node.address() => {
                info!(
                    number = self.state.number,
                    round = self.state.round,
                    "elected proposer, building block proposal"
                );
                if let Some(block) = self.create_block_proposal() {
                    self.handle_consensus_message(ConsensusMessage::Propose(block));
                }
            }
            Some(proposer) => {
                debug!(
                    number = self.state.number,
                    round = self.state.round,
                    %proposer,
                    "awaiting proposal"
                );
            }
            None => {
                debug!(
                    number = self.state.number,
                    round = self.state.round,
                    "no proposer this round, waiting out the timeout"
                );
            }
        }
    }

    /// Assemble the block proposal for the current height.
    ///
    /// The transaction list is the pool's valid set plus one consensus-
    /// update transaction carrying the proposal record; past the state-db
    /// window the update also null-deletes the record that just aged out.
    /// The update executes locally right away so the proposer's own view
    /// reflects the proposal.
    pub fn create_block_proposal(&mut self) -> Option<Block> {
        let (last_number, last_hash) = {
            let bc = self.node.bc.read();
            let last = bc.last_block()?;
            (last.number, last.hash.clone())
        };
        let block_number = self.state.number;
        let mut transactions = self.node.tp.get_valid_transactions();

        let validators = self.get_validators_voted_for(last_number, &last_hash);
        let total_at_stake: u64 = validators.values().sum();

        let propose_op = Operation::set_value(
            format!("/consensus/number/{block_number}/propose"),
            json!({
                "number": block_number,
                "validators": validators,
                "total_at_stake": total_at_stake,
                "proposer": self.node.address(),
            }),
        );
        let operation = if block_number <= self.config.max_consensus_state_db {
            propose_op
        } else {
            // Drop the consensus record that just slid out of the window,
            // keeping the state db bounded.
            let aged_out = block_number - self.config.max_consensus_state_db;
            Operation::SetList {
                op_list: vec![
                    propose_op,
                    Operation::set_value(format!("/consensus/number/{aged_out}"), Value::Null),
                ],
            }
        };

        let consensus_tx = self
            .node
            .create_transaction(TransactionData::new(operation), false);
        self.transport.execute_transaction(&consensus_tx);
        transactions.push(consensus_tx);

        Some(Block::new(
            last_hash,
            transactions,
            block_number,
            self.node.address(),
            validators,
        ))
    }

    // -- Reception ----------------------------------------------------------

    /// Dispatch one consensus message. Only a running engine accepts
    /// anything.
    ///
    /// Decision table for a proposal at `value.number`:
    /// below the current height → stale, silent drop; above → the chain
    /// fell behind, request a catch-up subsection; at the height → check,
    /// commit, re-broadcast.
    pub fn handle_consensus_message(&mut self, msg: ConsensusMessage) {
        if self.status != ConsensusStatus::Running {
            debug!(status = ?self.status, "dropping consensus message while not running");
            return;
        }
        match msg {
            ConsensusMessage::Propose(block) => self.handle_proposal(block),
        }
    }

    fn handle_proposal(&mut self, block: Block) {
        if block.number < self.state.number {
            debug!(
                got = block.number,
                current = self.state.number,
                "stale proposal dropped"
            );
            return;
        }
        if block.number > self.state.number {
            info!(
                got = block.number,
                current = self.state.number,
                "proposal from the future, requesting chain subsection"
            );
            let ref_block = {
                let mut bc = self.node.bc.write();
                bc.set_synced_after_startup(false);
                // A cold chain syncs from genesis.
                bc.last_block().cloned().unwrap_or_else(Block::genesis)
            };
            self.transport.request_chain_subsection(&ref_block);
            return;
        }
        if !self.check_proposal(&block) {
            return;
        }
        self.commit(block.clone());
        self.transport
            .broadcast_consensus_message(&ConsensusMessage::Propose(block));
    }

    /// A proposal is acceptable when it validates against the chain tip
    /// and names the proposer this engine elected.
    pub fn check_proposal(&self, block: &Block) -> bool {
        let (expected_number, expected_last_hash) = {
            let bc = self.node.bc.read();
            (
                bc.expected_next_number(),
                bc.last_block().map(|b| b.hash.clone()).unwrap_or_default(),
            )
        };
        if !block.validate_proposed_block(expected_number, &expected_last_hash) {
            return false;
        }
        match &self.state.proposer {
            Some(elected) if *elected == block.proposer => true,
            Some(elected) => {
                warn!(
                    got = %block.proposer,
                    %elected,
                    "proposal from the wrong proposer"
                );
                false
            }
            None => {
                warn!(got = %block.proposer, "proposal received but nobody is elected");
                false
            }
        }
    }

    // -- Commit -------------------------------------------------------------

    /// Append the accepted block, register for it when staked, and advance
    /// to the next height.
    pub fn commit(&mut self, block: Block) {
        if !self.node.add_new_block(block.clone()) {
            error!(number = block.number, "failed to append accepted block");
            return;
        }
        info!(
            number = block.number,
            hash = %block.hash,
            txs = block.transactions.len(),
            "block committed"
        );
        self.try_register(&block);
        self.update_to_state();
    }

    /// Attest on-chain that this node saw `block` as the selected block of
    /// its height. Emitted only when the local account holds a valid
    /// consensus deposit; the deposit's current value is the attested
    /// stake.
    fn try_register(&mut self, block: &Block) {
        let address = self.node.address();
        let stake = self.get_valid_consensus_deposit(&address);
        if stake == 0 {
            return;
        }
        let op = Operation::set_value(
            format!("/consensus/number/{}/register/{address}", block.number),
            json!({ "block_hash": block.hash, "stake": stake }),
        );
        let tx = self.node.create_transaction(TransactionData::new(op), true);
        debug!(number = block.number, stake, "registering for committed block");
        self.transport.execute_and_broadcast_transaction(&tx);
    }

    // -- Timeout ------------------------------------------------------------

    /// React to a fired `(number, round)` timeout: if it is still current,
    /// advance the round (changing the election seed), re-elect, and try
    /// again. Anything the engine has moved past is ignored.
    pub fn handle_timeout(&mut self, key: TimeoutKey) {
        if self.status != ConsensusStatus::Running {
            return;
        }
        if key.number != self.state.number || key.round < self.state.round {
            debug!(?key, number = self.state.number, round = self.state.round, "stale timeout ignored");
            return;
        }
        self.state.round = key.round + 1;
        self.state.proposer = self.select_proposer();
        info!(
            number = self.state.number,
            round = self.state.round,
            proposer = self.state.proposer.as_deref().unwrap_or("<none>"),
            "proposal timeout, advancing round"
        );
        self.try_propose();
    }

    // -- Stake & deposit helpers --------------------------------------------

    /// The valid consensus deposit of `address`: its recorded value when
    /// positive and not expiring within the next day, else 0.
    pub fn get_valid_consensus_deposit(&self, address: &str) -> u64 {
        let deposit = self
            .node
            .db
            .read()
            .get_value(&format!("/deposit_accounts/consensus/{address}"));
        let Some(deposit) = deposit else { return 0 };
        let value = deposit["value"].as_u64().unwrap_or(0);
        let expire_at = deposit["expire_at"].as_u64().unwrap_or(0);
        let now = Utc::now().timestamp_millis() as u64;
        if value > 0 && expire_at > now + self.config.day.as_millis() as u64 {
            value
        } else {
            0
        }
    }

    /// The stake `address` held in the validator set that decided height
    /// `number` (recorded on block `number − 1`). Heights ≤ 1 predate any
    /// validator set. A missing previous block is local state corruption.
    pub fn get_stake_at_number(&self, number: u64, address: &str) -> Result<u64, ConsensusError> {
        if number <= 1 {
            return Ok(0);
        }
        let prev = self
            .node
            .bc
            .read()
            .get_block_by_number(number - 1)
            .ok_or(ConsensusError::MissingBlock(number - 1))?;
        Ok(prev.validators.get(address).copied().unwrap_or(0))
    }

    /// Issue a deposit request for `amount` and broadcast it. Zero amounts
    /// are ignored.
    pub fn stake(&mut self, amount: u64) {
        if amount == 0 {
            warn!("ignoring zero stake request");
            return;
        }
        let address = self.node.address();
        let push_id = Uuid::new_v4();
        let op = Operation::set_value(
            format!("/deposit/consensus/{address}/{push_id}/value"),
            json!(amount),
        );
        let tx = self.node.create_transaction(TransactionData::new(op), true);
        info!(amount, "issuing consensus stake deposit");
        self.transport.execute_and_broadcast_transaction(&tx);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
