//! Node runtime: the consensus engine and its collaborators — the
//! transaction pool, the state reconstructor, the timer service, the
//! outbound transport capability, and the serialized event loop.

pub mod consensus;
pub mod consensus_loop;
pub mod mempool;
pub mod node;
pub mod timer;
pub mod transport;

pub use consensus::{
    elect_proposer, ConsensusEngine, ConsensusError, ConsensusMessage, ConsensusState,
    ConsensusStatus,
};
pub use consensus_loop::{ConsensusEvent, ConsensusRunner};
pub use mempool::{PoolError, TransactionPool};
pub use node::Node;
pub use timer::{RoundTimer, TimeoutKey};
pub use transport::{LoopbackTransport, TransportOut};
