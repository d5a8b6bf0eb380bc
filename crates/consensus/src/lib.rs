//! L2 Consensus - sequencer rotation and batch-period gossip
//!
//! Architecture:
//! - A weighted round-robin `SequencerSet` elects the block producer
//! - `ProposerSnapshot`s record the rotation state per height in a key-value store
//! - The scheduler signs batch-period boundaries and posts them on the event bus
//! - `ConsensusProtocol` gossips them to peers, accepting only messages signed by the
//!   scheduler recorded for their height

pub mod cache;
pub mod engine;
pub mod error;
pub mod events;
pub mod message;
pub mod peer;
pub mod protocol;
pub mod scheduler;
pub mod sequencer;
pub mod serde_helpers;
pub mod signer;
pub mod snapshot;
pub mod store;
pub mod transport;
pub mod types;

#[cfg(test)]
mod tests;

pub use cache::{KnownCache, MessageKind, PeerMessageCache};
pub use engine::{Authority, PowerChange, ProducerSource, ProducerUpdate, RotationEngine, StaticAuthority};
pub use error::{ConsensusError, Result};
pub use events::{BatchPeriodEndEvent, BatchPeriodStartEvent, EventBus, FraudProofReorgEvent};
pub use message::{BatchPeriodEndMsg, BatchPeriodStartMsg, FraudProofReorgMsg, GossipMessage};
pub use peer::{Peer, PeerSet, PeerState};
pub use protocol::ConsensusProtocol;
pub use scheduler::{BatchScheduler, BatchSchedulerBuilder};
pub use sequencer::{Sequencer, SequencerSet, MAX_ROTATIONS};
pub use signer::{recover_signer, SigningKey};
pub use snapshot::ProposerSnapshot;
pub use store::{KeyValueStore, MemoryStore, SledStore};
pub use transport::{Msg, MsgReader, MsgWriter, PeerConnection};
pub use types::*;
