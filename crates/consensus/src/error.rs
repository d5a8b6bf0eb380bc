//! Consensus errors

use crate::types::Address;
use thiserror::Error;

/// Errors raised by the rotation, snapshot and gossip layers
#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("sequencer set is empty")]
    EmptySet,

    #[error("invalid weight {power} for sequencer {address}")]
    InvalidWeight { address: Address, power: i64 },

    #[error("duplicate sequencer {0}")]
    DuplicateSequencer(Address),

    #[error("cannot rotate {times} times in one step, limit is {max}")]
    TooManyRotations { times: u64, max: u64 },

    #[error("proposer snapshot not found at height {0}")]
    NotFound(u64),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("no batch period is open")]
    NoOpenPeriod,

    #[error("too many peers")]
    TooManyPeers,

    #[error("peer {0} already registered")]
    AlreadyRegistered(String),

    #[error("peer {0} not registered")]
    NotRegistered(String),

    #[error("invalid message code {0}")]
    InvalidMessageCode(u64),

    #[error("message too large: {size} > {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("signature error: {0}")]
    Signature(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConsensusError {
    /// Errors a remote peer caused by sending something this protocol does not allow.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ConsensusError::InvalidMessageCode(_)
                | ConsensusError::MessageTooLarge { .. }
                | ConsensusError::Decode(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
