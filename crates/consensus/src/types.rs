//! Core types shared by rotation, snapshots and gossip

use crate::error::ConsensusError;
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

/// Length of an account address in bytes
pub const ADDRESS_LENGTH: usize = 20;

/// Length of a recoverable secp256k1 signature (r || s || v)
pub const SIGNATURE_LENGTH: usize = 65;

/// Length of a big-endian u64 on the wire
pub const UINT64_LENGTH: usize = 8;

/// 32-byte Keccak-256 digest
pub type Hash = [u8; 32];

/// Keccak-256 of `data`
pub fn keccak256(data: &[u8]) -> Hash {
    Keccak256::digest(data).into()
}

/// 20-byte account identity
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BorshSerialize, BorshDeserialize,
)]
pub struct Address(pub [u8; ADDRESS_LENGTH]);

impl Address {
    pub const ZERO: Self = Self([0u8; ADDRESS_LENGTH]);

    /// Build an address from a slice of exactly 20 bytes
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; ADDRESS_LENGTH] = slice.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl FromStr for Address {
    type Err = ConsensusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw).map_err(|e| ConsensusError::Decode(e.to_string()))?;
        Self::from_slice(&bytes).ok_or_else(|| {
            ConsensusError::Decode(format!(
                "address must be {} bytes, got {}",
                ADDRESS_LENGTH,
                bytes.len()
            ))
        })
    }
}

impl From<[u8; ADDRESS_LENGTH]> for Address {
    fn from(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Configuration for the consensus gossip layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Maximum untrusted peers on the consensus sub-protocol
    pub max_peers: usize,
    /// Largest frame accepted before decoding
    pub max_msg_size: usize,
    /// Known batch-period start ids remembered per peer
    pub max_known_start_msgs: usize,
    /// Known batch-period end ids remembered per peer
    pub max_known_end_msgs: usize,
    /// Known fraud-proof reorg ids remembered per peer
    pub max_known_fraud_proof_msgs: usize,
    /// Outbound queue depth per peer and message kind
    pub max_queued_msgs: usize,
    /// Capacity of each local event channel
    pub event_capacity: usize,
    /// Height span of one producer assignment
    pub epoch: u64,
    /// Peer addresses (`0x` hex) allowed past the peer limit
    pub trusted_peers: Vec<String>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            max_peers: 50,
            max_msg_size: 10 * 1024 * 1024,
            max_known_start_msgs: 1024,
            max_known_end_msgs: 1024,
            max_known_fraud_proof_msgs: 1024,
            max_queued_msgs: 16,
            event_capacity: 256,
            epoch: 100,
            trusted_peers: Vec::new(),
        }
    }
}

/// Counters exposed by the gossip protocol
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsensusStats {
    pub connected_peers: usize,
    pub messages_received: u64,
    pub messages_accepted: u64,
    pub messages_rejected: u64,
    pub messages_broadcast: u64,
    pub messages_dropped: u64,
}
