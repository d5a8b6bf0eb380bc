//! Batch-period and fraud-proof messages gossiped between sequencers
//!
//! Each message is identified by the Keccak-256 of its unsigned fields; the scheduler
//! signs that same digest. `BatchPeriodStartMsg` travels in a compact fixed-layout
//! binary form, the other two as borsh.

use crate::cache::MessageKind;
use crate::error::{ConsensusError, Result};
use crate::events::{BatchPeriodEndEvent, BatchPeriodStartEvent, EventBus, FraudProofReorgEvent};
use crate::signer::{recover_signer, SigningKey};
use crate::types::{keccak256, Address, Hash, ADDRESS_LENGTH, SIGNATURE_LENGTH, UINT64_LENGTH};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Message codes on the consensus sub-protocol
pub mod codes {
    pub const BATCH_PERIOD_START: u64 = 0x00;
    pub const BATCH_PERIOD_END: u64 = 0x01;
    pub const FRAUD_PROOF_REORG: u64 = 0x02;
}

const START_HEADER_LENGTH: usize = UINT64_LENGTH * 5 + ADDRESS_LENGTH;

/// Minimum encoded size of a start message: header, one sequencer, signature
pub const MIN_START_MSG_LENGTH: usize = START_HEADER_LENGTH + ADDRESS_LENGTH + SIGNATURE_LENGTH;

/// A message kind that can be gossiped on the consensus sub-protocol
pub trait GossipMessage: Clone + Send + Sync + Sized + 'static {
    const KIND: MessageKind;
    const CODE: u64;

    /// Local event carrying this message
    type Event: Clone + Send + 'static;

    /// Content id over the unsigned fields
    fn hash(&self) -> Hash;

    fn to_payload(&self) -> Result<Vec<u8>>;

    fn from_payload(payload: &[u8]) -> Result<Self>;

    /// Address that signed `hash()`
    fn signer(&self) -> Result<Address>;

    /// Height used to look up the signing authority
    fn height(&self) -> u64;

    fn into_event(self) -> Self::Event;

    fn from_event(event: &Self::Event) -> Self;

    /// Bus channel for this kind
    fn channel(bus: &EventBus) -> &broadcast::Sender<Self::Event>;
}

/// Opens a batch period: `miner_address` may produce `[start_height, max_height)`
/// until `expire_time`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPeriodStartMsg {
    pub reorg_index: u64,
    pub batch_index: u64,
    pub start_height: u64,
    pub max_height: u64,
    /// Unix seconds
    pub expire_time: u64,
    pub miner_address: Address,
    pub sequencer_set: Vec<Address>,
    pub signature: Vec<u8>,
}

impl BatchPeriodStartMsg {
    fn unsigned_bytes(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(START_HEADER_LENGTH + self.sequencer_set.len() * ADDRESS_LENGTH);
        buf.extend_from_slice(&self.reorg_index.to_be_bytes());
        buf.extend_from_slice(&self.batch_index.to_be_bytes());
        buf.extend_from_slice(&self.start_height.to_be_bytes());
        buf.extend_from_slice(&self.max_height.to_be_bytes());
        buf.extend_from_slice(&self.expire_time.to_be_bytes());
        buf.extend_from_slice(self.miner_address.as_bytes());
        for sequencer in &self.sequencer_set {
            buf.extend_from_slice(sequencer.as_bytes());
        }
        buf
    }

    pub fn hash(&self) -> Hash {
        keccak256(&self.unsigned_bytes())
    }

    /// Compact binary form.
    ///
    /// `None` for an empty sequencer set or a signature of the wrong length; partial
    /// bytes are never produced.
    pub fn serialize(&self) -> Option<Vec<u8>> {
        if self.sequencer_set.is_empty() || self.signature.len() != SIGNATURE_LENGTH {
            return None;
        }
        let mut buf = self.unsigned_bytes();
        buf.extend_from_slice(&self.signature);
        Some(buf)
    }

    pub fn deserialize(buf: &[u8]) -> Option<Self> {
        if buf.len() < MIN_START_MSG_LENGTH {
            return None;
        }
        let set_length = buf.len() - START_HEADER_LENGTH - SIGNATURE_LENGTH;
        if set_length % ADDRESS_LENGTH != 0 {
            return None;
        }

        let word = |i: usize| -> Option<u64> {
            let start = i * UINT64_LENGTH;
            Some(u64::from_be_bytes(
                buf[start..start + UINT64_LENGTH].try_into().ok()?,
            ))
        };

        let miner_address =
            Address::from_slice(&buf[UINT64_LENGTH * 5..START_HEADER_LENGTH])?;
        let sequencer_set = buf[START_HEADER_LENGTH..START_HEADER_LENGTH + set_length]
            .chunks_exact(ADDRESS_LENGTH)
            .map(Address::from_slice)
            .collect::<Option<Vec<_>>>()?;

        Some(Self {
            reorg_index: word(0)?,
            batch_index: word(1)?,
            start_height: word(2)?,
            max_height: word(3)?,
            expire_time: word(4)?,
            miner_address,
            sequencer_set,
            signature: buf[buf.len() - SIGNATURE_LENGTH..].to_vec(),
        })
    }

    pub fn sign(&mut self, key: &SigningKey) -> Result<()> {
        self.signature = key.sign_hash(&self.hash())?;
        Ok(())
    }

    pub fn signer(&self) -> Result<Address> {
        recover_signer(&self.hash(), &self.signature)
    }

    /// Whether the period has lapsed at unix time `now`
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expire_time
    }
}

/// Closes the period opened by the matching start message
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub struct BatchPeriodEndMsg {
    pub reorg_index: u64,
    pub batch_index: u64,
    pub start_height: u64,
    pub end_height: u64,
    pub miner_address: Address,
    /// Per-sequencer signatures collected over the period
    pub signatures: Vec<Vec<u8>>,
    pub signature: Vec<u8>,
}

impl BatchPeriodEndMsg {
    pub fn hash(&self) -> Hash {
        let mut buf = Vec::with_capacity(UINT64_LENGTH * 4 + ADDRESS_LENGTH);
        buf.extend_from_slice(&self.reorg_index.to_be_bytes());
        buf.extend_from_slice(&self.batch_index.to_be_bytes());
        buf.extend_from_slice(&self.start_height.to_be_bytes());
        buf.extend_from_slice(&self.end_height.to_be_bytes());
        buf.extend_from_slice(self.miner_address.as_bytes());
        // count and lengths keep the id unique per signature list
        buf.extend_from_slice(&(self.signatures.len() as u64).to_be_bytes());
        for sig in &self.signatures {
            buf.extend_from_slice(&(sig.len() as u64).to_be_bytes());
            buf.extend_from_slice(sig);
        }
        keccak256(&buf)
    }

    pub fn sign(&mut self, key: &SigningKey) -> Result<()> {
        self.signature = key.sign_hash(&self.hash())?;
        Ok(())
    }

    pub fn signer(&self) -> Result<Address> {
        recover_signer(&self.hash(), &self.signature)
    }
}

/// Instructs the network to roll back to `reorg_to_height`
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub struct FraudProofReorgMsg {
    pub reorg_index: u64,
    pub reorg_to_height: u64,
    pub signature: Vec<u8>,
}

impl FraudProofReorgMsg {
    pub fn hash(&self) -> Hash {
        let mut buf = [0u8; UINT64_LENGTH * 2];
        buf[..UINT64_LENGTH].copy_from_slice(&self.reorg_index.to_be_bytes());
        buf[UINT64_LENGTH..].copy_from_slice(&self.reorg_to_height.to_be_bytes());
        keccak256(&buf)
    }

    pub fn sign(&mut self, key: &SigningKey) -> Result<()> {
        self.signature = key.sign_hash(&self.hash())?;
        Ok(())
    }

    pub fn signer(&self) -> Result<Address> {
        recover_signer(&self.hash(), &self.signature)
    }
}

fn borsh_encode<T: BorshSerialize>(value: &T) -> Result<Vec<u8>> {
    borsh::to_vec(value).map_err(|e| ConsensusError::Encode(e.to_string()))
}

fn borsh_decode<T: BorshDeserialize>(payload: &[u8]) -> Result<T> {
    borsh::from_slice(payload).map_err(|e| ConsensusError::Decode(e.to_string()))
}

impl GossipMessage for BatchPeriodStartMsg {
    const KIND: MessageKind = MessageKind::Start;
    const CODE: u64 = codes::BATCH_PERIOD_START;
    type Event = BatchPeriodStartEvent;

    fn hash(&self) -> Hash {
        BatchPeriodStartMsg::hash(self)
    }

    fn to_payload(&self) -> Result<Vec<u8>> {
        self.serialize().ok_or_else(|| {
            ConsensusError::Encode(format!(
                "malformed batch period start {}: {} sequencers, {} byte signature",
                self.batch_index,
                self.sequencer_set.len(),
                self.signature.len()
            ))
        })
    }

    fn from_payload(payload: &[u8]) -> Result<Self> {
        Self::deserialize(payload).ok_or_else(|| {
            ConsensusError::Decode(format!(
                "malformed batch period start of {} bytes",
                payload.len()
            ))
        })
    }

    fn signer(&self) -> Result<Address> {
        BatchPeriodStartMsg::signer(self)
    }

    fn height(&self) -> u64 {
        self.start_height
    }

    fn into_event(self) -> Self::Event {
        BatchPeriodStartEvent { msg: self }
    }

    fn from_event(event: &Self::Event) -> Self {
        event.msg.clone()
    }

    fn channel(bus: &EventBus) -> &broadcast::Sender<Self::Event> {
        &bus.start
    }
}

impl GossipMessage for BatchPeriodEndMsg {
    const KIND: MessageKind = MessageKind::End;
    const CODE: u64 = codes::BATCH_PERIOD_END;
    type Event = BatchPeriodEndEvent;

    fn hash(&self) -> Hash {
        BatchPeriodEndMsg::hash(self)
    }

    fn to_payload(&self) -> Result<Vec<u8>> {
        borsh_encode(self)
    }

    fn from_payload(payload: &[u8]) -> Result<Self> {
        borsh_decode(payload)
    }

    fn signer(&self) -> Result<Address> {
        BatchPeriodEndMsg::signer(self)
    }

    fn height(&self) -> u64 {
        self.start_height
    }

    fn into_event(self) -> Self::Event {
        BatchPeriodEndEvent { msg: self }
    }

    fn from_event(event: &Self::Event) -> Self {
        event.msg.clone()
    }

    fn channel(bus: &EventBus) -> &broadcast::Sender<Self::Event> {
        &bus.end
    }
}

impl GossipMessage for FraudProofReorgMsg {
    const KIND: MessageKind = MessageKind::FraudProofReorg;
    const CODE: u64 = codes::FRAUD_PROOF_REORG;
    type Event = FraudProofReorgEvent;

    fn hash(&self) -> Hash {
        FraudProofReorgMsg::hash(self)
    }

    fn to_payload(&self) -> Result<Vec<u8>> {
        borsh_encode(self)
    }

    fn from_payload(payload: &[u8]) -> Result<Self> {
        borsh_decode(payload)
    }

    fn signer(&self) -> Result<Address> {
        FraudProofReorgMsg::signer(self)
    }

    fn height(&self) -> u64 {
        self.reorg_to_height
    }

    fn into_event(self) -> Self::Event {
        FraudProofReorgEvent { msg: self }
    }

    fn from_event(event: &Self::Event) -> Self {
        event.msg.clone()
    }

    fn channel(bus: &EventBus) -> &broadcast::Sender<Self::Event> {
        &bus.fraud_proof_reorg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_msg() -> BatchPeriodStartMsg {
        BatchPeriodStartMsg {
            reorg_index: 1,
            batch_index: 7,
            start_height: 1000,
            max_height: 1100,
            expire_time: 1_700_000_000,
            miner_address: Address([0xaa; 20]),
            sequencer_set: vec![Address([1; 20]), Address([2; 20])],
            signature: vec![],
        }
    }

    #[test]
    fn test_start_msg_binary_layout() {
        let key = SigningKey::random();
        let mut msg = start_msg();
        msg.sign(&key).unwrap();

        let bytes = msg.serialize().unwrap();
        assert_eq!(bytes.len(), 40 + 20 + 2 * 20 + 65);
        assert_eq!(&bytes[8..16], &7u64.to_be_bytes());
        assert_eq!(&bytes[40..60], &[0xaa; 20]);

        let back = BatchPeriodStartMsg::deserialize(&bytes).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.signer().unwrap(), key.address());
    }

    #[test]
    fn test_start_msg_malformed_serializes_to_none() {
        let mut msg = start_msg();
        msg.signature = vec![0u8; SIGNATURE_LENGTH];
        assert!(msg.serialize().is_some());

        msg.signature = vec![0u8; 64];
        assert!(msg.serialize().is_none());

        let mut empty = start_msg();
        empty.signature = vec![0u8; SIGNATURE_LENGTH];
        empty.sequencer_set.clear();
        assert!(empty.serialize().is_none());
        assert!(empty.to_payload().is_err());
    }

    #[test]
    fn test_start_msg_deserialize_rejects_bad_lengths() {
        let mut msg = start_msg();
        msg.signature = vec![1u8; SIGNATURE_LENGTH];
        let bytes = msg.serialize().unwrap();

        // no sequencers
        assert!(BatchPeriodStartMsg::deserialize(&bytes[..START_HEADER_LENGTH + SIGNATURE_LENGTH])
            .is_none());
        // partial address
        assert!(BatchPeriodStartMsg::deserialize(&bytes[1..]).is_none());
        assert!(BatchPeriodStartMsg::deserialize(&[]).is_none());
        assert!(matches!(
            <BatchPeriodStartMsg as GossipMessage>::from_payload(&bytes[..10]),
            Err(ConsensusError::Decode(_))
        ));
    }

    #[test]
    fn test_hash_ignores_signature() {
        let key = SigningKey::random();
        let unsigned = start_msg();
        let mut signed = start_msg();
        signed.sign(&key).unwrap();
        assert_eq!(unsigned.hash(), signed.hash());

        let mut other = start_msg();
        other.batch_index += 1;
        assert_ne!(unsigned.hash(), other.hash());
    }

    #[test]
    fn test_is_expired() {
        let msg = start_msg();
        assert!(!msg.is_expired(msg.expire_time - 1));
        assert!(msg.is_expired(msg.expire_time));
    }

    #[test]
    fn test_end_msg_payload_and_signer() {
        let key = SigningKey::random();
        let mut msg = BatchPeriodEndMsg {
            reorg_index: 1,
            batch_index: 7,
            start_height: 1000,
            end_height: 1080,
            miner_address: Address([3; 20]),
            signatures: vec![vec![9; 65], vec![8; 65]],
            signature: vec![],
        };
        msg.sign(&key).unwrap();

        let payload = msg.to_payload().unwrap();
        let back = BatchPeriodEndMsg::from_payload(&payload).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.signer().unwrap(), key.address());
        assert_eq!(<BatchPeriodEndMsg as GossipMessage>::height(&back), 1000);
    }

    #[test]
    fn test_end_msg_hash_binds_signature_boundaries() {
        let key = SigningKey::random();
        let mut honest = BatchPeriodEndMsg {
            reorg_index: 0,
            batch_index: 4,
            start_height: 200,
            end_height: 299,
            miner_address: Address([5; 20]),
            signatures: vec![vec![0xaa; 65], vec![0xbb; 65]],
            signature: vec![],
        };
        honest.sign(&key).unwrap();

        let mut joined = honest.clone();
        joined.signatures = vec![[vec![0xaa; 65], vec![0xbb; 65]].concat()];
        let mut split = honest.clone();
        split.signatures = vec![vec![0xaa; 64], [vec![0xaa], vec![0xbb; 65]].concat()];
        let mut padded = honest.clone();
        padded.signatures.push(vec![]);

        assert_ne!(honest.hash(), joined.hash());
        assert_ne!(honest.hash(), split.hash());
        assert_ne!(honest.hash(), padded.hash());
        assert_ne!(joined.signer().ok(), Some(key.address()));
    }

    #[test]
    fn test_fraud_proof_reorg_payload_and_signer() {
        let key = SigningKey::random();
        let mut msg = FraudProofReorgMsg {
            reorg_index: 2,
            reorg_to_height: 950,
            signature: vec![],
        };
        msg.sign(&key).unwrap();

        let back = FraudProofReorgMsg::from_payload(&msg.to_payload().unwrap()).unwrap();
        assert_eq!(back.signer().unwrap(), key.address());
        assert!(FraudProofReorgMsg::from_payload(&[1, 2, 3]).is_err());
    }
}
