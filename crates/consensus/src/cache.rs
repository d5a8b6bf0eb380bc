//! Bounded sets of message ids a peer is known to have
//!
//! A fixed-capacity dedup window, oldest id evicted first. Forgetting an id only costs
//! a redundant send, so eviction never has to be exact.

use crate::types::{ConsensusConfig, Hash};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

/// Gossiped message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Start,
    End,
    FraudProofReorg,
}

impl MessageKind {
    pub const ALL: [MessageKind; 3] = [
        MessageKind::Start,
        MessageKind::End,
        MessageKind::FraudProofReorg,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Start => "batch_period_start",
            MessageKind::End => "batch_period_end",
            MessageKind::FraudProofReorg => "fraud_proof_reorg",
        }
    }
}

/// Insertion-ordered id set with a ceiling
#[derive(Debug)]
pub struct KnownCache {
    order: VecDeque<Hash>,
    ids: HashSet<Hash>,
    capacity: usize,
}

impl KnownCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    pub fn add(&mut self, id: Hash) {
        if self.ids.contains(&id) {
            return;
        }
        while self.ids.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.ids.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(id);
        self.ids.insert(id);
    }

    pub fn contains(&self, id: &Hash) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One known-id window per message kind; each kind locks independently
#[derive(Debug)]
pub struct PeerMessageCache {
    start: Mutex<KnownCache>,
    end: Mutex<KnownCache>,
    fraud_proof_reorg: Mutex<KnownCache>,
}

impl PeerMessageCache {
    pub fn new(config: &ConsensusConfig) -> Self {
        Self {
            start: Mutex::new(KnownCache::new(config.max_known_start_msgs)),
            end: Mutex::new(KnownCache::new(config.max_known_end_msgs)),
            fraud_proof_reorg: Mutex::new(KnownCache::new(config.max_known_fraud_proof_msgs)),
        }
    }

    fn set(&self, kind: MessageKind) -> &Mutex<KnownCache> {
        match kind {
            MessageKind::Start => &self.start,
            MessageKind::End => &self.end,
            MessageKind::FraudProofReorg => &self.fraud_proof_reorg,
        }
    }

    pub fn add(&self, kind: MessageKind, id: Hash) {
        self.set(kind).lock().add(id);
    }

    pub fn contains(&self, kind: MessageKind, id: &Hash) -> bool {
        self.set(kind).lock().contains(id)
    }

    pub fn len(&self, kind: MessageKind) -> usize {
        self.set(kind).lock().len()
    }
}
