//! Local event bus between the production pipeline and the gossip layer
//!
//! One broadcast channel per message kind. The bus is created by the node and handed
//! to every component that posts or consumes events.

use crate::message::{BatchPeriodEndMsg, BatchPeriodStartMsg, FraudProofReorgMsg, GossipMessage};
use tokio::sync::broadcast;

/// A batch period was opened, locally or by an authorized remote scheduler
#[derive(Debug, Clone)]
pub struct BatchPeriodStartEvent {
    pub msg: BatchPeriodStartMsg,
}

#[derive(Debug, Clone)]
pub struct BatchPeriodEndEvent {
    pub msg: BatchPeriodEndMsg,
}

/// Reorg request for external chain-reorg logic
#[derive(Debug, Clone)]
pub struct FraudProofReorgEvent {
    pub msg: FraudProofReorgMsg,
}

/// Per-kind broadcast channels
#[derive(Clone)]
pub struct EventBus {
    pub(crate) start: broadcast::Sender<BatchPeriodStartEvent>,
    pub(crate) end: broadcast::Sender<BatchPeriodEndEvent>,
    pub(crate) fraud_proof_reorg: broadcast::Sender<FraudProofReorgEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (start, _) = broadcast::channel(capacity);
        let (end, _) = broadcast::channel(capacity);
        let (fraud_proof_reorg, _) = broadcast::channel(capacity);
        Self {
            start,
            end,
            fraud_proof_reorg,
        }
    }

    /// Publish a message; returns the number of subscribers that received it
    pub fn post<M: GossipMessage>(&self, msg: M) -> usize {
        // no subscribers is not an error
        M::channel(self).send(msg.into_event()).unwrap_or(0)
    }

    pub fn subscribe<M: GossipMessage>(&self) -> broadcast::Receiver<M::Event> {
        M::channel(self).subscribe()
    }

    pub fn subscribe_start(&self) -> broadcast::Receiver<BatchPeriodStartEvent> {
        self.start.subscribe()
    }

    pub fn subscribe_end(&self) -> broadcast::Receiver<BatchPeriodEndEvent> {
        self.end.subscribe()
    }

    pub fn subscribe_fraud_proof_reorg(&self) -> broadcast::Receiver<FraudProofReorgEvent> {
        self.fraud_proof_reorg.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
