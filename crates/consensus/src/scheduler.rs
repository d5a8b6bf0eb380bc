//! Batch-period scheduler - signs period boundaries and hands them to gossip
//!
//! The scheduler opens a period for the current proposer, closes it once the producer
//! is done, and raises fraud-proof reorgs. Every message is signed with the scheduler
//! key and posted on the event bus, where the broadcast loops pick it up.

use crate::engine::ProducerSource;
use crate::error::{ConsensusError, Result};
use crate::events::EventBus;
use crate::message::{BatchPeriodEndMsg, BatchPeriodStartMsg, FraudProofReorgMsg};
use crate::signer::SigningKey;
use crate::types::Address;
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Default)]
struct SchedulerState {
    reorg_index: u64,
    batch_index: u64,
    current: Option<BatchPeriodStartMsg>,
}

/// Signs and publishes batch-period messages
pub struct BatchScheduler {
    key: SigningKey,
    producers: Arc<dyn ProducerSource>,
    events: EventBus,
    /// Heights per period
    period_span: u64,
    /// Seconds a period stays valid
    period_timeout: u64,
    state: RwLock<SchedulerState>,
}

impl BatchScheduler {
    pub fn address(&self) -> Address {
        self.key.address()
    }

    pub fn batch_index(&self) -> u64 {
        self.state.read().batch_index
    }

    pub fn reorg_index(&self) -> u64 {
        self.state.read().reorg_index
    }

    /// The open period, if any
    pub fn current_period(&self) -> Option<BatchPeriodStartMsg> {
        self.state.read().current.clone()
    }

    /// Open a period at `start_height` for the current proposer
    pub fn begin_batch_period(&self, start_height: u64) -> Result<BatchPeriodStartMsg> {
        let proposer = self.producers.current_proposer()?;
        let mut state = self.state.write();

        let mut msg = BatchPeriodStartMsg {
            reorg_index: state.reorg_index,
            batch_index: state.batch_index,
            start_height,
            max_height: start_height.saturating_add(self.period_span),
            expire_time: unix_now().saturating_add(self.period_timeout),
            miner_address: proposer.address,
            sequencer_set: self.producers.sequencer_addresses(),
            signature: Vec::new(),
        };
        msg.sign(&self.key)?;

        let receivers = self.events.post(msg.clone());
        tracing::info!(
            batch_index = msg.batch_index,
            miner = %msg.miner_address,
            "Batch period started at height {} (max {}), {} subscriber(s)",
            msg.start_height,
            msg.max_height,
            receivers
        );

        state.current = Some(msg.clone());
        Ok(msg)
    }

    /// Close the open period at `end_height`
    pub fn end_batch_period(
        &self,
        end_height: u64,
        signatures: Vec<Vec<u8>>,
    ) -> Result<BatchPeriodEndMsg> {
        let mut state = self.state.write();
        let start = state.current.take().ok_or(ConsensusError::NoOpenPeriod)?;

        let mut msg = BatchPeriodEndMsg {
            reorg_index: start.reorg_index,
            batch_index: start.batch_index,
            start_height: start.start_height,
            end_height,
            miner_address: start.miner_address,
            signatures,
            signature: Vec::new(),
        };
        if let Err(e) = msg.sign(&self.key) {
            state.current = Some(start);
            return Err(e);
        }

        self.events.post(msg.clone());
        state.batch_index += 1;

        tracing::info!(
            batch_index = msg.batch_index,
            "Batch period ended: heights {}..{}",
            msg.start_height,
            msg.end_height
        );

        Ok(msg)
    }

    /// Order a rollback to `reorg_to_height`; any open period is abandoned
    pub fn raise_fraud_reorg(&self, reorg_to_height: u64) -> Result<FraudProofReorgMsg> {
        let mut state = self.state.write();

        let mut msg = FraudProofReorgMsg {
            reorg_index: state.reorg_index + 1,
            reorg_to_height,
            signature: Vec::new(),
        };
        msg.sign(&self.key)?;

        state.reorg_index = msg.reorg_index;
        state.current = None;
        self.events.post(msg.clone());

        tracing::warn!(
            reorg_index = msg.reorg_index,
            "Fraud proof reorg raised, rolling back to height {}",
            reorg_to_height
        );

        Ok(msg)
    }

    /// Whether the open period has passed its expire time
    pub fn is_current_expired(&self) -> bool {
        self.state
            .read()
            .current
            .as_ref()
            .map(|msg| msg.is_expired(unix_now()))
            .unwrap_or(false)
    }
}

fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Builder for BatchScheduler
pub struct BatchSchedulerBuilder {
    period_span: u64,
    period_timeout: u64,
    reorg_index: u64,
    batch_index: u64,
}

impl BatchSchedulerBuilder {
    pub fn new() -> Self {
        Self {
            period_span: 100,
            period_timeout: 60,
            reorg_index: 0,
            batch_index: 0,
        }
    }

    pub fn period_span(mut self, span: u64) -> Self {
        self.period_span = span;
        self
    }

    pub fn period_timeout(mut self, seconds: u64) -> Self {
        self.period_timeout = seconds;
        self
    }

    /// Resume from a known position
    pub fn indices(mut self, reorg_index: u64, batch_index: u64) -> Self {
        self.reorg_index = reorg_index;
        self.batch_index = batch_index;
        self
    }

    pub fn build(
        self,
        key: SigningKey,
        producers: Arc<dyn ProducerSource>,
        events: EventBus,
    ) -> BatchScheduler {
        BatchScheduler {
            key,
            producers,
            events,
            period_span: self.period_span,
            period_timeout: self.period_timeout,
            state: RwLock::new(SchedulerState {
                reorg_index: self.reorg_index,
                batch_index: self.batch_index,
                current: None,
            }),
        }
    }
}

impl Default for BatchSchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
