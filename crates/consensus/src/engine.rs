//! Rotation engine and the capability traits the rest of the node depends on
//!
//! Callers that need the current producer, or the identity allowed to sign at a
//! height, go through `ProducerSource` and `Authority` rather than a concrete engine.

use crate::error::{ConsensusError, Result};
use crate::sequencer::Sequencer;
use crate::snapshot::ProposerSnapshot;
use crate::store::KeyValueStore;
use crate::types::Address;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One member's new power; zero removes the member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerChange {
    pub address: Address,
    pub power: i64,
}

/// Power changes taking effect at `number`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerUpdate {
    pub number: u64,
    pub changes: Vec<PowerChange>,
}

/// Access to the active producer set
pub trait ProducerSource: Send + Sync {
    fn current_proposer(&self) -> Result<Sequencer>;

    fn apply_producer_update(&self, update: &ProducerUpdate) -> Result<()>;

    /// Members in rotation order
    fn sequencer_addresses(&self) -> Vec<Address>;
}

/// Who may sign batch-period messages at a height
pub trait Authority: Send + Sync {
    fn authority_at(&self, height: u64) -> Result<Address>;
}

/// A single fixed scheduler
#[derive(Debug, Clone, Copy)]
pub struct StaticAuthority(pub Address);

impl Authority for StaticAuthority {
    fn authority_at(&self, _height: u64) -> Result<Address> {
        Ok(self.0)
    }
}

/// Owns the current snapshot and persists one record per rotation
pub struct RotationEngine {
    store: Arc<dyn KeyValueStore>,
    current: RwLock<ProposerSnapshot>,
}

impl RotationEngine {
    /// Resume from the newest stored snapshot, or persist `genesis` if there is none
    pub fn open(store: Arc<dyn KeyValueStore>, genesis: ProposerSnapshot) -> Result<Self> {
        let current = match ProposerSnapshot::load_latest(store.as_ref(), u64::MAX) {
            Ok(snapshot) => {
                tracing::info!(
                    "Resuming rotation at height {} (index {}, {} sequencers)",
                    snapshot.number,
                    snapshot.index,
                    snapshot.sequencer_set.len()
                );
                snapshot
            }
            Err(ConsensusError::NotFound(_)) => {
                genesis.store(store.as_ref())?;
                tracing::info!(
                    "Stored genesis snapshot at height {} with {} sequencers",
                    genesis.number,
                    genesis.sequencer_set.len()
                );
                genesis
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            store,
            current: RwLock::new(current),
        })
    }

    pub fn snapshot(&self) -> ProposerSnapshot {
        self.current.read().clone()
    }

    /// Rotate `times` at height `number` and persist the resulting snapshot
    pub fn rotate(&self, number: u64, times: u64) -> Result<Sequencer> {
        let mut current = self.current.write();
        let mut next = current.clone();

        let proposer = next.sequencer_set.rotate_times(times)?;
        for _ in 0..times {
            next.increment();
        }
        next.number = number;
        next.store(self.store.as_ref())?;

        tracing::debug!(
            "Rotated {} time(s) at height {}, proposer {}",
            times,
            number,
            proposer.address
        );

        *current = next;
        Ok(proposer)
    }

    /// Proposer recorded for `height`
    pub fn proposer_at(&self, height: u64) -> Result<Sequencer> {
        let snapshot = ProposerSnapshot::load_latest(self.store.as_ref(), height)?;
        snapshot.sequencer_set.get_proposer().cloned()
    }
}

impl ProducerSource for RotationEngine {
    fn current_proposer(&self) -> Result<Sequencer> {
        self.current.read().sequencer_set.get_proposer().cloned()
    }

    fn apply_producer_update(&self, update: &ProducerUpdate) -> Result<()> {
        let mut current = self.current.write();
        let mut next = current.clone();

        for change in &update.changes {
            next.sequencer_set.apply_update(change.address, change.power)?;
        }
        next.number = update.number;
        next.store(self.store.as_ref())?;

        tracing::info!(
            "Applied {} producer change(s) at height {}, total power {}",
            update.changes.len(),
            update.number,
            next.sequencer_set.total_power()
        );

        *current = next;
        Ok(())
    }

    fn sequencer_addresses(&self) -> Vec<Address> {
        self.current.read().sequencer_set.addresses()
    }
}

impl Authority for RotationEngine {
    fn authority_at(&self, height: u64) -> Result<Address> {
        Ok(ProposerSnapshot::load_latest(self.store.as_ref(), height)?.scheduler_address())
    }
}
