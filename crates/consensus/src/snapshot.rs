//! Proposer snapshots
//!
//! A snapshot binds a chain height to the sequencer set, rotation index, epoch and
//! scheduler in force from that height. Snapshots are persisted keyed by height under
//! a fixed prefix; each rotation writes a new record.

use crate::error::{ConsensusError, Result};
use crate::sequencer::{Sequencer, SequencerSet};
use crate::store::KeyValueStore;
use crate::types::{Address, ADDRESS_LENGTH, UINT64_LENGTH};
use serde::{Deserialize, Serialize};

/// Key prefix of persisted snapshots
pub const SNAPSHOT_KEY_PREFIX: &[u8] = b"coterie-";

/// Length of the scheduler id
pub const SCHEDULER_ID_LENGTH: usize = ADDRESS_LENGTH;

const HEADER_LENGTH: usize = UINT64_LENGTH * 3 + SCHEDULER_ID_LENGTH;

// address + power + priority
const SEQUENCER_RECORD_LENGTH: usize = ADDRESS_LENGTH + UINT64_LENGTH * 2;

/// Rotation state in force from `number`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposerSnapshot {
    /// Height where the snapshot was taken
    pub number: u64,
    /// Number of rotations so far
    pub index: u64,
    /// Height span of one producer assignment
    pub epoch: u64,
    /// Scheduler identity
    #[serde(rename = "schedulerID", with = "crate::serde_helpers::base64_fixed")]
    pub scheduler_id: [u8; SCHEDULER_ID_LENGTH],
    #[serde(rename = "sequencerSet")]
    pub sequencer_set: SequencerSet,
}

/// Store key for the snapshot at `number`
pub fn snapshot_key(number: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(SNAPSHOT_KEY_PREFIX.len() + UINT64_LENGTH);
    key.extend_from_slice(SNAPSHOT_KEY_PREFIX);
    key.extend_from_slice(&number.to_be_bytes());
    key
}

impl ProposerSnapshot {
    pub fn new(
        number: u64,
        index: u64,
        epoch: u64,
        scheduler_id: [u8; SCHEDULER_ID_LENGTH],
        sequencer_set: SequencerSet,
    ) -> Self {
        Self {
            number,
            index,
            epoch,
            scheduler_id,
            sequencer_set,
        }
    }

    /// Load the snapshot stored at exactly `number`
    pub fn load(store: &dyn KeyValueStore, number: u64) -> Result<Self> {
        let blob = store
            .get(&snapshot_key(number))?
            .ok_or(ConsensusError::NotFound(number))?;
        decode_record(&blob)
    }

    /// Load the newest snapshot taken at or below `number`
    pub fn load_latest(store: &dyn KeyValueStore, number: u64) -> Result<Self> {
        match store.seek_at_or_before(&snapshot_key(number))? {
            Some((key, blob)) if key.starts_with(SNAPSHOT_KEY_PREFIX) => decode_record(&blob),
            _ => Err(ConsensusError::NotFound(number)),
        }
    }

    /// Persist under the height key; rewriting the same snapshot is harmless
    pub fn store(&self, store: &dyn KeyValueStore) -> Result<()> {
        let blob = serde_json::to_vec(self)?;
        store.put(&snapshot_key(self.number), &blob)
    }

    pub fn sequencer_set(&self) -> &SequencerSet {
        &self.sequencer_set
    }

    /// Address of the scheduler allowed to sign batch-period messages
    pub fn scheduler_address(&self) -> Address {
        Address(self.scheduler_id)
    }

    /// Whether `signer` is the current proposer
    pub fn inturn(&self, signer: &Address) -> bool {
        self.sequencer_set
            .get_proposer()
            .map(|p| &p.address == signer)
            .unwrap_or(false)
    }

    /// Count one more rotation
    pub fn increment(&mut self) {
        self.index += 1;
    }

    /// Compact binary form
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            HEADER_LENGTH + self.sequencer_set.len() * SEQUENCER_RECORD_LENGTH,
        );
        buf.extend_from_slice(&self.number.to_be_bytes());
        buf.extend_from_slice(&self.index.to_be_bytes());
        buf.extend_from_slice(&self.epoch.to_be_bytes());
        buf.extend_from_slice(&self.scheduler_id);

        for sequencer in self.sequencer_set.sequencers() {
            buf.extend_from_slice(sequencer.address.as_bytes());
            buf.extend_from_slice(&sequencer.power.to_be_bytes());
            buf.extend_from_slice(&sequencer.producer_priority.to_be_bytes());
        }

        buf
    }

    /// Parse the compact binary form.
    ///
    /// Returns `None` when the input is shorter than the header, when the sequencer
    /// region is not a whole number of records, or when a record is invalid.
    pub fn deserialize(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LENGTH {
            return None;
        }
        let (header, body) = buf.split_at(HEADER_LENGTH);
        if body.len() % SEQUENCER_RECORD_LENGTH != 0 {
            return None;
        }

        let number = read_u64(&header[0..8])?;
        let index = read_u64(&header[8..16])?;
        let epoch = read_u64(&header[16..24])?;
        let scheduler_id: [u8; SCHEDULER_ID_LENGTH] = header[24..HEADER_LENGTH].try_into().ok()?;

        let sequencers = body
            .chunks_exact(SEQUENCER_RECORD_LENGTH)
            .map(|record| {
                let address = Address::from_slice(&record[..ADDRESS_LENGTH])?;
                let power = read_u64(&record[ADDRESS_LENGTH..ADDRESS_LENGTH + 8])? as i64;
                let priority = read_u64(&record[ADDRESS_LENGTH + 8..])? as i64;
                Some(Sequencer::new(address, power).with_priority(priority))
            })
            .collect::<Option<Vec<_>>>()?;

        // derived fields are rebuilt here, never read from the wire
        let sequencer_set = SequencerSet::new(sequencers).ok()?;

        Some(Self::new(number, index, epoch, scheduler_id, sequencer_set))
    }
}

fn read_u64(bytes: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(bytes.try_into().ok()?))
}

fn decode_record(blob: &[u8]) -> Result<ProposerSnapshot> {
    serde_json::from_slice(blob).map_err(|e| ConsensusError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SledStore};
    use tempfile::tempdir;

    fn sample(number: u64) -> ProposerSnapshot {
        let mut set = SequencerSet::new(vec![
            Sequencer::new(Address([1; 20]), 2),
            Sequencer::new(Address([2; 20]), 1),
        ])
        .unwrap();
        set.rotate().unwrap();
        ProposerSnapshot::new(number, 3, 100, [9; 20], set)
    }

    #[test]
    fn test_binary_roundtrip() {
        let snap = sample(1000);
        let bytes = snap.serialize();
        assert_eq!(bytes.len(), HEADER_LENGTH + 2 * SEQUENCER_RECORD_LENGTH);

        let back = ProposerSnapshot::deserialize(&bytes).unwrap();
        assert_eq!(back, snap);
        assert_eq!(back.sequencer_set.total_power(), 3);
        assert_eq!(
            back.sequencer_set.get_proposer().unwrap(),
            snap.sequencer_set.get_proposer().unwrap()
        );
    }

    #[test]
    fn test_deserialize_rejects_truncated_and_misaligned() {
        let bytes = sample(1).serialize();

        assert!(ProposerSnapshot::deserialize(&bytes[..HEADER_LENGTH - 1]).is_none());
        assert!(ProposerSnapshot::deserialize(&bytes[..bytes.len() - 1]).is_none());

        let mut extra = bytes.clone();
        extra.push(0);
        assert!(ProposerSnapshot::deserialize(&extra).is_none());

        assert!(ProposerSnapshot::deserialize(&[]).is_none());
    }

    #[test]
    fn test_deserialize_header_only() {
        let snap = ProposerSnapshot::new(5, 0, 10, [1; 20], SequencerSet::default());
        let back = ProposerSnapshot::deserialize(&snap.serialize()).unwrap();
        assert!(back.sequencer_set.is_empty());
        assert!(back.sequencer_set.get_proposer().is_err());
    }

    #[test]
    fn test_deserialize_rejects_negative_power() {
        let mut bytes = sample(1).serialize();
        // high bit of the first record's power
        bytes[HEADER_LENGTH + ADDRESS_LENGTH] = 0x80;
        assert!(ProposerSnapshot::deserialize(&bytes).is_none());
    }

    #[test]
    fn test_store_and_load() {
        let store = MemoryStore::new();
        let snap = sample(42);
        snap.store(&store).unwrap();
        snap.store(&store).unwrap();
        assert_eq!(store.len(), 1);

        let loaded = ProposerSnapshot::load(&store, 42).unwrap();
        assert_eq!(loaded, snap);
    }

    #[test]
    fn test_load_missing_and_corrupt() {
        let store = MemoryStore::new();
        assert!(matches!(
            ProposerSnapshot::load(&store, 7),
            Err(ConsensusError::NotFound(7))
        ));

        store.put(&snapshot_key(7), b"not json").unwrap();
        assert!(matches!(
            ProposerSnapshot::load(&store, 7),
            Err(ConsensusError::Decode(_))
        ));
    }

    #[test]
    fn test_load_latest() {
        let store = MemoryStore::new();
        sample(100).store(&store).unwrap();
        sample(200).store(&store).unwrap();

        assert_eq!(ProposerSnapshot::load_latest(&store, 150).unwrap().number, 100);
        assert_eq!(ProposerSnapshot::load_latest(&store, 200).unwrap().number, 200);
        assert_eq!(ProposerSnapshot::load_latest(&store, u64::MAX).unwrap().number, 200);
        assert!(ProposerSnapshot::load_latest(&store, 99).is_err());
    }

    #[test]
    fn test_load_latest_ignores_other_prefixes() {
        let store = MemoryStore::new();
        store.put(b"a-other", b"{}").unwrap();
        assert!(matches!(
            ProposerSnapshot::load_latest(&store, 10),
            Err(ConsensusError::NotFound(10))
        ));
    }

    #[test]
    fn test_sled_persistence() {
        let dir = tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();
        let snap = sample(1000);
        snap.store(&store).unwrap();
        store.flush().unwrap();

        let loaded = ProposerSnapshot::load(&store, 1000).unwrap();
        assert_eq!(loaded, snap);
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_value(sample(1)).unwrap();
        for field in ["number", "index", "epoch", "schedulerID", "sequencerSet"] {
            assert!(json.get(field).is_some(), "missing {}", field);
        }
    }

    #[test]
    fn test_increment_and_inturn() {
        let mut snap = sample(10);
        snap.increment();
        assert_eq!(snap.index, 4);
        assert_eq!(snap.number, 10);

        let proposer = snap.sequencer_set.get_proposer().unwrap().address;
        assert!(snap.inturn(&proposer));
        assert!(!snap.inturn(&Address([7; 20])));
        assert_eq!(snap.scheduler_address(), Address([9; 20]));
    }

    #[test]
    fn test_snapshot_key_layout() {
        let key = snapshot_key(0x0102);
        assert_eq!(&key[..8], b"coterie-");
        assert_eq!(&key[8..], &[0, 0, 0, 0, 0, 0, 1, 2]);
    }
}
