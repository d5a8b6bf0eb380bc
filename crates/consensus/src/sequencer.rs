//! Weighted round-robin sequencer rotation
//!
//! Every rotation the outgoing proposer is charged the total power, then each member's
//! priority drops by its own power and the member with the lowest priority takes over.
//! Ties go to the lowest address. Over many rotations each member is selected in
//! proportion to its power.
//!
//! Stored priorities are the state right after a selection, so the proposer is always
//! the minimum of the stored priorities and can be recomputed from `sequencers` alone.

use crate::error::{ConsensusError, Result};
use crate::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Most rotations a single `rotate_times` call performs
pub const MAX_ROTATIONS: u64 = 100_000;

/// A participant eligible to produce blocks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Sequencer {
    pub address: Address,
    /// Voting weight
    pub power: i64,
    /// Rotation counter, lower is more eligible
    pub producer_priority: i64,
}

impl Sequencer {
    pub fn new(address: Address, power: i64) -> Self {
        Self {
            address,
            power,
            producer_priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.producer_priority = priority;
        self
    }
}

/// Ordered, weighted set of sequencers with a cached proposer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SequencerSetRecord", into = "SequencerSetRecord")]
pub struct SequencerSet {
    sequencers: Vec<Sequencer>,
    total_power: i64,
    proposer: Option<Sequencer>,
}

/// Persisted shape: only the members, never the derived fields
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SequencerSetRecord {
    sequencers: Vec<Sequencer>,
}

impl TryFrom<SequencerSetRecord> for SequencerSet {
    type Error = ConsensusError;

    fn try_from(record: SequencerSetRecord) -> Result<Self> {
        Self::new(record.sequencers)
    }
}

impl From<SequencerSet> for SequencerSetRecord {
    fn from(set: SequencerSet) -> Self {
        Self {
            sequencers: set.sequencers,
        }
    }
}

impl SequencerSet {
    /// Build a set, rejecting negative weights and duplicate addresses
    pub fn new(sequencers: Vec<Sequencer>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(sequencers.len());
        for sequencer in &sequencers {
            check_weight(sequencer)?;
            if !seen.insert(sequencer.address) {
                return Err(ConsensusError::DuplicateSequencer(sequencer.address));
            }
        }

        let mut set = Self {
            sequencers,
            total_power: 0,
            proposer: None,
        };
        set.update_total_power();
        set.proposer = set.find_proposer();
        Ok(set)
    }

    pub fn sequencers(&self) -> &[Sequencer] {
        &self.sequencers
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.sequencers.iter().map(|s| s.address).collect()
    }

    pub fn len(&self) -> usize {
        self.sequencers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequencers.is_empty()
    }

    pub fn total_power(&self) -> i64 {
        self.total_power
    }

    pub fn get(&self, address: &Address) -> Option<&Sequencer> {
        self.sequencers.iter().find(|s| &s.address == address)
    }

    /// The elected member
    pub fn get_proposer(&self) -> Result<&Sequencer> {
        self.proposer.as_ref().ok_or(ConsensusError::EmptySet)
    }

    /// Advance one rotation and return the new proposer
    pub fn rotate(&mut self) -> Result<Sequencer> {
        self.rotate_times(1)
    }

    /// Advance `times` rotations, e.g. when several were skipped since the last call.
    ///
    /// At most `MAX_ROTATIONS` per call.
    pub fn rotate_times(&mut self, times: u64) -> Result<Sequencer> {
        if self.sequencers.is_empty() {
            return Err(ConsensusError::EmptySet);
        }
        if times > MAX_ROTATIONS {
            return Err(ConsensusError::TooManyRotations {
                times,
                max: MAX_ROTATIONS,
            });
        }

        for _ in 0..times {
            if let Some(current) = self.proposer.as_ref().map(|p| p.address) {
                let total = self.total_power;
                if let Some(outgoing) = self.sequencers.iter_mut().find(|s| s.address == current)
                {
                    outgoing.producer_priority = outgoing.producer_priority.saturating_add(total);
                }
            }

            for sequencer in self.sequencers.iter_mut() {
                sequencer.producer_priority =
                    sequencer.producer_priority.saturating_sub(sequencer.power);
            }

            self.proposer = self.find_proposer();
        }

        self.get_proposer().cloned()
    }

    /// Recompute the cached total from the members
    pub fn update_total_power(&mut self) {
        self.total_power = self
            .sequencers
            .iter()
            .fold(0i64, |acc, s| acc.saturating_add(s.power));
    }

    /// Add a member or change its power; power 0 removes it.
    ///
    /// New members join at the back of the rotation.
    pub fn apply_update(&mut self, address: Address, power: i64) -> Result<()> {
        if power < 0 {
            return Err(ConsensusError::InvalidWeight { address, power });
        }

        match self.sequencers.iter().position(|s| s.address == address) {
            Some(idx) if power == 0 => {
                self.sequencers.remove(idx);
            }
            Some(idx) => {
                self.sequencers[idx].power = power;
            }
            None if power == 0 => {}
            None => {
                let back = self
                    .sequencers
                    .iter()
                    .map(|s| s.producer_priority)
                    .max()
                    .unwrap_or(0);
                self.sequencers
                    .push(Sequencer::new(address, power).with_priority(back));
            }
        }

        self.update_total_power();
        self.proposer = self.find_proposer();
        Ok(())
    }

    fn find_proposer(&self) -> Option<Sequencer> {
        self.sequencers
            .iter()
            .min_by(|a, b| {
                a.producer_priority
                    .cmp(&b.producer_priority)
                    .then_with(|| a.address.cmp(&b.address))
            })
            .cloned()
    }
}

fn check_weight(sequencer: &Sequencer) -> Result<()> {
    if sequencer.power < 0 {
        return Err(ConsensusError::InvalidWeight {
            address: sequencer.address,
            power: sequencer.power,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn addr(b: u8) -> Address {
        Address([b; 20])
    }

    #[test]
    fn test_weighted_split_on_first_draws() {
        let a = addr(1);
        let b = addr(2);
        let mut set =
            SequencerSet::new(vec![Sequencer::new(a, 2), Sequencer::new(b, 1)]).unwrap();

        let picks: Vec<Address> = (0..3).map(|_| set.rotate().unwrap().address).collect();

        assert_eq!(picks.iter().filter(|p| **p == a).count(), 2);
        assert_eq!(picks.iter().filter(|p| **p == b).count(), 1);
    }

    #[test]
    fn test_frequency_follows_power() {
        let powers = [(addr(1), 1i64), (addr(2), 2), (addr(3), 3), (addr(4), 4)];
        let mut set = SequencerSet::new(
            powers.iter().map(|(a, p)| Sequencer::new(*a, *p)).collect(),
        )
        .unwrap();

        let rounds = 1000u64;
        let mut counts: HashMap<Address, u64> = HashMap::new();
        for _ in 0..rounds {
            *counts.entry(set.rotate().unwrap().address).or_default() += 1;
        }

        for (address, power) in powers {
            let expected = rounds * power as u64 / 10;
            let got = counts.get(&address).copied().unwrap_or(0);
            assert!(
                got.abs_diff(expected) <= 10,
                "{} selected {} times, expected about {}",
                address,
                got,
                expected
            );
        }
    }

    #[test]
    fn test_cached_proposer_matches_recomputation() {
        let mut set = SequencerSet::new(vec![
            Sequencer::new(addr(1), 5),
            Sequencer::new(addr(2), 3),
            Sequencer::new(addr(3), 1),
        ])
        .unwrap();

        for _ in 0..20 {
            let selected = set.rotate().unwrap();
            let rebuilt = SequencerSet::new(set.sequencers().to_vec()).unwrap();
            assert_eq!(rebuilt.get_proposer().unwrap(), &selected);
            assert_eq!(set.get_proposer().unwrap(), &selected);
        }
    }

    #[test]
    fn test_rotate_times_matches_repeated_rotate() {
        let members = vec![Sequencer::new(addr(1), 3), Sequencer::new(addr(2), 2)];
        let mut stepped = SequencerSet::new(members.clone()).unwrap();
        let mut jumped = SequencerSet::new(members).unwrap();

        for _ in 0..7 {
            stepped.rotate().unwrap();
        }
        jumped.rotate_times(7).unwrap();

        assert_eq!(stepped, jumped);
    }

    #[test]
    fn test_rotate_times_limit() {
        let mut set =
            SequencerSet::new(vec![Sequencer::new(addr(1), 3), Sequencer::new(addr(2), 2)]).unwrap();
        let before = set.clone();

        assert!(matches!(
            set.rotate_times(u64::MAX),
            Err(ConsensusError::TooManyRotations { .. })
        ));
        assert_eq!(set, before);

        assert!(set.rotate_times(MAX_ROTATIONS).is_ok());
    }

    #[test]
    fn test_tie_breaks_on_lowest_address() {
        let set = SequencerSet::new(vec![Sequencer::new(addr(9), 1), Sequencer::new(addr(3), 1)])
            .unwrap();
        assert_eq!(set.get_proposer().unwrap().address, addr(3));
    }

    #[test]
    fn test_empty_set_errors() {
        let mut set = SequencerSet::new(vec![]).unwrap();
        assert!(matches!(set.get_proposer(), Err(ConsensusError::EmptySet)));
        assert!(matches!(set.rotate(), Err(ConsensusError::EmptySet)));
    }

    #[test]
    fn test_negative_power_rejected() {
        let result = SequencerSet::new(vec![Sequencer::new(addr(1), -1)]);
        assert!(matches!(result, Err(ConsensusError::InvalidWeight { power: -1, .. })));

        let mut set = SequencerSet::new(vec![Sequencer::new(addr(1), 1)]).unwrap();
        assert!(set.apply_update(addr(2), -5).is_err());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_duplicate_rejected() {
        let result = SequencerSet::new(vec![Sequencer::new(addr(1), 1), Sequencer::new(addr(1), 2)]);
        assert!(matches!(result, Err(ConsensusError::DuplicateSequencer(_))));
    }

    #[test]
    fn test_total_power_tracks_updates() {
        let mut set = SequencerSet::new(vec![Sequencer::new(addr(1), 4)]).unwrap();
        assert_eq!(set.total_power(), 4);

        set.apply_update(addr(2), 6).unwrap();
        assert_eq!(set.total_power(), 10);

        set.apply_update(addr(1), 1).unwrap();
        assert_eq!(set.total_power(), 7);

        set.apply_update(addr(2), 0).unwrap();
        assert_eq!(set.total_power(), 1);
        assert!(set.get(&addr(2)).is_none());
    }

    #[test]
    fn test_new_member_joins_at_back() {
        let mut set =
            SequencerSet::new(vec![Sequencer::new(addr(1), 1), Sequencer::new(addr(2), 1)])
                .unwrap();
        set.rotate().unwrap();
        set.apply_update(addr(3), 1).unwrap();

        let newest = set.get(&addr(3)).unwrap().producer_priority;
        assert!(set
            .sequencers()
            .iter()
            .all(|s| s.producer_priority <= newest));
    }

    #[test]
    fn test_json_omits_derived_fields() {
        let set = SequencerSet::new(vec![Sequencer::new(addr(1), 2)]).unwrap();
        let json = serde_json::to_value(&set).unwrap();

        assert!(json.get("Sequencers").is_some());
        assert!(json.get("Proposer").is_none());

        let back: SequencerSet = serde_json::from_value(json).unwrap();
        assert_eq!(back, set);
        assert_eq!(back.total_power(), 2);
    }
}
