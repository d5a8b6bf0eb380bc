//! Node Configuration

use anyhow::{Context, Result};
use l2_consensus::{Address, ConsensusConfig, ProposerSnapshot, Sequencer, SequencerSet};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Node configuration, loaded from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Consensus gossip bind address
    pub listen_addr: String,
    /// Hex key proving the node identity to peers; defaults to the signer key, else a
    /// key generated per run
    pub node_key: Option<String>,
    /// Peers dialed at startup (host:port)
    pub peers: Vec<String>,
    /// Directory of the snapshot database
    pub data_dir: PathBuf,
    /// Hex private key; enables batch-period scheduling
    pub signer_key: Option<String>,
    /// Scheduler identity recorded in the genesis snapshot
    pub scheduler_address: Option<Address>,
    /// Signer cluster JSON-RPC endpoint
    pub tss_url: Option<String>,
    /// Timeout for signer cluster requests, in seconds
    pub tss_timeout_secs: u64,
    /// Seconds between batch periods in scheduler mode
    pub batch_interval_secs: u64,
    /// Seconds between stats log lines
    pub stats_interval_secs: u64,
    /// Default log filter when RUST_LOG is unset
    pub log_level: String,
    pub genesis: GenesisConfig,
    pub consensus: ConsensusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisConfig {
    /// Height of the genesis snapshot
    pub number: u64,
    pub sequencers: Vec<GenesisSequencer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisSequencer {
    pub address: Address,
    pub power: i64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9100".to_string(),
            node_key: None,
            peers: Vec::new(),
            data_dir: PathBuf::from("./data"),
            signer_key: None,
            scheduler_address: None,
            tss_url: None,
            tss_timeout_secs: 30,
            batch_interval_secs: 10,
            stats_interval_secs: 60,
            log_level: "info".to_string(),
            genesis: GenesisConfig::default(),
            consensus: ConsensusConfig::default(),
        }
    }
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            number: 0,
            sequencers: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Read a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Snapshot stored when the database is empty
    pub fn genesis_snapshot(&self, scheduler: Address) -> Result<ProposerSnapshot> {
        let sequencers = self
            .genesis
            .sequencers
            .iter()
            .map(|s| Sequencer::new(s.address, s.power))
            .collect();
        let set = SequencerSet::new(sequencers).context("invalid genesis sequencer set")?;

        Ok(ProposerSnapshot::new(
            self.genesis.number,
            0,
            self.consensus.epoch,
            scheduler.0,
            set,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
listen_addr = "0.0.0.0:9200"
peers = ["10.0.0.2:9200"]
scheduler_address = "0x0101010101010101010101010101010101010101"

[genesis]
number = 1000

[[genesis.sequencers]]
address = "0x0101010101010101010101010101010101010101"
power = 2

[[genesis.sequencers]]
address = "0x0202020202020202020202020202020202020202"
power = 1

[consensus]
max_peers = 10
epoch = 50
"#
        )
        .unwrap();

        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9200");
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.consensus.max_peers, 10);
        assert_eq!(config.consensus.max_known_start_msgs, 1024);
        assert_eq!(config.stats_interval_secs, 60);
        assert_eq!(config.log_level, "info");

        let genesis = config
            .genesis_snapshot(config.scheduler_address.unwrap())
            .unwrap();
        assert_eq!(genesis.number, 1000);
        assert_eq!(genesis.epoch, 50);
        assert_eq!(genesis.sequencer_set.total_power(), 3);
    }

    #[test]
    fn test_invalid_genesis_rejected() {
        let mut config = NodeConfig::default();
        config.genesis.sequencers = vec![GenesisSequencer {
            address: Address([1; 20]),
            power: -1,
        }];
        assert!(config.genesis_snapshot(Address::ZERO).is_err());
    }
}
