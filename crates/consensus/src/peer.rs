//! Consensus peers and the active peer registry
//!
//! Each peer owns three bounded outbound queues, one per message kind, drained onto
//! its transport by a writer task. Enqueueing never blocks: a full queue drops the
//! message for that peer.

use crate::cache::{MessageKind, PeerMessageCache};
use crate::error::{ConsensusError, Result};
use crate::message::GossipMessage;
use crate::transport::{Msg, MsgWriter};
use crate::types::{ConsensusConfig, Hash};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Lifecycle of a peer on the consensus sub-protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Registered,
    Active,
    /// Terminal
    Disconnected,
}

struct PeerQueues {
    start: mpsc::Sender<Msg>,
    end: mpsc::Sender<Msg>,
    fraud_proof_reorg: mpsc::Sender<Msg>,
}

/// Receiving halves of a peer's outbound queues, drained by `run_writer`
pub struct PeerReceivers {
    start: mpsc::Receiver<Msg>,
    end: mpsc::Receiver<Msg>,
    fraud_proof_reorg: mpsc::Receiver<Msg>,
}

/// A connected consensus peer
pub struct Peer {
    id: String,
    trusted: bool,
    state: Mutex<PeerState>,
    known: PeerMessageCache,
    queues: PeerQueues,
}

impl Peer {
    pub fn new(id: impl Into<String>, trusted: bool, config: &ConsensusConfig) -> (Arc<Self>, PeerReceivers) {
        let depth = config.max_queued_msgs.max(1);
        let (start_tx, start_rx) = mpsc::channel(depth);
        let (end_tx, end_rx) = mpsc::channel(depth);
        let (reorg_tx, reorg_rx) = mpsc::channel(depth);

        let peer = Arc::new(Self {
            id: id.into(),
            trusted,
            state: Mutex::new(PeerState::Connecting),
            known: PeerMessageCache::new(config),
            queues: PeerQueues {
                start: start_tx,
                end: end_tx,
                fraud_proof_reorg: reorg_tx,
            },
        });

        let receivers = PeerReceivers {
            start: start_rx,
            end: end_rx,
            fraud_proof_reorg: reorg_rx,
        };

        (peer, receivers)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: PeerState) {
        let mut current = self.state.lock();
        if *current != PeerState::Disconnected {
            *current = state;
        }
    }

    pub fn mark_known(&self, kind: MessageKind, id: Hash) {
        self.known.add(kind, id);
    }

    pub fn knows(&self, kind: MessageKind, id: &Hash) -> bool {
        self.known.contains(kind, id)
    }

    pub fn known_count(&self, kind: MessageKind) -> usize {
        self.known.len(kind)
    }

    fn queue(&self, kind: MessageKind) -> &mpsc::Sender<Msg> {
        match kind {
            MessageKind::Start => &self.queues.start,
            MessageKind::End => &self.queues.end,
            MessageKind::FraudProofReorg => &self.queues.fraud_proof_reorg,
        }
    }

    /// Queue `msg` without waiting. Returns false if it was dropped.
    pub fn async_send<M: GossipMessage>(&self, msg: &M) -> bool {
        let payload = match msg.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(peer = %self.id, kind = M::KIND.as_str(), "Not sending malformed message: {}", e);
                return false;
            }
        };

        match self.queue(M::KIND).try_send(Msg::new(M::CODE, payload)) {
            Ok(()) => {
                self.known.add(M::KIND, msg.hash());
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::debug!(peer = %self.id, kind = M::KIND.as_str(), "Dropping message, peer queue full");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(peer = %self.id, kind = M::KIND.as_str(), "Dropping message, peer closed");
                false
            }
        }
    }

    /// Mark the id known, then wait for queue space
    pub async fn send<M: GossipMessage>(&self, msg: &M) -> Result<()> {
        let payload = msg.to_payload()?;
        self.known.add(M::KIND, msg.hash());
        self.queue(M::KIND)
            .send(Msg::new(M::CODE, payload))
            .await
            .map_err(|_| ConsensusError::NotRegistered(self.id.clone()))
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("trusted", &self.trusted)
            .field("state", &self.state())
            .finish()
    }
}

/// Drain a peer's outbound queues onto its transport until the queues close or a
/// write fails
pub async fn run_writer(peer_id: String, mut writer: Box<dyn MsgWriter>, mut rx: PeerReceivers) {
    loop {
        let next = tokio::select! {
            msg = rx.start.recv() => msg,
            msg = rx.end.recv() => msg,
            msg = rx.fraud_proof_reorg.recv() => msg,
        };

        let Some(msg) = next else {
            break;
        };

        if let Err(e) = writer.write_msg(msg).await {
            tracing::debug!(peer = %peer_id, "Peer write failed: {}", e);
            break;
        }
    }

    tracing::trace!(peer = %peer_id, "Peer writer stopped");
}

/// Registry of active consensus peers
pub struct PeerSet {
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    max_peers: usize,
}

impl PeerSet {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            max_peers,
        }
    }

    /// Add a peer. Untrusted peers are refused once the set is full.
    pub fn register(&self, peer: Arc<Peer>) -> Result<()> {
        let mut peers = self.peers.write();
        if peers.contains_key(peer.id()) {
            return Err(ConsensusError::AlreadyRegistered(peer.id().to_string()));
        }
        if peers.len() >= self.max_peers && !peer.is_trusted() {
            return Err(ConsensusError::TooManyPeers);
        }

        peer.set_state(PeerState::Registered);
        peers.insert(peer.id().to_string(), peer);
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> Result<Arc<Peer>> {
        let peer = self
            .peers
            .write()
            .remove(id)
            .ok_or_else(|| ConsensusError::NotRegistered(id.to_string()))?;
        peer.set_state(PeerState::Disconnected);
        Ok(peer)
    }

    pub fn peer(&self, id: &str) -> Option<Arc<Peer>> {
        self.peers.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.peers.read().keys().cloned().collect()
    }

    /// Active peers that have not marked `id` known for `kind`
    pub fn peers_without(&self, kind: MessageKind, id: &Hash) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .values()
            .filter(|p| p.state() == PeerState::Active && !p.knows(kind, id))
            .cloned()
            .collect()
    }
}
