//! Consensus gossip sub-protocol
//!
//! Every connected peer gets an inbound loop that decodes frames, checks the signer
//! against the scheduler recorded for the message height, and publishes accepted
//! messages on the event bus. One broadcast loop per message kind forwards bus events
//! to the peers that do not know them yet, which also relays accepted inbound messages.
//!
//! Unknown codes, oversized frames and undecodable payloads disconnect the peer. A
//! message signed by the wrong key is only dropped: relays can be stale.

use crate::cache::PeerMessageCache;
use crate::engine::Authority;
use crate::error::{ConsensusError, Result};
use crate::events::EventBus;
use crate::message::{codes, BatchPeriodEndMsg, BatchPeriodStartMsg, FraudProofReorgMsg, GossipMessage};
use crate::peer::{run_writer, Peer, PeerSet, PeerState};
use crate::signer::SigningKey;
use crate::transport::{ws, Msg, PeerConnection};
use crate::types::{ConsensusConfig, ConsensusStats};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    broadcast: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Gossip handler for batch-period and fraud-proof messages
pub struct ConsensusProtocol {
    config: ConsensusConfig,
    node_id: String,
    authority: Arc<dyn Authority>,
    events: EventBus,
    peers: PeerSet,
    /// Ids already published locally
    seen: PeerMessageCache,
    counters: Counters,
    shutdown: watch::Sender<bool>,
}

/// Unregisters the peer and stops its writer however the peer loop exits
struct PeerGuard {
    protocol: Arc<ConsensusProtocol>,
    peer: Arc<Peer>,
    writer: JoinHandle<()>,
}

impl Drop for PeerGuard {
    fn drop(&mut self) {
        self.writer.abort();
        if self.protocol.peers.unregister(self.peer.id()).is_ok() {
            tracing::info!(
                peer = %self.peer.id(),
                "Consensus peer disconnected ({} remaining)",
                self.protocol.peers.len()
            );
        }
    }
}

impl ConsensusProtocol {
    pub fn new(
        config: ConsensusConfig,
        node_id: impl Into<String>,
        authority: Arc<dyn Authority>,
        events: EventBus,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            peers: PeerSet::new(config.max_peers),
            seen: PeerMessageCache::new(&config),
            config,
            node_id: node_id.into(),
            authority,
            events,
            counters: Counters::default(),
            shutdown,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn stats(&self) -> ConsensusStats {
        ConsensusStats {
            connected_peers: self.peers.len(),
            messages_received: self.counters.received.load(Ordering::Relaxed),
            messages_accepted: self.counters.accepted.load(Ordering::Relaxed),
            messages_rejected: self.counters.rejected.load(Ordering::Relaxed),
            messages_broadcast: self.counters.broadcast.load(Ordering::Relaxed),
            messages_dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Serve one peer until its transport fails, it violates the protocol, or the node
    /// shuts down
    pub async fn run_peer(self: Arc<Self>, conn: PeerConnection) -> Result<()> {
        let PeerConnection {
            id,
            trusted,
            mut reader,
            writer,
        } = conn;
        let trusted = trusted
            || self.config.trusted_peers.iter().any(|t| t.eq_ignore_ascii_case(&id));

        let (peer, receivers) = Peer::new(id.clone(), trusted, &self.config);
        if let Err(e) = self.peers.register(peer.clone()) {
            tracing::debug!(peer = %id, "Consensus peer registration failed: {}", e);
            return Err(e);
        }

        let _guard = PeerGuard {
            protocol: self.clone(),
            peer: peer.clone(),
            writer: tokio::spawn(run_writer(id.clone(), writer, receivers)),
        };

        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }

        peer.set_state(PeerState::Active);
        tracing::info!(peer = %id, trusted, "Consensus peer connected ({} total)", self.peers.len());

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                msg = reader.read_msg() => {
                    let msg = msg?;
                    if let Err(e) = self.handle_msg(&peer, msg) {
                        Counters::bump(&self.counters.rejected, 1);
                        if e.is_protocol_violation() {
                            tracing::warn!(peer = %id, "Disconnecting consensus peer: {}", e);
                            return Err(e);
                        }
                        tracing::debug!(peer = %id, "Consensus message ignored: {}", e);
                    }
                }
            }
        }
    }

    /// Dispatch one inbound frame
    pub fn handle_msg(&self, peer: &Peer, msg: Msg) -> Result<()> {
        Counters::bump(&self.counters.received, 1);

        if msg.size() > self.config.max_msg_size {
            return Err(ConsensusError::MessageTooLarge {
                size: msg.size(),
                max: self.config.max_msg_size,
            });
        }

        match msg.code {
            codes::BATCH_PERIOD_START => self.handle_gossip::<BatchPeriodStartMsg>(peer, &msg.payload),
            codes::BATCH_PERIOD_END => self.handle_gossip::<BatchPeriodEndMsg>(peer, &msg.payload),
            codes::FRAUD_PROOF_REORG => self.handle_gossip::<FraudProofReorgMsg>(peer, &msg.payload),
            code => Err(ConsensusError::InvalidMessageCode(code)),
        }
    }

    fn handle_gossip<M: GossipMessage>(&self, peer: &Peer, payload: &[u8]) -> Result<()> {
        let msg = M::from_payload(payload)?;
        let hash = msg.hash();

        tracing::debug!(
            peer = %peer.id(),
            kind = M::KIND.as_str(),
            height = msg.height(),
            "Consensus message received"
        );

        if let Err(e) = self.verify_authority(&msg) {
            Counters::bump(&self.counters.rejected, 1);
            tracing::warn!(
                peer = %peer.id(),
                kind = M::KIND.as_str(),
                height = msg.height(),
                "Dropping unauthorized consensus message: {}",
                e
            );
            return Ok(());
        }

        peer.mark_known(M::KIND, hash);

        if self.seen.contains(M::KIND, &hash) {
            tracing::trace!(peer = %peer.id(), kind = M::KIND.as_str(), "Duplicate consensus message");
            return Ok(());
        }
        self.seen.add(M::KIND, hash);

        Counters::bump(&self.counters.accepted, 1);
        self.events.post(msg);
        Ok(())
    }

    /// The signer must be the scheduler recorded at the message height
    fn verify_authority<M: GossipMessage>(&self, msg: &M) -> Result<()> {
        let expected = self.authority.authority_at(msg.height())?;
        let signer = msg.signer()?;
        if signer != expected {
            return Err(ConsensusError::Signature(format!(
                "signer {} is not scheduler {}",
                signer, expected
            )));
        }
        Ok(())
    }

    /// Queue `msg` to every active peer that does not know it; returns how many
    /// peers it was queued for
    pub fn broadcast<M: GossipMessage>(&self, msg: &M) -> usize {
        let hash = msg.hash();
        self.seen.add(M::KIND, hash);

        let targets = self.peers.peers_without(M::KIND, &hash);
        let mut sent = 0usize;
        for peer in &targets {
            if peer.async_send(msg) {
                sent += 1;
            }
        }

        Counters::bump(&self.counters.broadcast, sent as u64);
        Counters::bump(&self.counters.dropped, (targets.len() - sent) as u64);

        tracing::debug!(
            kind = M::KIND.as_str(),
            height = msg.height(),
            "Broadcast to {}/{} peers",
            sent,
            targets.len()
        );

        sent
    }

    pub fn broadcast_batch_period_start(&self, msg: &BatchPeriodStartMsg) -> usize {
        self.broadcast(msg)
    }

    pub fn broadcast_batch_period_end(&self, msg: &BatchPeriodEndMsg) -> usize {
        self.broadcast(msg)
    }

    pub fn broadcast_fraud_proof_reorg(&self, msg: &FraudProofReorgMsg) -> usize {
        self.broadcast(msg)
    }

    /// Send to one peer, waiting for queue space
    pub async fn send_to<M: GossipMessage>(&self, peer_id: &str, msg: &M) -> Result<()> {
        let peer = self
            .peers
            .peer(peer_id)
            .ok_or_else(|| ConsensusError::NotRegistered(peer_id.to_string()))?;
        peer.send(msg).await
    }

    /// Spawn one broadcast loop per message kind
    pub fn start_broadcast_loops(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_broadcast_loop::<BatchPeriodStartMsg>(),
            self.spawn_broadcast_loop::<BatchPeriodEndMsg>(),
            self.spawn_broadcast_loop::<FraudProofReorgMsg>(),
        ]
    }

    fn spawn_broadcast_loop<M: GossipMessage>(self: &Arc<Self>) -> JoinHandle<()> {
        // subscribe before spawning so nothing posted after this call is missed
        let mut rx = self.events.subscribe::<M>();
        let mut shutdown = self.shutdown.subscribe();
        let protocol = self.clone();

        tokio::spawn(async move {
            tracing::info!("Started {} broadcast loop", M::KIND.as_str());
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = rx.recv() => match event {
                        Ok(event) => {
                            protocol.broadcast(&M::from_event(&event));
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("{} broadcast loop lagged {} events", M::KIND.as_str(), n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            tracing::info!("Stopped {} broadcast loop", M::KIND.as_str());
        })
    }

    /// Run a peer in the background, logging why it ended
    pub fn spawn_peer(self: &Arc<Self>, conn: PeerConnection) -> JoinHandle<()> {
        let protocol = self.clone();
        tokio::spawn(async move {
            let id = conn.id.clone();
            match protocol.run_peer(conn).await {
                Ok(()) => tracing::debug!(peer = %id, "Consensus peer loop finished"),
                Err(e) if e.is_protocol_violation() => {
                    tracing::warn!(peer = %id, "Consensus peer dropped: {}", e)
                }
                Err(e) => tracing::debug!(peer = %id, "Consensus peer loop ended: {}", e),
            }
        })
    }

    /// Accept WebSocket peers on `addr`, authenticating as `key`
    pub async fn start(self: &Arc<Self>, addr: &str, key: SigningKey) -> Result<JoinHandle<()>> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ConsensusError::Transport(e.to_string()))?;
        tracing::info!("Consensus protocol listening on {}", addr);
        Ok(self.serve(listener, key))
    }

    /// Accept WebSocket peers from a bound listener
    pub fn serve(self: &Arc<Self>, listener: TcpListener, key: SigningKey) -> JoinHandle<()> {
        let protocol = self.clone();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            let protocol = protocol.clone();
                            let key = key.clone();
                            tokio::spawn(async move {
                                match ws::accept(stream, &key).await {
                                    Ok(conn) => {
                                        protocol.spawn_peer(conn);
                                    }
                                    Err(e) => tracing::warn!("Handshake with {} failed: {}", remote, e),
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
            }
        })
    }

    /// Connect to a peer listening on `addr`
    pub async fn dial(self: &Arc<Self>, addr: &str, key: &SigningKey) -> Result<JoinHandle<()>> {
        let conn = ws::connect(addr, key).await?;
        tracing::info!(peer = %conn.id, "Dialed consensus peer at {}", addr);
        Ok(self.spawn_peer(conn))
    }

    /// Stop peer loops, broadcast loops and the listener
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        tracing::info!("Consensus protocol shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StaticAuthority;
    use crate::signer::SigningKey;
    use crate::types::Address;

    fn protocol(scheduler: Address) -> ConsensusProtocol {
        ConsensusProtocol::new(
            ConsensusConfig {
                max_msg_size: 1024,
                ..Default::default()
            },
            "local",
            Arc::new(StaticAuthority(scheduler)),
            EventBus::new(16),
        )
    }

    fn signed_start(key: &SigningKey) -> BatchPeriodStartMsg {
        let mut msg = BatchPeriodStartMsg {
            batch_index: 1,
            start_height: 1000,
            max_height: 1100,
            miner_address: Address([1; 20]),
            sequencer_set: vec![Address([1; 20])],
            ..Default::default()
        };
        msg.sign(key).unwrap();
        msg
    }

    #[test]
    fn test_handle_msg_rejects_oversized_frame() {
        let protocol = protocol(Address::ZERO);
        let (peer, _rx) = Peer::new("p", false, &protocol.config);

        let err = protocol
            .handle_msg(&peer, Msg::new(codes::BATCH_PERIOD_START, vec![0; 2048]))
            .unwrap_err();
        assert!(matches!(err, ConsensusError::MessageTooLarge { size: 2048, max: 1024 }));
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_handle_msg_rejects_unknown_code() {
        let protocol = protocol(Address::ZERO);
        let (peer, _rx) = Peer::new("p", false, &protocol.config);

        let err = protocol.handle_msg(&peer, Msg::new(0x09, vec![])).unwrap_err();
        assert!(matches!(err, ConsensusError::InvalidMessageCode(0x09)));
    }

    #[test]
    fn test_handle_msg_rejects_malformed_payload() {
        let protocol = protocol(Address::ZERO);
        let (peer, _rx) = Peer::new("p", false, &protocol.config);

        let err = protocol
            .handle_msg(&peer, Msg::new(codes::BATCH_PERIOD_START, vec![1, 2, 3]))
            .unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[tokio::test]
    async fn test_authorized_start_posts_one_event() {
        let key = SigningKey::random();
        let protocol = protocol(key.address());
        let mut rx = protocol.events().subscribe_start();
        let (peer, _rx) = Peer::new("p", false, &protocol.config);

        let msg = signed_start(&key);
        let frame = Msg::new(codes::BATCH_PERIOD_START, msg.to_payload().unwrap());

        protocol.handle_msg(&peer, frame.clone()).unwrap();
        protocol.handle_msg(&peer, frame).unwrap();

        assert_eq!(rx.recv().await.unwrap().msg, msg);
        assert!(rx.try_recv().is_err());
        assert!(peer.knows(crate::cache::MessageKind::Start, &msg.hash()));
        assert_eq!(protocol.stats().messages_accepted, 1);
    }

    #[test]
    fn test_unauthorized_start_is_dropped_without_error() {
        let scheduler = SigningKey::random();
        let impostor = SigningKey::random();
        let protocol = protocol(scheduler.address());
        let mut rx = protocol.events().subscribe_start();
        let (peer, _rx) = Peer::new("p", false, &protocol.config);

        let msg = signed_start(&impostor);
        let frame = Msg::new(codes::BATCH_PERIOD_START, msg.to_payload().unwrap());

        protocol.handle_msg(&peer, frame).unwrap();
        assert!(rx.try_recv().is_err());
        assert!(!peer.knows(crate::cache::MessageKind::Start, &msg.hash()));
        assert_eq!(protocol.stats().messages_rejected, 1);
    }
}
