//! Framed peer transports
//!
//! The gossip layer only sees `Msg` frames through `MsgReader`/`MsgWriter`. Two
//! transports are provided: an in-memory pipe for tests and in-process clusters, and
//! WebSocket connections over TCP.

use crate::error::{ConsensusError, Result};
use async_trait::async_trait;
use borsh::{BorshDeserialize, BorshSerialize};

/// A frame on the consensus sub-protocol
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Msg {
    pub code: u64,
    pub payload: Vec<u8>,
}

impl Msg {
    pub fn new(code: u64, payload: Vec<u8>) -> Self {
        Self { code, payload }
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

#[async_trait]
pub trait MsgReader: Send {
    /// Next frame; an error means the connection is gone
    async fn read_msg(&mut self) -> Result<Msg>;
}

#[async_trait]
pub trait MsgWriter: Send {
    async fn write_msg(&mut self, msg: Msg) -> Result<()>;
}

/// An authenticated connection handed to the gossip protocol
pub struct PeerConnection {
    /// Identity established by the transport, the peer address for WebSocket peers
    pub id: String,
    /// Trusted peers bypass the peer limit
    pub trusted: bool,
    pub reader: Box<dyn MsgReader>,
    pub writer: Box<dyn MsgWriter>,
}

impl PeerConnection {
    pub fn new(
        id: impl Into<String>,
        trusted: bool,
        reader: Box<dyn MsgReader>,
        writer: Box<dyn MsgWriter>,
    ) -> Self {
        Self {
            id: id.into(),
            trusted,
            reader,
            writer,
        }
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("trusted", &self.trusted)
            .finish()
    }
}

/// In-memory duplex pipe
pub mod memory {
    use super::*;
    use tokio::sync::mpsc;

    pub struct MemoryReader {
        rx: mpsc::Receiver<Msg>,
    }

    pub struct MemoryWriter {
        tx: mpsc::Sender<Msg>,
    }

    /// One side of a pipe
    pub struct MemoryEnd {
        pub reader: MemoryReader,
        pub writer: MemoryWriter,
    }

    impl MemoryEnd {
        pub fn into_connection(self, peer_id: impl Into<String>, trusted: bool) -> PeerConnection {
            PeerConnection::new(peer_id, trusted, Box::new(self.reader), Box::new(self.writer))
        }
    }

    /// Two connected ends; what one writes the other reads
    pub fn pair(capacity: usize) -> (MemoryEnd, MemoryEnd) {
        let (a_tx, b_rx) = mpsc::channel(capacity.max(1));
        let (b_tx, a_rx) = mpsc::channel(capacity.max(1));
        (
            MemoryEnd {
                reader: MemoryReader { rx: a_rx },
                writer: MemoryWriter { tx: a_tx },
            },
            MemoryEnd {
                reader: MemoryReader { rx: b_rx },
                writer: MemoryWriter { tx: b_tx },
            },
        )
    }

    #[async_trait]
    impl MsgReader for MemoryReader {
        async fn read_msg(&mut self) -> Result<Msg> {
            self.rx
                .recv()
                .await
                .ok_or_else(|| ConsensusError::Transport("pipe closed".into()))
        }
    }

    #[async_trait]
    impl MsgWriter for MemoryWriter {
        async fn write_msg(&mut self, msg: Msg) -> Result<()> {
            self.tx
                .send(msg)
                .await
                .map_err(|_| ConsensusError::Transport("pipe closed".into()))
        }
    }
}

/// WebSocket transport; peers prove their key in a nonce exchange before any gossip
pub mod ws {
    use super::*;
    use crate::signer::{recover_signer, SigningKey};
    use crate::types::{keccak256, Hash};
    use rand::rngs::OsRng;
    use rand::RngCore;
    use futures_util::stream::{SplitSink, SplitStream};
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio_tungstenite::{
        accept_async, connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
    };

    /// Frame code of the hello exchange, outside the gossip code space
    pub const HANDSHAKE_CODE: u64 = 0xff;

    const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

    pub struct WsReader<S> {
        stream: SplitStream<WebSocketStream<S>>,
    }

    pub struct WsWriter<S> {
        sink: SplitSink<WebSocketStream<S>, Message>,
    }

    #[async_trait]
    impl<S> MsgReader for WsReader<S>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        async fn read_msg(&mut self) -> Result<Msg> {
            while let Some(frame) = self.stream.next().await {
                match frame {
                    Ok(Message::Binary(data)) => {
                        return borsh::from_slice::<Msg>(&data)
                            .map_err(|e| ConsensusError::Decode(e.to_string()));
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => return Err(ConsensusError::Transport(e.to_string())),
                }
            }
            Err(ConsensusError::Transport("connection closed".into()))
        }
    }

    #[async_trait]
    impl<S> MsgWriter for WsWriter<S>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        async fn write_msg(&mut self, msg: Msg) -> Result<()> {
            let data = borsh::to_vec(&msg).map_err(|e| ConsensusError::Encode(e.to_string()))?;
            self.sink
                .send(Message::Binary(data))
                .await
                .map_err(|e| ConsensusError::Transport(e.to_string()))
        }
    }

    /// Fresh challenge sent by each side
    #[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
    pub struct Hello {
        pub nonce: [u8; 32],
    }

    /// Answer to the remote challenge, signed with the node key
    #[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
    pub struct HelloAuth {
        pub signature: Vec<u8>,
    }

    /// Digest a node signs to prove its key to the holder of `nonce`
    pub fn hello_digest(nonce: &[u8; 32]) -> Hash {
        let mut buf = Vec::with_capacity(HELLO_DOMAIN.len() + nonce.len());
        buf.extend_from_slice(HELLO_DOMAIN);
        buf.extend_from_slice(nonce);
        keccak256(&buf)
    }

    const HELLO_DOMAIN: &[u8] = b"l2-consensus-hello";

    async fn read_handshake<T, R>(reader: &mut R) -> Result<T>
    where
        T: BorshDeserialize,
        R: MsgReader,
    {
        let msg = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.read_msg())
            .await
            .map_err(|_| ConsensusError::Transport("handshake timed out".into()))??;
        if msg.code != HANDSHAKE_CODE {
            return Err(ConsensusError::InvalidMessageCode(msg.code));
        }
        borsh::from_slice(&msg.payload).map_err(|e| ConsensusError::Decode(e.to_string()))
    }

    async fn write_handshake<T, W>(writer: &mut W, value: &T) -> Result<()>
    where
        T: BorshSerialize,
        W: MsgWriter,
    {
        let payload = borsh::to_vec(value).map_err(|e| ConsensusError::Encode(e.to_string()))?;
        writer.write_msg(Msg::new(HANDSHAKE_CODE, payload)).await
    }

    /// Both sides send a nonce, then sign the other's nonce. The peer id is the
    /// address recovered from that signature.
    async fn handshake<S>(ws: WebSocketStream<S>, key: &SigningKey) -> Result<PeerConnection>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let mut reader = WsReader { stream };
        let mut writer = WsWriter { sink };

        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        write_handshake(&mut writer, &Hello { nonce }).await?;
        let remote: Hello = read_handshake(&mut reader).await?;

        let signature = key.sign_hash(&hello_digest(&remote.nonce))?;
        write_handshake(&mut writer, &HelloAuth { signature }).await?;
        let auth: HelloAuth = read_handshake(&mut reader).await?;

        let remote_address = recover_signer(&hello_digest(&nonce), &auth.signature)?;

        Ok(PeerConnection::new(
            remote_address.to_string(),
            false,
            Box::new(reader),
            Box::new(writer),
        ))
    }

    /// Upgrade an inbound stream and authenticate the remote
    pub async fn accept<S>(stream: S, key: &SigningKey) -> Result<PeerConnection>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ws = accept_async(stream)
            .await
            .map_err(|e| ConsensusError::Transport(e.to_string()))?;
        handshake(ws, key).await
    }

    /// Dial `addr` (host:port) and authenticate the remote
    pub async fn connect(addr: &str, key: &SigningKey) -> Result<PeerConnection> {
        let url = format!("ws://{}", addr);
        let (ws, _) = connect_async(&url)
            .await
            .map_err(|e| ConsensusError::Transport(e.to_string()))?;
        handshake::<MaybeTlsStream<tokio::net::TcpStream>>(ws, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::SigningKey;
    use tokio::task::JoinHandle;

    #[tokio::test]
    async fn test_memory_pair_is_duplex() {
        let (mut a, mut b) = memory::pair(4);

        a.writer.write_msg(Msg::new(1, vec![1, 2])).await.unwrap();
        b.writer.write_msg(Msg::new(2, vec![3])).await.unwrap();

        assert_eq!(b.reader.read_msg().await.unwrap(), Msg::new(1, vec![1, 2]));
        assert_eq!(a.reader.read_msg().await.unwrap(), Msg::new(2, vec![3]));
    }

    #[tokio::test]
    async fn test_memory_reader_errors_when_writer_dropped() {
        let (a, mut b) = memory::pair(1);
        drop(a);
        assert!(matches!(
            b.reader.read_msg().await,
            Err(ConsensusError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_ws_handshake_authenticates_addresses() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server_key = SigningKey::random();
        let client_key = SigningKey::random();

        let accept_key = server_key.clone();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            ws::accept(stream, &accept_key).await.unwrap()
        });

        let mut client = ws::connect(&addr, &client_key).await.unwrap();
        let mut server = server.await.unwrap();

        assert_eq!(client.id, server_key.address().to_string());
        assert_eq!(server.id, client_key.address().to_string());

        client.writer.write_msg(Msg::new(0, vec![7; 3])).await.unwrap();
        assert_eq!(server.reader.read_msg().await.unwrap(), Msg::new(0, vec![7; 3]));
    }

    /// Raw client speaking the hello frames by hand
    async fn raw_client(
        addr: &str,
    ) -> tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    > {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
            .await
            .unwrap();
        ws
    }

    async fn send_frame<S>(
        ws: &mut tokio_tungstenite::WebSocketStream<S>,
        code: u64,
        payload: Vec<u8>,
    ) where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        use futures_util::SinkExt;
        let data = borsh::to_vec(&Msg::new(code, payload)).unwrap();
        ws.send(tokio_tungstenite::tungstenite::Message::Binary(data))
            .await
            .unwrap();
    }

    async fn serve_once(key: SigningKey) -> (String, JoinHandle<Result<PeerConnection>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            ws::accept(stream, &key).await
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_ws_plain_id_hello_is_rejected() {
        let (addr, server) = serve_once(SigningKey::random()).await;
        let mut ws = raw_client(&addr).await;

        let plain_id = borsh::to_vec(&"operator".to_string()).unwrap();
        send_frame(&mut ws, ws::HANDSHAKE_CODE, plain_id).await;

        let result = server.await.unwrap();
        assert!(matches!(result, Err(ConsensusError::Decode(_))));
    }

    #[tokio::test]
    async fn test_ws_replayed_signature_is_rejected() {
        let (addr, server) = serve_once(SigningKey::random()).await;
        let mut ws = raw_client(&addr).await;

        // a signature by the trusted key, but over a nonce the server never sent
        let trusted = SigningKey::random();
        let stale = trusted.sign_hash(&ws::hello_digest(&[9u8; 32])).unwrap();

        let hello = borsh::to_vec(&ws::Hello { nonce: [1; 32] }).unwrap();
        send_frame(&mut ws, ws::HANDSHAKE_CODE, hello).await;
        send_frame(
            &mut ws,
            ws::HANDSHAKE_CODE,
            borsh::to_vec(&ws::HelloAuth { signature: stale }).unwrap(),
        )
        .await;

        match server.await.unwrap() {
            Ok(conn) => assert_ne!(conn.id, trusted.address().to_string()),
            Err(e) => assert!(matches!(e, ConsensusError::Signature(_))),
        }
    }
}
