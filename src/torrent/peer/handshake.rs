use crate::torrent::peer::{Error, PeerId, PeerIdRegistry, ProtocolExtensionFlags, Result};
use crate::torrent::InfoHash;
use byteorder::{ReadBytesExt, WriteBytesExt};
use log::{debug, error, trace};
use std::io;
use std::io::{Cursor, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time;
use tokio_util::sync::CancellationToken;

const PROTOCOL: &str = "BitTorrent protocol";

/// The total length of a BitTorrent handshake frame in bytes.
pub const HANDSHAKE_LEN: usize = 49 + PROTOCOL.len();

/// The fixed BitTorrent handshake frame.
#[derive(Debug, PartialEq)]
pub struct Handshake {
    /// The reserved-bit capabilities advertised by the sending side.
    pub extensions: ProtocolExtensionFlags,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId, extensions: ProtocolExtensionFlags) -> Self {
        Self {
            extensions,
            info_hash,
            peer_id,
        }
    }

    /// Parse a handshake frame received from the given address.
    pub fn from_bytes(addr: &SocketAddr, bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);

        // read the protocol length
        let protocol_len = ReadBytesExt::read_u8(&mut cursor)?;
        if protocol_len != PROTOCOL.len() as u8 {
            return Err(Error::Handshake(
                *addr,
                format!(
                    "expected protocol length {}, but got {}",
                    PROTOCOL.len(),
                    protocol_len
                ),
            ));
        }

        // read the protocol string
        let mut protocol_buf = vec![0; protocol_len as usize];
        Read::read_exact(&mut cursor, &mut protocol_buf)?;
        let protocol = String::from_utf8(protocol_buf)
            .map_err(|e| Error::Handshake(*addr, e.to_string()))?;
        if protocol != PROTOCOL {
            return Err(Error::Handshake(
                *addr,
                format!("expected protocol {}, but got {}", PROTOCOL, protocol),
            ));
        }

        // read the reserved extension bytes
        let mut extensions_buf = [0u8; 8];
        Read::read_exact(&mut cursor, &mut extensions_buf)?;
        let extensions = ProtocolExtensionFlags::from(extensions_buf);

        // read the info hash
        let mut info_hash_bytes = [0u8; 20];
        Read::read_exact(&mut cursor, &mut info_hash_bytes)?;
        let info_hash = InfoHash::try_from_bytes(&info_hash_bytes)
            .map_err(|e| Error::Handshake(*addr, e.to_string()))?;

        // read the peer id
        let mut peer_bytes = [0u8; 20];
        Read::read_exact(&mut cursor, &mut peer_bytes)?;
        let peer_id = PeerId::try_from(peer_bytes.as_ref())?;

        Ok(Self {
            extensions,
            info_hash,
            peer_id,
        })
    }
}

impl TryInto<Vec<u8>> for Handshake {
    type Error = Error;

    fn try_into(self) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(HANDSHAKE_LEN);

        // write the length of the protocol string
        WriteBytesExt::write_u8(&mut buffer, PROTOCOL.len() as u8)?;
        // write the protocol string
        Write::write_all(&mut buffer, PROTOCOL.as_bytes())?;
        // write the advertised capabilities in the reserved field (8 bytes)
        Write::write_all(&mut buffer, &Into::<[u8; 8]>::into(self.extensions))?;
        // write the info hash
        Write::write_all(&mut buffer, self.info_hash.as_bytes())?;
        // write the peer id
        Write::write_all(&mut buffer, &self.peer_id.value())?;

        Ok(buffer)
    }
}

/// An established peer connection, produced by a completed outgoing handshake.
#[derive(Debug)]
pub struct PeerConn {
    /// The address of the remote peer.
    pub addr: SocketAddr,
    /// The raw connection stream, ready for the peer message protocol.
    pub stream: TcpStream,
    /// The peer id of the remote peer.
    pub peer_id: PeerId,
    /// The effective capability set, our advertisement intersected with the peer's.
    pub extensions: ProtocolExtensionFlags,
}

/// The outcome of a single outgoing connection attempt.
#[derive(Debug)]
pub struct HandshakeResult {
    /// The address of the dialed peer.
    pub addr: SocketAddr,
    /// The established connection, or the failure of this attempt.
    pub result: Result<PeerConn>,
}

/// A single outgoing dial plus handshake attempt.
/// The worker owns its own close signal so the dialer can cancel it mid-handshake.
#[derive(Debug)]
pub struct OutgoingHandshaker {
    addr: SocketAddr,
    info_hash: InfoHash,
    peer_id: PeerId,
    extensions: ProtocolExtensionFlags,
    registry: PeerIdRegistry,
    timeout: Duration,
    result_tx: UnboundedSender<HandshakeResult>,
}

impl OutgoingHandshaker {
    pub fn new(
        addr: SocketAddr,
        info_hash: InfoHash,
        peer_id: PeerId,
        extensions: ProtocolExtensionFlags,
        registry: PeerIdRegistry,
        timeout: Duration,
        result_tx: UnboundedSender<HandshakeResult>,
    ) -> Self {
        Self {
            addr,
            info_hash,
            peer_id,
            extensions,
            registry,
            timeout,
            result_tx,
        }
    }

    /// Run the connection attempt until completion or cancellation.
    /// The dial permit is held for the full duration of the attempt.
    pub async fn run(self, permit: OwnedSemaphorePermit, cancellation_token: CancellationToken) {
        let result = self.handshake(&cancellation_token).await;

        match &result {
            Ok(conn) => {
                debug!(
                    "Connected to peer {} (extensions={}, client={})",
                    conn.addr, conn.extensions, conn.peer_id
                );
            }
            Err(Error::Io(io::ErrorKind::UnexpectedEof, _)) => {
                debug!("Peer {} has closed the connection: unexpected EOF", self.addr);
            }
            Err(Error::Io(_, e)) => {
                debug!("Net operation error for peer {}, {}", self.addr, e);
            }
            Err(Error::Closed) => {
                trace!("Connection attempt to peer {} has been cancelled", self.addr);
            }
            Err(e) => {
                error!("Cannot complete outgoing handshake with {}, {}", self.addr, e);
            }
        }

        // drop the result instead of publishing it when the dialer has stopped
        if !cancellation_token.is_cancelled() {
            let _ = self.result_tx.send(HandshakeResult {
                addr: self.addr,
                result,
            });
        }

        drop(permit);
    }

    async fn handshake(&self, cancellation_token: &CancellationToken) -> Result<PeerConn> {
        let mut stream = tokio::select! {
            _ = cancellation_token.cancelled() => return Err(Error::Closed),
            _ = time::sleep(self.timeout) => {
                return Err(Error::Io(
                    io::ErrorKind::TimedOut,
                    format!("connection with {} timed out", self.addr),
                ))
            }
            stream = TcpStream::connect(&self.addr) => stream?,
        };

        let exchange = async {
            let frame: Vec<u8> =
                Handshake::new(self.info_hash, self.peer_id, self.extensions).try_into()?;
            stream.write_all(&frame).await?;

            let mut response = [0u8; HANDSHAKE_LEN];
            stream.read_exact(&mut response).await?;
            Handshake::from_bytes(&self.addr, &response)
        };
        let remote = tokio::select! {
            _ = cancellation_token.cancelled() => return Err(Error::Closed),
            _ = time::sleep(self.timeout) => {
                return Err(Error::Io(
                    io::ErrorKind::TimedOut,
                    format!("handshake with {} timed out", self.addr),
                ))
            }
            remote = exchange => remote?,
        };

        if remote.info_hash != self.info_hash {
            return Err(Error::Handshake(
                self.addr,
                format!(
                    "info hash mismatch, expected {} but got {}",
                    self.info_hash, remote.info_hash
                ),
            ));
        }
        if remote.peer_id == self.peer_id {
            return Err(Error::Handshake(
                self.addr,
                "connected to our own client".to_string(),
            ));
        }
        if !self.registry.register(remote.peer_id) {
            return Err(Error::DuplicatePeerId);
        }

        Ok(PeerConn {
            addr: self.addr,
            stream,
            peer_id: remote.peer_id,
            extensions: self.extensions & remote.extensions,
        })
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Run the inbound side of a handshake for a single incoming connection.
    /// It responds with the given info hash and returns the received handshake frame.
    pub async fn accept_handshake(
        listener: TcpListener,
        info_hash: InfoHash,
        extensions: ProtocolExtensionFlags,
    ) -> Handshake {
        let (mut stream, addr) = listener.accept().await.unwrap();
        let mut frame = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut frame).await.unwrap();
        let received = Handshake::from_bytes(&addr, &frame).unwrap();

        let response: Vec<u8> = Handshake::new(info_hash, PeerId::new(), extensions)
            .try_into()
            .unwrap();
        stream.write_all(&response).await.unwrap();
        stream.flush().await.unwrap();

        received
    }

    #[test]
    fn test_handshake_byte_round_trip() {
        let addr = SocketAddr::from(([127, 0, 0, 1], 6881));
        let info_hash = InfoHash::try_from_bytes(&[0x42; 20]).unwrap();
        let handshake = Handshake::new(info_hash, PeerId::new(), ProtocolExtensionFlags::ours());
        let expected_result = Handshake {
            extensions: handshake.extensions,
            info_hash: handshake.info_hash,
            peer_id: handshake.peer_id,
        };

        let bytes: Vec<u8> = handshake.try_into().unwrap();
        assert_eq!(HANDSHAKE_LEN, bytes.len());

        let result = Handshake::from_bytes(&addr, &bytes).unwrap();
        assert_eq!(expected_result, result);
    }

    #[test]
    fn test_handshake_from_bytes_invalid_protocol() {
        let addr = SocketAddr::from(([127, 0, 0, 1], 6881));
        let mut bytes = vec![19u8];
        bytes.extend_from_slice(b"BitTorrent protocoX");
        bytes.extend_from_slice(&[0u8; 48]);

        let result = Handshake::from_bytes(&addr, &bytes);

        if let Err(Error::Handshake(_, _)) = result {
        } else {
            panic!("expected Error::Handshake, but got {:?} instead", result);
        }
    }

    #[tokio::test]
    async fn test_outgoing_handshaker_success() {
        let info_hash = InfoHash::try_from_bytes(&[0x13; 20]).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(accept_handshake(
            listener,
            info_hash,
            ProtocolExtensionFlags::Fast | ProtocolExtensionFlags::Dht,
        ));
        let (result_tx, mut result_rx) = tokio::sync::mpsc::unbounded_channel();
        let semaphore = std::sync::Arc::new(tokio::sync::Semaphore::new(1));
        let permit = semaphore.clone().acquire_owned().await.unwrap();
        let handshaker = OutgoingHandshaker::new(
            addr,
            info_hash,
            PeerId::new(),
            ProtocolExtensionFlags::ours(),
            PeerIdRegistry::new(),
            Duration::from_secs(2),
            result_tx,
        );

        handshaker.run(permit, CancellationToken::new()).await;

        let result = result_rx.recv().await.expect("expected a handshake result");
        let conn = result.result.expect("expected the handshake to succeed");
        assert_eq!(addr, conn.addr);
        assert_eq!(
            ProtocolExtensionFlags::Fast,
            conn.extensions,
            "expected the capability intersection"
        );
        assert_eq!(
            1,
            semaphore.available_permits(),
            "expected the permit to have been released"
        );

        let received = accept.await.unwrap();
        assert_eq!(info_hash, received.info_hash);
    }

    #[tokio::test]
    async fn test_outgoing_handshaker_info_hash_mismatch() {
        let info_hash = InfoHash::try_from_bytes(&[0x13; 20]).unwrap();
        let other_hash = InfoHash::try_from_bytes(&[0x31; 20]).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(accept_handshake(
            listener,
            other_hash,
            ProtocolExtensionFlags::ours(),
        ));
        let (result_tx, mut result_rx) = tokio::sync::mpsc::unbounded_channel();
        let semaphore = std::sync::Arc::new(tokio::sync::Semaphore::new(1));
        let permit = semaphore.clone().acquire_owned().await.unwrap();
        let handshaker = OutgoingHandshaker::new(
            addr,
            info_hash,
            PeerId::new(),
            ProtocolExtensionFlags::ours(),
            PeerIdRegistry::new(),
            Duration::from_secs(2),
            result_tx,
        );

        handshaker.run(permit, CancellationToken::new()).await;

        let result = result_rx.recv().await.expect("expected a handshake result");
        if let Err(Error::Handshake(result_addr, _)) = result.result {
            assert_eq!(addr, result_addr);
        } else {
            panic!(
                "expected Error::Handshake, but got {:?} instead",
                result.result
            );
        }
    }

    #[tokio::test]
    async fn test_outgoing_handshaker_connection_refused() {
        let info_hash = InfoHash::try_from_bytes(&[0x13; 20]).unwrap();
        // bind a listener and drop it immediately to obtain a refused port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let (result_tx, mut result_rx) = tokio::sync::mpsc::unbounded_channel();
        let semaphore = std::sync::Arc::new(tokio::sync::Semaphore::new(1));
        let permit = semaphore.clone().acquire_owned().await.unwrap();
        let handshaker = OutgoingHandshaker::new(
            addr,
            info_hash,
            PeerId::new(),
            ProtocolExtensionFlags::ours(),
            PeerIdRegistry::new(),
            Duration::from_secs(2),
            result_tx,
        );

        handshaker.run(permit, CancellationToken::new()).await;

        let result = result_rx.recv().await.expect("expected a handshake result");
        if let Err(Error::Io(_, _)) = result.result {
        } else {
            panic!("expected Error::Io, but got {:?} instead", result.result);
        }
    }
}
