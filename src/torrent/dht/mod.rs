use crate::torrent::InfoHash;
use async_trait::async_trait;
use log::{debug, trace};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

#[cfg(test)]
pub use mock::*;

/// The result type of DHT operations.
pub type DhtResult<T> = std::result::Result<T, DhtError>;

/// The peer discovery results delivered by the DHT node.
/// Each entry is a raw compact peer value, non 6 byte entries are discarded by the consumer.
pub type PeersRequestResults = HashMap<InfoHash, Vec<Vec<u8>>>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DhtError {
    /// The DHT node failed to start.
    #[error("failed to start dht node, {0}")]
    Start(String),
}

/// The DHT node consumed by the session.
/// The node implementation itself lives outside of this crate, the session only drives
/// peer requests and consumes the peers request results channel.
#[async_trait]
pub trait DhtNode: Debug + Send + Sync {
    /// Start the DHT node.
    async fn start(&self) -> DhtResult<()>;

    /// Stop the DHT node.
    async fn stop(&self);

    /// Request peers for the given info hash, optionally announcing our own presence.
    async fn peers_request(&self, info_hash: &InfoHash, announce: bool);

    /// Receive the next batch of peer discovery results.
    ///
    /// # Returns
    ///
    /// It returns [None] when the node no longer produces results.
    async fn recv(&self) -> Option<PeersRequestResults>;
}

/// Parse the given compact peer entries into socket addresses.
/// Each valid entry is exactly 6 bytes, 4 ipv4 octets followed by a big-endian port.
/// Entries of any other length are discarded.
pub fn parse_compact_peers(entries: &[Vec<u8>]) -> Vec<SocketAddr> {
    entries
        .iter()
        .filter_map(|entry| {
            if entry.len() != 6 {
                // only ipv4 is supported for now
                return None;
            }

            let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
            let port = u16::from_be_bytes([entry[4], entry[5]]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        })
        .collect()
}

/// The set of info hashes awaiting a DHT peers request.
/// The session pops one arbitrary entry per limiter tick to throttle outgoing requests.
#[derive(Debug, Clone, Default)]
pub struct PendingPeerRequests {
    inner: Arc<Mutex<HashSet<InfoHash>>>,
}

impl PendingPeerRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a peers request for the given info hash.
    pub async fn push(&self, info_hash: InfoHash) {
        self.inner.lock().await.insert(info_hash);
    }

    /// Take an arbitrary queued info hash.
    pub async fn pop(&self) -> Option<InfoHash> {
        let mut pending = self.inner.lock().await;
        let info_hash = pending.iter().next().copied()?;
        pending.remove(&info_hash);
        Some(info_hash)
    }

    /// Get the number of queued peer requests.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// The DHT announce bridge of a single non-private torrent.
/// Announcing queues the torrent's info hash onto the session's pending request set,
/// discovered peer addresses flow back through the announcer's bounded channel.
#[derive(Debug)]
pub struct DhtAnnouncer {
    info_hash: InfoHash,
    port: u16,
    pending: PendingPeerRequests,
    peers_tx: mpsc::Sender<Vec<SocketAddr>>,
    peers_rx: Mutex<mpsc::Receiver<Vec<SocketAddr>>>,
}

impl PartialEq for DhtAnnouncer {
    fn eq(&self, other: &Self) -> bool {
        self.info_hash == other.info_hash && self.port == other.port
    }
}

impl DhtAnnouncer {
    pub fn new(info_hash: InfoHash, port: u16, pending: PendingPeerRequests) -> Self {
        let (peers_tx, peers_rx) = mpsc::channel(1);
        Self {
            info_hash,
            port,
            pending,
            peers_tx,
            peers_rx: Mutex::new(peers_rx),
        }
    }

    /// Get the info hash announced by this announcer.
    pub fn info_hash(&self) -> &InfoHash {
        &self.info_hash
    }

    /// Queue an announce for the torrent.
    pub async fn announce(&self) {
        trace!(
            "Queueing DHT peers request for {} on port {}",
            self.info_hash,
            self.port
        );
        self.pending.push(self.info_hash).await;
    }

    /// Get the sender of the peer address channel.
    pub fn sender(&self) -> mpsc::Sender<Vec<SocketAddr>> {
        self.peers_tx.clone()
    }

    /// Receive the next batch of discovered peer addresses.
    pub async fn recv(&self) -> Option<Vec<SocketAddr>> {
        let addrs = self.peers_rx.lock().await.recv().await;
        if let Some(addrs) = addrs.as_ref() {
            debug!(
                "Received {} DHT peer addresses for {}",
                addrs.len(),
                self.info_hash
            );
        }
        addrs
    }
}


#[cfg(test)]
pub mod tests {
    use super::*;

    /// A controllable in-memory DHT node for session tests.
    /// Results sent through [StubDht::results_sender] are delivered to the session router,
    /// peer requests issued by the session are recorded for later inspection.
    #[derive(Debug)]
    pub struct StubDht {
        results_tx: mpsc::UnboundedSender<PeersRequestResults>,
        results_rx: Mutex<mpsc::UnboundedReceiver<PeersRequestResults>>,
        requests: std::sync::Mutex<Vec<(InfoHash, bool)>>,
    }

    impl StubDht {
        pub fn new() -> Self {
            let (results_tx, results_rx) = mpsc::unbounded_channel();
            Self {
                results_tx,
                results_rx: Mutex::new(results_rx),
                requests: std::sync::Mutex::new(Vec::new()),
            }
        }

        /// Get the sender used to inject peer discovery results.
        pub fn results_sender(&self) -> mpsc::UnboundedSender<PeersRequestResults> {
            self.results_tx.clone()
        }

        /// Get the peer requests issued against this node.
        pub fn requests(&self) -> Vec<(InfoHash, bool)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DhtNode for StubDht {
        async fn start(&self) -> DhtResult<()> {
            Ok(())
        }

        async fn stop(&self) {}

        async fn peers_request(&self, info_hash: &InfoHash, announce: bool) {
            self.requests.lock().unwrap().push((*info_hash, announce));
        }

        async fn recv(&self) -> Option<PeersRequestResults> {
            self.results_rx.lock().await.recv().await
        }
    }

    #[test]
    fn test_parse_compact_peers() {
        let entries = vec![
            vec![0x7F, 0x00, 0x00, 0x01, 0x1A, 0xE1],
            // a 5 byte entry is discarded
            vec![0x7F, 0x00, 0x00, 0x01, 0x1A],
            // a 7 byte entry is discarded
            vec![0x7F, 0x00, 0x00, 0x01, 0x1A, 0xE1, 0x00],
        ];

        let result = parse_compact_peers(&entries);

        assert_eq!(vec![SocketAddr::from(([127, 0, 0, 1], 6881))], result);
    }

    #[tokio::test]
    async fn test_pending_peer_requests() {
        let info_hash = InfoHash::try_from_bytes(&[0x11; 20]).unwrap();
        let pending = PendingPeerRequests::new();

        assert_eq!(None, pending.pop().await);

        pending.push(info_hash).await;
        pending.push(info_hash).await;
        assert_eq!(1, pending.len().await, "expected the set to deduplicate");

        assert_eq!(Some(info_hash), pending.pop().await);
        assert_eq!(None, pending.pop().await);
    }

    #[tokio::test]
    async fn test_dht_announcer_announce() {
        let info_hash = InfoHash::try_from_bytes(&[0x22; 20]).unwrap();
        let pending = PendingPeerRequests::new();
        let announcer = DhtAnnouncer::new(info_hash, 6881, pending.clone());

        announcer.announce().await;

        assert_eq!(Some(info_hash), pending.pop().await);
    }

    #[tokio::test]
    async fn test_dht_announcer_peers_channel() {
        let info_hash = InfoHash::try_from_bytes(&[0x33; 20]).unwrap();
        let announcer = DhtAnnouncer::new(info_hash, 6881, PendingPeerRequests::new());
        let addrs = vec![SocketAddr::from(([127, 0, 0, 1], 6881))];

        announcer.sender().send(addrs.clone()).await.unwrap();

        assert_eq!(Some(addrs), announcer.recv().await);
    }
}
