use crate::torrent::blocklist::Blocklist;
use crate::torrent::peer::{
    HandshakeResult, OutgoingHandshaker, PeerId, PeerIdRegistry, ProtocolExtensionFlags,
};
use crate::torrent::InfoHash;
use derive_more::Display;
use log::{debug, trace};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

/// The maximum number of in-flight outgoing dial plus handshake attempts per torrent.
pub const MAX_DIAL: usize = 40;

/// The outbound connection pump of a single torrent.
///
/// The dialer draws candidate addresses from the torrent's address supply and hands each
/// of them to an [OutgoingHandshaker] worker, keeping at most [MAX_DIAL] attempts in flight.
/// A permit is always acquired before an address is taken from the supply, so an empty
/// supply never accumulates permits and stopping remains prompt while the pool is full.
#[derive(Debug, Display, Clone)]
#[display("{}", inner)]
pub struct PeerDialer {
    inner: Arc<InnerPeerDialer>,
}

impl PeerDialer {
    pub fn new(
        info_hash: InfoHash,
        peer_id: PeerId,
        extensions: ProtocolExtensionFlags,
        registry: PeerIdRegistry,
        blocklist: Arc<Blocklist>,
        connection_timeout: Duration,
        addresses: UnboundedReceiver<SocketAddr>,
        result_tx: UnboundedSender<HandshakeResult>,
    ) -> Self {
        Self {
            inner: Arc::new(InnerPeerDialer {
                info_hash,
                peer_id,
                extensions,
                registry,
                blocklist,
                connection_timeout,
                semaphore: Arc::new(Semaphore::new(MAX_DIAL)),
                addresses: Mutex::new(addresses),
                result_tx,
                cancellation_token: CancellationToken::new(),
                done: CancellationToken::new(),
            }),
        }
    }

    /// Start the dialer loop.
    pub fn start(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run().await;
        });
    }

    /// Stop the dialer and all of its in-flight connection attempts.
    pub async fn stop(&self) {
        self.inner.cancellation_token.cancel();
        self.inner.done.cancelled().await;
    }

    /// Get the number of dial permits currently available.
    pub fn available_permits(&self) -> usize {
        self.inner.semaphore.available_permits()
    }
}

#[derive(Debug, Display)]
#[display("{}", info_hash)]
struct InnerPeerDialer {
    info_hash: InfoHash,
    peer_id: PeerId,
    extensions: ProtocolExtensionFlags,
    registry: PeerIdRegistry,
    blocklist: Arc<Blocklist>,
    connection_timeout: Duration,
    semaphore: Arc<Semaphore>,
    addresses: Mutex<UnboundedReceiver<SocketAddr>>,
    result_tx: UnboundedSender<HandshakeResult>,
    cancellation_token: CancellationToken,
    done: CancellationToken,
}

impl InnerPeerDialer {
    async fn run(&self) {
        debug!("Peer dialer {} started", self);
        let mut addresses = self.addresses.lock().await;

        loop {
            // a permit is acquired before waiting for an address, the stop signal
            // is honored in both waits
            let permit = tokio::select! {
                _ = self.cancellation_token.cancelled() => break,
                permit = self.semaphore.clone().acquire_owned() =>
                    permit.expect("dial semaphore closed"),
            };
            let addr = tokio::select! {
                _ = self.cancellation_token.cancelled() => break,
                addr = addresses.recv() => match addr {
                    Some(addr) => addr,
                    None => break,
                },
            };

            if self.blocklist.is_blocked(&addr.ip()) {
                trace!("Peer dialer {} skipped blocked address {}", self, addr);
                continue;
            }

            let handshaker = OutgoingHandshaker::new(
                addr,
                self.info_hash,
                self.peer_id,
                self.extensions,
                self.registry.clone(),
                self.connection_timeout,
                self.result_tx.clone(),
            );
            let worker_token = self.cancellation_token.child_token();
            tokio::spawn(async move {
                handshaker.run(permit, worker_token).await;
            });
        }

        self.done.cancel();
        debug!("Peer dialer {} has stopped", self);
    }
}
