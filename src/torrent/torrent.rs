use crate::torrent::dht::DhtAnnouncer;
use crate::torrent::peer::{
    HandshakeResult, PeerConn, PeerDialer, PeerId, PeerIdRegistry, ProtocolExtensionFlags,
};
use crate::torrent::tracker::Tracker;
use crate::torrent::webseed::{PieceResult, UrlDownloader};
use crate::torrent::{
    build_pieces, BufferPool, FileStorage, InfoHash, Piece, PieceIndex, Result, Resumer,
    SessionConfig, TorrentFile, TorrentInfo,
};
use crate::torrent::blocklist::Blocklist;
use bit_vec::BitVec;
use derive_more::Display;
use fx_callback::{Callback, MultiThreadedCallback, Subscriber, Subscription};
use log::{debug, trace, warn};
use reqwest::redirect::Policy;
use reqwest::Client;
use std::fmt::{Debug, Formatter};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, RwLock};
use tokio::time;
use tokio_util::sync::CancellationToken;

const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// The events of a torrent.
#[derive(Debug, Display, Clone, PartialEq)]
pub enum TorrentEvent {
    /// Indicates that the torrent has been started.
    #[display("torrent has been started")]
    Started,
    /// Indicates that the torrent has been stopped.
    #[display("torrent has been stopped")]
    Stopped,
    /// Indicates that a peer connection has been established.
    #[display("peer {} has been connected", _0)]
    PeerConnected(SocketAddr),
    /// Indicates that a piece has been completed.
    #[display("piece {} has been completed", _0)]
    PieceCompleted(PieceIndex),
}

/// A snapshot of the byte counters of a torrent.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TorrentStats {
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub bytes_wasted: u64,
}

#[derive(Debug, Default)]
struct AtomicStats {
    bytes_downloaded: AtomicU64,
    bytes_uploaded: AtomicU64,
    bytes_wasted: AtomicU64,
}

impl AtomicStats {
    fn snapshot(&self) -> TorrentStats {
        TorrentStats {
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            bytes_wasted: self.bytes_wasted.load(Ordering::Relaxed),
        }
    }
}

/// The parameters for creating a new torrent within the session.
pub(crate) struct TorrentParams {
    pub id: u64,
    pub port: u16,
    pub info_hash: InfoHash,
    pub name: String,
    pub info: Option<TorrentInfo>,
    pub trackers: Vec<Tracker>,
    pub url_list: Vec<String>,
    pub storage: FileStorage,
    pub resumer: Resumer,
    pub announcer: Option<DhtAnnouncer>,
    pub bitfield: Option<BitVec>,
    pub stats: TorrentStats,
    pub blocklist: Arc<Blocklist>,
    pub config: Arc<SessionConfig>,
}

/// A single torrent managed by the session.
///
/// The torrent owns its peer dialer, DHT announce bridge and web seed downloaders.
/// All of them feed the torrent's dispatcher, which stores completed pieces and
/// keeps track of the established peer connections.
#[derive(Display, Clone)]
#[display("#{} {}", inner.id, inner.name)]
pub struct Torrent {
    inner: Arc<TorrentContext>,
}

impl PartialEq for Torrent {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Torrent {
    pub(crate) fn new(params: TorrentParams) -> Result<Self> {
        let client = Client::builder()
            .redirect(Policy::limited(3))
            .build()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let pieces = params
            .info
            .as_ref()
            .map(|info| build_pieces(info.total_length(), info.piece_length))
            .unwrap_or_default();
        let files = params.info.as_ref().map(|info| info.files()).unwrap_or_default();
        let multi_file = params
            .info
            .as_ref()
            .map(|info| info.is_multi_file())
            .unwrap_or(false);
        let bitfield = params.bitfield.unwrap_or_else(|| {
            BitVec::from_elem(pieces.len(), false)
        });
        let (handshake_tx, handshake_rx) = unbounded_channel();
        let (piece_tx, piece_rx) = unbounded_channel();

        let inner = Arc::new(TorrentContext {
            id: params.id,
            port: params.port,
            info_hash: params.info_hash,
            peer_id: PeerId::new(),
            name: params.name,
            info: params.info,
            pieces: Arc::new(RwLock::new(pieces)),
            files: Arc::new(files),
            multi_file,
            trackers: params.trackers,
            url_list: params.url_list,
            storage: params.storage,
            resumer: params.resumer,
            announcer: params.announcer,
            bitfield: Mutex::new(bitfield),
            stats: AtomicStats {
                bytes_downloaded: AtomicU64::new(params.stats.bytes_downloaded),
                bytes_uploaded: AtomicU64::new(params.stats.bytes_uploaded),
                bytes_wasted: AtomicU64::new(params.stats.bytes_wasted),
            },
            blocklist: params.blocklist,
            config: params.config,
            client,
            registry: PeerIdRegistry::new(),
            peers: Mutex::new(Vec::new()),
            buffer_pool: BufferPool::new(),
            handshake_tx,
            piece_tx,
            supply_tx: Mutex::new(None),
            dialer: Mutex::new(None),
            webseeds: Mutex::new(Vec::new()),
            started: Mutex::new(false),
            removed: CancellationToken::new(),
            cancellation_token: CancellationToken::new(),
            done: CancellationToken::new(),
            callbacks: MultiThreadedCallback::new(),
        });

        let dispatcher = inner.clone();
        tokio::spawn(async move {
            dispatcher.dispatch(handshake_rx, piece_rx).await;
        });
        if inner.announcer.is_some() {
            let forwarder = inner.clone();
            tokio::spawn(async move {
                forwarder.forward_announcer_peers().await;
            });
        }

        trace!("Created torrent #{} {}", inner.id, inner.name);
        Ok(Self { inner })
    }

    /// Get the session wide id of the torrent.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Get the listen port assigned to the torrent.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Get the info hash of the torrent.
    pub fn info_hash(&self) -> &InfoHash {
        &self.inner.info_hash
    }

    /// Get the display name of the torrent.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Check if the torrent is marked as private, see BEP27.
    /// A torrent without metadata is never considered private.
    pub fn is_private(&self) -> bool {
        self.inner
            .info
            .as_ref()
            .map(|e| e.is_private())
            .unwrap_or(false)
    }

    /// Get a snapshot of the byte counters of the torrent.
    pub fn stats(&self) -> TorrentStats {
        self.inner.stats.snapshot()
    }

    /// Check if the torrent is currently started.
    pub async fn is_started(&self) -> bool {
        *self.inner.started.lock().await
    }

    /// Get the announce urls of the torrent.
    pub fn trackers(&self) -> &[Tracker] {
        &self.inner.trackers
    }

    /// Get the DHT announce bridge of the torrent.
    /// Private torrents never carry an announcer.
    pub fn dht_announcer(&self) -> Option<&DhtAnnouncer> {
        self.inner.announcer.as_ref()
    }

    /// Get the number of established peer connections.
    pub async fn active_peer_connections(&self) -> usize {
        self.inner.peers.lock().await.len()
    }

    /// Get the completed piece bitfield of the torrent.
    pub async fn bitfield(&self) -> BitVec {
        self.inner.bitfield.lock().await.clone()
    }

    /// The signal which fires when the torrent is removed from the session.
    pub(crate) fn removed(&self) -> &CancellationToken {
        &self.inner.removed
    }

    pub(crate) fn mark_removed(&self) {
        self.inner.removed.cancel();
    }

    /// Start the torrent, persisting the started flag before launching its workers.
    pub async fn start(&self) -> Result<()> {
        let mut started = self.inner.started.lock().await;
        if *started {
            return Ok(());
        }

        self.inner.resumer.write_started(true)?;
        *started = true;
        self.inner.start_workers().await;

        debug!("Torrent {} has been started", self);
        self.inner.callbacks.invoke(TorrentEvent::Started);
        Ok(())
    }

    /// Stop the torrent, persisting the started flag before tearing its workers down.
    pub async fn stop(&self) -> Result<()> {
        let mut started = self.inner.started.lock().await;
        if !*started {
            return Ok(());
        }

        self.inner.resumer.write_started(false)?;
        *started = false;
        self.inner.stop_workers().await;

        debug!("Torrent {} has been stopped", self);
        self.inner.callbacks.invoke(TorrentEvent::Stopped);
        Ok(())
    }

    /// Close the torrent, tearing down all of its tasks.
    /// Closing does not modify the persisted started flag.
    pub async fn close(&self) {
        trace!("Torrent {} is closing", self);
        self.inner.cancellation_token.cancel();
        self.inner.stop_workers().await;
        self.inner.done.cancelled().await;
        debug!("Torrent {} has been closed", self);
    }
}

impl Callback<TorrentEvent> for Torrent {
    fn subscribe(&self) -> Subscription<TorrentEvent> {
        self.inner.callbacks.subscribe()
    }

    fn subscribe_with(&self, subscriber: Subscriber<TorrentEvent>) {
        self.inner.callbacks.subscribe_with(subscriber)
    }
}

impl Debug for Torrent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Torrent")
            .field("id", &self.inner.id)
            .field("port", &self.inner.port)
            .field("info_hash", &self.inner.info_hash)
            .field("name", &self.inner.name)
            .finish()
    }
}

struct TorrentContext {
    id: u64,
    port: u16,
    info_hash: InfoHash,
    peer_id: PeerId,
    name: String,
    info: Option<TorrentInfo>,
    pieces: Arc<RwLock<Vec<Piece>>>,
    files: Arc<Vec<TorrentFile>>,
    multi_file: bool,
    trackers: Vec<Tracker>,
    url_list: Vec<String>,
    storage: FileStorage,
    resumer: Resumer,
    announcer: Option<DhtAnnouncer>,
    bitfield: Mutex<BitVec>,
    stats: AtomicStats,
    blocklist: Arc<Blocklist>,
    config: Arc<SessionConfig>,
    client: Client,
    registry: PeerIdRegistry,
    peers: Mutex<Vec<PeerConn>>,
    buffer_pool: BufferPool,
    handshake_tx: UnboundedSender<HandshakeResult>,
    piece_tx: UnboundedSender<PieceResult>,
    supply_tx: Mutex<Option<UnboundedSender<SocketAddr>>>,
    dialer: Mutex<Option<PeerDialer>>,
    webseeds: Mutex<Vec<UrlDownloader>>,
    started: Mutex<bool>,
    removed: CancellationToken,
    cancellation_token: CancellationToken,
    done: CancellationToken,
    callbacks: MultiThreadedCallback<TorrentEvent>,
}

impl TorrentContext {
    /// Launch the dialer, the initial announce and the web seed downloaders.
    async fn start_workers(&self) {
        let (supply_tx, supply_rx) = unbounded_channel();
        *self.supply_tx.lock().await = Some(supply_tx);

        let dialer = PeerDialer::new(
            self.info_hash,
            self.peer_id,
            ProtocolExtensionFlags::ours(),
            self.registry.clone(),
            self.blocklist.clone(),
            self.config.peer_connection_timeout,
            supply_rx,
            self.handshake_tx.clone(),
        );
        dialer.start();
        *self.dialer.lock().await = Some(dialer);

        if let Some(announcer) = self.announcer.as_ref() {
            announcer.announce().await;
        }

        let total_pieces = self.pieces.read().await.len();
        if total_pieces > 0 {
            let mut webseeds = self.webseeds.lock().await;
            for url in &self.url_list {
                let downloader = UrlDownloader::new(url, 0, total_pieces);
                downloader.start(
                    self.client.clone(),
                    self.pieces.clone(),
                    self.files.clone(),
                    self.multi_file,
                    self.buffer_pool.clone(),
                    self.piece_tx.clone(),
                    self.config.webseed_read_timeout,
                );
                debug!(
                    "Torrent #{} started web seed downloader {} for {}",
                    self.id,
                    downloader.handle(),
                    url
                );
                webseeds.push(downloader);
            }
        }
    }

    /// Tear down the dialer and the web seed downloaders.
    async fn stop_workers(&self) {
        *self.supply_tx.lock().await = None;

        if let Some(dialer) = self.dialer.lock().await.take() {
            dialer.stop().await;
        }

        let webseeds: Vec<UrlDownloader> = self.webseeds.lock().await.drain(..).collect();
        for downloader in webseeds {
            downloader.close().await;
        }

        self.peers.lock().await.clear();
    }

    /// The main dispatcher of the torrent.
    /// It consumes handshake results and piece results until the torrent is closed.
    async fn dispatch(
        &self,
        mut handshake_rx: UnboundedReceiver<HandshakeResult>,
        mut piece_rx: UnboundedReceiver<PieceResult>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => break,
                Some(result) = handshake_rx.recv() => self.handle_handshake_result(result).await,
                Some(result) = piece_rx.recv() => self.handle_piece_result(result).await,
            }
        }

        self.done.cancel();
        trace!("Torrent #{} dispatcher ended", self.id);
    }

    async fn handle_handshake_result(&self, result: HandshakeResult) {
        match result.result {
            Ok(conn) => {
                let addr = conn.addr;
                self.peers.lock().await.push(conn);
                self.callbacks.invoke(TorrentEvent::PeerConnected(addr));
            }
            Err(e) => {
                trace!(
                    "Torrent #{} connection attempt to {} failed, {}",
                    self.id,
                    result.addr,
                    e
                );
            }
        }
    }

    async fn handle_piece_result(&self, result: PieceResult) {
        if let Some(e) = result.error {
            warn!(
                "Torrent #{} web seed downloader {} failed, {}",
                self.id, result.downloader, e
            );
            return;
        }

        let buffer = match result.buffer {
            Some(buffer) => buffer,
            None => return,
        };
        let index = result.index;

        {
            let mut bitfield = self.bitfield.lock().await;
            if bitfield.get(index).unwrap_or(false) {
                self.stats
                    .bytes_wasted
                    .fetch_add(buffer.len() as u64, Ordering::Relaxed);
                return;
            }
            bitfield.set(index, true);
        }

        let offset = {
            let pieces = self.pieces.read().await;
            pieces[index].offset
        };
        if let Err(e) = self.storage.write(&self.files, offset, &buffer).await {
            warn!("Torrent #{} failed to store piece {}, {}", self.id, index, e);
            self.bitfield.lock().await.set(index, false);
            return;
        }

        self.stats
            .bytes_downloaded
            .fetch_add(buffer.len() as u64, Ordering::Relaxed);
        self.persist_progress().await;

        trace!("Torrent #{} completed piece {}", self.id, index);
        self.callbacks.invoke(TorrentEvent::PieceCompleted(index));
        if result.done {
            debug!(
                "Torrent #{} web seed downloader {} completed its range",
                self.id, result.downloader
            );
        }
    }

    /// Persist the bitfield and the byte counters of the torrent.
    async fn persist_progress(&self) {
        let bitfield = self.bitfield.lock().await.to_bytes();
        if let Err(e) = self.resumer.write_bitfield(&bitfield) {
            warn!("Torrent #{} failed to persist bitfield, {}", self.id, e);
        }

        let stats = self.stats.snapshot();
        if let Err(e) = self.resumer.write_stats(
            stats.bytes_downloaded,
            stats.bytes_uploaded,
            stats.bytes_wasted,
        ) {
            warn!("Torrent #{} failed to persist stats, {}", self.id, e);
        }
    }

    /// Forward the peer addresses discovered through the DHT into the address supply.
    /// The forwarder drains the announcer for the full lifetime of the torrent so that
    /// the session's result router is never blocked by a stopped torrent.
    async fn forward_announcer_peers(&self) {
        let announcer = match self.announcer.as_ref() {
            Some(announcer) => announcer,
            None => return,
        };
        let mut announce_interval = time::interval(ANNOUNCE_INTERVAL);
        // the first tick fires immediately, the initial announce happens on start
        announce_interval.tick().await;

        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => break,
                _ = announce_interval.tick() => {
                    if *self.started.lock().await {
                        announcer.announce().await;
                    }
                }
                addrs = announcer.recv() => match addrs {
                    Some(addrs) => {
                        let supply = self.supply_tx.lock().await;
                        if let Some(supply) = supply.as_ref() {
                            for addr in addrs {
                                let _ = supply.send(addr);
                            }
                        }
                    }
                    None => break,
                },
            }
        }
    }
}
