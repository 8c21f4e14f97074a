use crate::torrent::blocklist::Blocklist;
use crate::torrent::dht::{parse_compact_peers, DhtAnnouncer, DhtNode, PendingPeerRequests, PeersRequestResults};
use crate::torrent::port_pool::PortPool;
use crate::torrent::resume::{ResumeDb, ResumeError, ResumeSpec, Resumer};
use crate::torrent::tracker::{Tracker, TrackerManager};
use crate::torrent::torrent::TorrentParams;
use crate::torrent::{
    FileStorage, InfoHash, Magnet, Metainfo, Result, SessionConfig, SessionError, Torrent,
    TorrentInfo, TorrentStats,
};
use bit_vec::BitVec;
use derive_more::Display;
use fx_callback::{Callback, MultiThreadedCallback, Subscriber, Subscription};
use itertools::Itertools;
use log::{debug, error, info, trace, warn};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// The name of the main resume database bucket holding one sub bucket per torrent.
const MAIN_BUCKET: &str = "torrents";
/// The timeout for acquiring the resume database lock.
const DB_LOCK_TIMEOUT: Duration = Duration::from_secs(1);
/// The interval of the DHT peers request limiter.
const DHT_LIMITER_INTERVAL: Duration = Duration::from_secs(1);

/// The events of a session.
#[derive(Debug, Display, Clone, PartialEq)]
pub enum SessionEvent {
    /// Indicates that a new torrent was added to the session.
    #[display("torrent {} has been added", _0)]
    TorrentAdded(u64),
    /// Indicates that a torrent has been removed from the session.
    #[display("torrent {} has been removed", _0)]
    TorrentRemoved(u64),
}

/// The process wide owner of the torrent set.
///
/// The session persists every torrent into its resume database, assigns each of them a
/// listen port from the configured range and routes DHT peer discovery results to the
/// matching torrents. Dropping the session does not tear it down, use [Session::close].
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<InnerSession>,
}

impl Session {
    /// Create a new session for the given configuration, restoring all previously
    /// persisted torrents from the resume database.
    ///
    /// # Arguments
    ///
    /// * `config` - The session configuration.
    /// * `dht` - The DHT node used for peer discovery.
    ///
    /// # Returns
    ///
    /// It returns an error when the configuration is invalid or the resume database
    /// could not be opened.
    pub async fn new(config: SessionConfig, dht: Arc<dyn DhtNode>) -> Result<Self> {
        if config.port_begin >= config.port_end {
            return Err(SessionError::InvalidPortRange);
        }
        raise_file_limit(config.max_open_files)?;

        let mut config = config;
        config.database = expand_home(&config.database);
        config.data_dir = expand_home(&config.data_dir);

        if let Some(parent) = config.database.parent() {
            create_dir_restricted(parent)?;
        }
        let db = ResumeDb::open(&config.database, DB_LOCK_TIMEOUT)?;
        db.create_bucket(MAIN_BUCKET)?;
        let ids = db
            .bucket_names(MAIN_BUCKET)?
            .into_iter()
            .filter_map(|name| match name.parse::<u64>() {
                Ok(id) => Some(id),
                Err(e) => {
                    error!("Invalid resume bucket name \"{}\", {}", name, e);
                    None
                }
            })
            .sorted()
            .collect::<Vec<u64>>();

        dht.start()
            .await
            .map_err(|e| SessionError::Dht(e.to_string()))?;

        let ports = PortPool::new(config.port_begin, config.port_end);
        let inner = Arc::new(InnerSession {
            config: Arc::new(config),
            db,
            dht,
            blocklist: Arc::new(Blocklist::new()),
            tracker_manager: TrackerManager::new(),
            registry: RwLock::new(TorrentRegistry::default()),
            ports,
            pending: PendingPeerRequests::new(),
            callbacks: MultiThreadedCallback::new(),
            cancellation_token: CancellationToken::new(),
            done: CancellationToken::new(),
        });

        let session = Self { inner };
        session.reload_blocklist().await?;
        session.inner.restore_torrents(ids).await;

        let router = session.inner.clone();
        tokio::spawn(async move {
            router.start().await;
        });

        debug!("Created new session for {:?}", session.inner.config.database);
        Ok(session)
    }

    /// Add a new torrent to the session from a metainfo stream.
    /// The torrent is persisted and started automatically.
    pub async fn add_torrent<R: Read>(&self, reader: R) -> Result<Torrent> {
        let metainfo = Metainfo::parse(reader)?;
        let allocation = self.inner.allocate()?;
        let port = allocation.port;

        match self.inner.add_metainfo_torrent(metainfo, allocation).await {
            Ok(torrent) => {
                torrent.start().await?;
                self.inner
                    .callbacks
                    .invoke(SessionEvent::TorrentAdded(torrent.id()));
                Ok(torrent)
            }
            Err(e) => {
                self.inner.ports.release(port);
                Err(e)
            }
        }
    }

    /// Add a new torrent to the session from a magnet link.
    /// The torrent info stays empty until the metadata has been exchanged with peers.
    pub async fn add_magnet(&self, uri: &str) -> Result<Torrent> {
        let magnet = Magnet::from_str(uri)?;
        let allocation = self.inner.allocate()?;
        let port = allocation.port;

        match self.inner.add_magnet_torrent(magnet, allocation).await {
            Ok(torrent) => {
                torrent.start().await?;
                self.inner
                    .callbacks
                    .invoke(SessionEvent::TorrentAdded(torrent.id()));
                Ok(torrent)
            }
            Err(e) => {
                self.inner.ports.release(port);
                Err(e)
            }
        }
    }

    /// Get the torrent with the given id.
    pub async fn torrent(&self, id: u64) -> Option<Torrent> {
        self.inner.registry.read().await.by_id.get(&id).cloned()
    }

    /// Get a snapshot of all torrents within the session, ordered by id.
    pub async fn torrents(&self) -> Vec<Torrent> {
        self.inner
            .registry
            .read()
            .await
            .by_id
            .values()
            .cloned()
            .sorted_by_key(|e| e.id())
            .collect()
    }

    /// Remove the torrent with the given id from the session, deleting its persisted state.
    /// Removing an unknown id is a no-op.
    pub async fn remove_torrent(&self, id: u64) -> Result<()> {
        let removed = self.inner.remove_torrent(id).await?;
        if removed {
            self.inner
                .callbacks
                .invoke(SessionEvent::TorrentRemoved(id));
        }
        Ok(())
    }

    /// Reload the configured blocklist file.
    ///
    /// # Returns
    ///
    /// It returns the number of loaded rules, or 0 when no blocklist is configured.
    pub async fn reload_blocklist(&self) -> Result<usize> {
        let path = match self.inner.config.blocklist.as_ref() {
            Some(path) => path.clone(),
            None => return Ok(0),
        };

        let file = std::fs::File::open(&path)?;
        let count = self
            .inner
            .blocklist
            .reload(std::io::BufReader::new(file))?;
        info!("Loaded {} rules from blocklist", count);
        Ok(count)
    }

    /// Close the session, stopping the DHT node and closing all torrents in parallel.
    pub async fn close(&self) -> Result<()> {
        trace!("Session is closing");
        self.inner.cancellation_token.cancel();
        self.inner.dht.stop().await;

        {
            let mut registry = self.inner.registry.write().await;
            let torrents: Vec<Torrent> = registry.by_id.drain().map(|(_, e)| e).collect();
            registry.by_info_hash.clear();

            futures::future::join_all(torrents.iter().map(|torrent| torrent.close())).await;
        }

        self.inner.done.cancelled().await;
        self.inner.db.close();
        debug!("Session has been closed");
        Ok(())
    }
}

impl Callback<SessionEvent> for Session {
    fn subscribe(&self) -> Subscription<SessionEvent> {
        self.inner.callbacks.subscribe()
    }

    fn subscribe_with(&self, subscriber: Subscriber<SessionEvent>) {
        self.inner.callbacks.subscribe_with(subscriber)
    }
}

#[derive(Debug, Default)]
struct TorrentRegistry {
    by_id: HashMap<u64, Torrent>,
    by_info_hash: HashMap<InfoHash, Vec<Torrent>>,
}

/// The resources acquired for a torrent before its engine is constructed.
struct Allocation {
    port: u16,
    id: u64,
    resumer: Resumer,
    storage: FileStorage,
}

struct InnerSession {
    config: Arc<SessionConfig>,
    db: ResumeDb,
    dht: Arc<dyn DhtNode>,
    blocklist: Arc<Blocklist>,
    tracker_manager: TrackerManager,
    registry: RwLock<TorrentRegistry>,
    ports: PortPool,
    pending: PendingPeerRequests,
    callbacks: MultiThreadedCallback<SessionEvent>,
    cancellation_token: CancellationToken,
    done: CancellationToken,
}

impl std::fmt::Debug for InnerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InnerSession")
            .field("config", &self.config)
            .field("db", &self.db)
            .field("dht", &self.dht)
            .field("ports", &self.ports)
            .finish()
    }
}

impl InnerSession {
    /// The main loop of the session.
    /// It throttles outgoing DHT peers requests and routes incoming peer results.
    async fn start(&self) {
        let mut dht_limiter = time::interval(DHT_LIMITER_INTERVAL);

        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => break,
                _ = dht_limiter.tick() => self.handle_dht_tick().await,
                results = self.dht.recv() => match results {
                    Some(results) => self.handle_dht_peers(results).await,
                    None => break,
                },
            }
        }

        self.done.cancel();
        debug!("Session main loop ended");
    }

    /// Issue a single pending DHT peers request, if any.
    async fn handle_dht_tick(&self) {
        if let Some(info_hash) = self.pending.pop().await {
            trace!("Requesting DHT peers for {}", info_hash);
            self.dht.peers_request(&info_hash, true).await;
        }
    }

    /// Route a batch of DHT peer results to the matching torrents.
    /// The delivery races against the removed signal of each torrent.
    async fn handle_dht_peers(&self, results: PeersRequestResults) {
        for (info_hash, entries) in results {
            let torrents = self
                .registry
                .read()
                .await
                .by_info_hash
                .get(&info_hash)
                .cloned()
                .unwrap_or_default();
            if torrents.is_empty() {
                continue;
            }

            let addrs = parse_compact_peers(&entries);
            trace!(
                "Routing {} DHT peer addresses for {}",
                addrs.len(),
                info_hash
            );
            for torrent in torrents {
                if let Some(announcer) = torrent.dht_announcer() {
                    let sender = announcer.sender();
                    tokio::select! {
                        _ = torrent.removed().cancelled() => {},
                        _ = sender.send(addrs.clone()) => {},
                    }
                }
            }
        }
    }

    /// Acquire the port, id, resume handle and storage of a new torrent.
    /// The acquired port is released again when any of the subsequent steps fails.
    fn allocate(&self) -> Result<Allocation> {
        let port = self.ports.acquire().ok_or(SessionError::NoFreePort)?;

        let result = (|| {
            let id = self.db.next_sequence(MAIN_BUCKET)?;
            let resumer = Resumer::new(&self.db, MAIN_BUCKET, id)?;
            let dest = self.config.data_dir.join(id.to_string());
            let storage = FileStorage::new(&dest)
                .map_err(|e| ResumeError::Io(e))?;
            Ok::<_, ResumeError>((id, resumer, storage))
        })();

        match result {
            Ok((id, resumer, storage)) => Ok(Allocation {
                port,
                id,
                resumer,
                storage,
            }),
            Err(e) => {
                self.ports.release(port);
                Err(e.into())
            }
        }
    }

    async fn add_metainfo_torrent(
        &self,
        metainfo: Metainfo,
        allocation: Allocation,
    ) -> Result<Torrent> {
        let tracker_urls = metainfo.trackers();
        let trackers = self.parse_trackers(&tracker_urls).await;
        let announcer = if !metainfo.info.is_private() {
            Some(DhtAnnouncer::new(
                metainfo.info_hash,
                allocation.port,
                self.pending.clone(),
            ))
        } else {
            None
        };

        let spec = ResumeSpec {
            info_hash: metainfo.info_hash.to_vec(),
            dest: allocation.storage.dest().to_string_lossy().to_string(),
            port: allocation.port,
            name: metainfo.info.name.clone(),
            trackers: tracker_urls,
            info: metainfo.info_bytes.clone(),
            bitfield: vec![],
            ..Default::default()
        };
        allocation.resumer.write(&spec)?;

        let torrent = Torrent::new(TorrentParams {
            id: allocation.id,
            port: allocation.port,
            info_hash: metainfo.info_hash,
            name: metainfo.info.name.clone(),
            info: Some(metainfo.info),
            trackers,
            url_list: metainfo.url_list,
            storage: allocation.storage,
            resumer: allocation.resumer,
            announcer,
            bitfield: None,
            stats: TorrentStats::default(),
            blocklist: self.blocklist.clone(),
            config: self.config.clone(),
        })?;
        self.register(torrent.clone()).await;
        Ok(torrent)
    }

    async fn add_magnet_torrent(&self, magnet: Magnet, allocation: Allocation) -> Result<Torrent> {
        let trackers = self.parse_trackers(&magnet.trackers).await;
        // magnets are never private at this stage, the metadata is still unknown
        let announcer = DhtAnnouncer::new(magnet.info_hash, allocation.port, self.pending.clone());

        let spec = ResumeSpec {
            info_hash: magnet.info_hash.to_vec(),
            dest: allocation.storage.dest().to_string_lossy().to_string(),
            port: allocation.port,
            name: magnet.name(),
            trackers: magnet.trackers.clone(),
            ..Default::default()
        };
        allocation.resumer.write(&spec)?;

        let torrent = Torrent::new(TorrentParams {
            id: allocation.id,
            port: allocation.port,
            info_hash: magnet.info_hash,
            name: magnet.name(),
            info: None,
            trackers,
            url_list: vec![],
            storage: allocation.storage,
            resumer: allocation.resumer,
            announcer: Some(announcer),
            bitfield: None,
            stats: TorrentStats::default(),
            blocklist: self.blocklist.clone(),
            config: self.config.clone(),
        })?;
        self.register(torrent.clone()).await;
        Ok(torrent)
    }

    /// Restore all persisted torrents of the resume database.
    /// Per-torrent failures are logged and skipped, previously started torrents are
    /// started again once every torrent has been restored.
    async fn restore_torrents(&self, ids: Vec<u64>) {
        let mut loaded = 0;
        let mut started = Vec::new();

        for id in ids {
            match self.restore_torrent(id).await {
                Ok((torrent, has_started)) => {
                    debug!("Loaded existing torrent: {}", torrent);
                    loaded += 1;
                    if has_started {
                        started.push(torrent);
                    }
                }
                Err(e) => error!("Failed to restore torrent #{}, {}", id, e),
            }
        }

        info!("Loaded {} existing torrents", loaded);
        for torrent in started {
            if let Err(e) = torrent.start().await {
                error!("Failed to start torrent {}, {}", torrent, e);
            }
        }
    }

    async fn restore_torrent(&self, id: u64) -> Result<(Torrent, bool)> {
        let resumer = Resumer::open(&self.db, MAIN_BUCKET, id)?;
        let has_started = resumer.read_started()?;
        let spec = resumer.read()?;
        let info_hash = InfoHash::try_from_bytes(&spec.info_hash)?;

        let mut info: Option<TorrentInfo> = None;
        let mut bitfield: Option<BitVec> = None;
        let mut private = false;
        if !spec.info.is_empty() {
            let parsed = TorrentInfo::from_bytes(&spec.info)?;
            private = parsed.is_private();
            if !spec.bitfield.is_empty() {
                let mut bits = BitVec::from_bytes(&spec.bitfield);
                bits.truncate(parsed.total_pieces());
                bitfield = Some(bits);
            }
            info = Some(parsed);
        }

        let announcer = if !private {
            Some(DhtAnnouncer::new(info_hash, spec.port, self.pending.clone()))
        } else {
            None
        };
        let storage = FileStorage::new(&spec.dest)?;
        let trackers = self.parse_trackers(&spec.trackers).await;
        self.ports.remove(spec.port);

        let torrent = Torrent::new(TorrentParams {
            id,
            port: spec.port,
            info_hash,
            name: spec.name.clone(),
            info,
            trackers,
            url_list: vec![],
            storage,
            resumer,
            announcer,
            bitfield,
            stats: TorrentStats {
                bytes_downloaded: spec.bytes_downloaded,
                bytes_uploaded: spec.bytes_uploaded,
                bytes_wasted: spec.bytes_wasted,
            },
            blocklist: self.blocklist.clone(),
            config: self.config.clone(),
        })?;
        self.register(torrent.clone()).await;

        Ok((torrent, has_started))
    }

    /// Register the torrent within both session indices.
    async fn register(&self, torrent: Torrent) {
        let mut registry = self.registry.write().await;
        registry
            .by_info_hash
            .entry(*torrent.info_hash())
            .or_default()
            .push(torrent.clone());
        registry.by_id.insert(torrent.id(), torrent);
    }

    /// Remove the torrent with the given id from the session.
    ///
    /// # Returns
    ///
    /// It returns false when the id is unknown.
    async fn remove_torrent(&self, id: u64) -> Result<bool> {
        let mut registry = self.registry.write().await;
        let torrent = match registry.by_id.get(&id) {
            Some(torrent) => torrent.clone(),
            None => return Ok(false),
        };

        debug!("Session is removing torrent {}", torrent);
        torrent.mark_removed();
        torrent.close().await;

        registry.by_id.remove(&id);
        if let Some(torrents) = registry.by_info_hash.get_mut(torrent.info_hash()) {
            torrents.retain(|e| e.id() != id);
            if torrents.is_empty() {
                registry.by_info_hash.remove(torrent.info_hash());
            }
        }
        drop(registry);

        self.ports.release(torrent.port());
        self.db.delete_sub_bucket(MAIN_BUCKET, &id.to_string())?;
        Ok(true)
    }

    /// Parse the given announce urls into tracker handles.
    /// Unparseable urls are logged and dropped from the list.
    async fn parse_trackers(&self, urls: &[String]) -> Vec<Tracker> {
        let mut trackers = Vec::new();
        for url in urls {
            match self
                .tracker_manager
                .get(
                    url,
                    self.config.tracker_timeout,
                    &self.config.tracker_user_agent,
                )
                .await
            {
                Ok(tracker) => trackers.push(tracker),
                Err(e) => warn!("Cannot parse tracker url {}, {}", url, e),
            }
        }
        trackers
    }
}

/// Expand a leading `~` within the given path to the user's home directory.
fn expand_home(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(base_dirs) = directories::BaseDirs::new() {
            return base_dirs.home_dir().join(stripped);
        }
    }
    path.to_path_buf()
}

/// Create the given directory with owner/group only permissions.
#[cfg(unix)]
fn create_dir_restricted(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o750)
        .create(path)
}

#[cfg(not(unix))]
fn create_dir_restricted(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}

/// Set the soft and hard `RLIMIT_NOFILE` of the process.
#[cfg(unix)]
fn raise_file_limit(max_open_files: u64) -> Result<()> {
    let limit = libc::rlimit {
        rlim_cur: max_open_files as libc::rlim_t,
        rlim_max: max_open_files as libc::rlim_t,
    };
    let result = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) };
    if result != 0 {
        return Err(SessionError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn raise_file_limit(_max_open_files: u64) -> Result<()> {
    Ok(())
}
