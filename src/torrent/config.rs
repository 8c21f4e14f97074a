use std::path::{Path, PathBuf};
use std::time::Duration;

pub(crate) const DEFAULT_DATABASE: &str = "~/.downpour/session.db";
pub(crate) const DEFAULT_DATA_DIR: &str = "~/.downpour/data";
pub(crate) const DEFAULT_PORT_BEGIN: u16 = 50000;
pub(crate) const DEFAULT_PORT_END: u16 = 60000;
pub(crate) const DEFAULT_MAX_OPEN_FILES: u64 = 10240;
pub(crate) const DEFAULT_PEER_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_WEBSEED_READ_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_TRACKER_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_TRACKER_USER_AGENT: &str = "downpour/0.1";

/// The session configuration values.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// The file path of the resume database.
    pub database: PathBuf,
    /// The directory in which torrent payload data is stored, one subdirectory per torrent id.
    pub data_dir: PathBuf,
    /// The start of the torrent listen port range, inclusive.
    pub port_begin: u16,
    /// The end of the torrent listen port range, exclusive.
    pub port_end: u16,
    /// The `RLIMIT_NOFILE` value applied on session creation.
    pub max_open_files: u64,
    /// The optional file path of the ip blocklist.
    pub blocklist: Option<PathBuf>,
    /// The timeout applied to outbound peer connections and handshakes.
    pub peer_connection_timeout: Duration,
    /// The stall guard timeout applied to web seed body reads.
    pub webseed_read_timeout: Duration,
    /// The timeout used by tracker requests.
    pub tracker_timeout: Duration,
    /// The user agent announced to http trackers.
    pub tracker_user_agent: String,
}

impl SessionConfig {
    /// Create a new session configuration builder.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::builder()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    database: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    port_begin: Option<u16>,
    port_end: Option<u16>,
    max_open_files: Option<u64>,
    blocklist: Option<PathBuf>,
    peer_connection_timeout: Option<Duration>,
    webseed_read_timeout: Option<Duration>,
    tracker_timeout: Option<Duration>,
    tracker_user_agent: Option<String>,
}

impl SessionConfigBuilder {
    /// Create a new session configuration builder.
    pub fn builder() -> Self {
        Self::default()
    }

    /// Set the file path of the resume database.
    pub fn database<P: AsRef<Path>>(&mut self, database: P) -> &mut Self {
        self.database = Some(database.as_ref().to_path_buf());
        self
    }

    /// Set the directory in which torrent payload data will be stored.
    pub fn data_dir<P: AsRef<Path>>(&mut self, data_dir: P) -> &mut Self {
        self.data_dir = Some(data_dir.as_ref().to_path_buf());
        self
    }

    /// Set the torrent listen port range as `[begin, end)`.
    pub fn port_range(&mut self, begin: u16, end: u16) -> &mut Self {
        self.port_begin = Some(begin);
        self.port_end = Some(end);
        self
    }

    /// Set the `RLIMIT_NOFILE` value applied on session creation.
    pub fn max_open_files(&mut self, max_open_files: u64) -> &mut Self {
        self.max_open_files = Some(max_open_files);
        self
    }

    /// Set the file path of the ip blocklist.
    pub fn blocklist<P: AsRef<Path>>(&mut self, blocklist: P) -> &mut Self {
        self.blocklist = Some(blocklist.as_ref().to_path_buf());
        self
    }

    /// Set the timeout for outbound peer connections.
    pub fn peer_connection_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.peer_connection_timeout = Some(timeout);
        self
    }

    /// Set the stall guard timeout for web seed body reads.
    pub fn webseed_read_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.webseed_read_timeout = Some(timeout);
        self
    }

    /// Set the timeout used by tracker requests.
    pub fn tracker_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.tracker_timeout = Some(timeout);
        self
    }

    /// Set the user agent announced to http trackers.
    pub fn tracker_user_agent<S: AsRef<str>>(&mut self, user_agent: S) -> &mut Self {
        self.tracker_user_agent = Some(user_agent.as_ref().to_string());
        self
    }

    /// Build the session configuration.
    pub fn build(&mut self) -> SessionConfig {
        SessionConfig {
            database: self
                .database
                .take()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE)),
            data_dir: self
                .data_dir
                .take()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            port_begin: self.port_begin.take().unwrap_or(DEFAULT_PORT_BEGIN),
            port_end: self.port_end.take().unwrap_or(DEFAULT_PORT_END),
            max_open_files: self.max_open_files.take().unwrap_or(DEFAULT_MAX_OPEN_FILES),
            blocklist: self.blocklist.take(),
            peer_connection_timeout: self
                .peer_connection_timeout
                .take()
                .unwrap_or(DEFAULT_PEER_CONNECTION_TIMEOUT),
            webseed_read_timeout: self
                .webseed_read_timeout
                .take()
                .unwrap_or(DEFAULT_WEBSEED_READ_TIMEOUT),
            tracker_timeout: self.tracker_timeout.take().unwrap_or(DEFAULT_TRACKER_TIMEOUT),
            tracker_user_agent: self
                .tracker_user_agent
                .take()
                .unwrap_or_else(|| DEFAULT_TRACKER_USER_AGENT.to_string()),
        }
    }
}
