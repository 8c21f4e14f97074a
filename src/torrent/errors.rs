use crate::torrent::resume::ResumeError;
use crate::torrent::tracker::TrackerError;
use crate::torrent::MagnetError;
use std::io;
use thiserror::Error;

/// The result type of the session package.
pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The configured listen port range is empty or reversed.
    #[error("invalid port range")]
    InvalidPortRange,
    /// All ports of the configured range are assigned to torrents.
    #[error("no free port")]
    NoFreePort,
    #[error("failed to parse torrent data, {0}")]
    TorrentParse(String),
    #[error("failed to parse magnet uri, {0}")]
    Magnet(MagnetError),
    #[error("{0}")]
    Resume(ResumeError),
    #[error("tracker error: {0}")]
    Tracker(TrackerError),
    #[error("dht error: {0}")]
    Dht(String),
    #[error("an io error occurred, {0}")]
    Io(io::Error),
}

impl PartialEq for SessionError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::InvalidPortRange, Self::InvalidPortRange) => true,
            (Self::NoFreePort, Self::NoFreePort) => true,
            (Self::TorrentParse(_), Self::TorrentParse(_)) => true,
            (Self::Magnet(le), Self::Magnet(re)) => le == re,
            (Self::Resume(le), Self::Resume(re)) => le == re,
            (Self::Tracker(le), Self::Tracker(re)) => le == re,
            (Self::Dht(_), Self::Dht(_)) => true,
            (Self::Io(_), Self::Io(_)) => true,
            _ => false,
        }
    }
}

impl From<MagnetError> for SessionError {
    fn from(err: MagnetError) -> Self {
        Self::Magnet(err)
    }
}

impl From<ResumeError> for SessionError {
    fn from(err: ResumeError) -> Self {
        Self::Resume(err)
    }
}

impl From<TrackerError> for SessionError {
    fn from(err: TrackerError) -> Self {
        Self::Tracker(err)
    }
}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_bencode::Error> for SessionError {
    fn from(err: serde_bencode::Error) -> Self {
        Self::TorrentParse(err.to_string())
    }
}
