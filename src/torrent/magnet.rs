use crate::torrent::InfoHash;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

const MAGNET_SCHEME: &str = "magnet";
const EXACT_TOPIC_PREFIX: &str = "urn:btih:";

/// Represents possible errors that can occur when parsing a magnet URI.
pub type MagnetResult<T> = std::result::Result<T, MagnetError>;

/// Represents possible errors that can occur when parsing a magnet URI.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MagnetError {
    /// Failed to parse the magnet URI.
    #[error("failed to parse magnet uri, {0}")]
    Parse(String),
    /// The specified magnet URI is invalid.
    #[error("invalid magnet uri")]
    InvalidUri,
    /// The specified exact topic value is invalid.
    #[error("value \"{0}\" is invalid")]
    InvalidValue(String),
    /// The specified scheme in the magnet URI is not supported.
    #[error("scheme \"{0}\" is not supported")]
    UnsupportedScheme(String),
}

/// A parsed `magnet:` link.
/// Only the exact topic (`xt`), display name (`dn`) and tracker (`tr`) fields are interpreted.
#[derive(Debug, Clone, PartialEq)]
pub struct Magnet {
    /// The info hash of the torrent described by the magnet link.
    pub info_hash: InfoHash,
    /// The display name of the torrent, if present.
    pub display_name: Option<String>,
    /// The announce urls of the magnet link.
    pub trackers: Vec<String>,
}

impl Magnet {
    /// Get the name of the torrent described by this magnet link.
    /// It falls back to the hex representation of the info hash when no display name is set.
    pub fn name(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| self.info_hash.to_string())
    }
}

impl FromStr for Magnet {
    type Err = MagnetError;

    fn from_str(uri: &str) -> MagnetResult<Self> {
        let url = Url::parse(uri).map_err(|e| MagnetError::Parse(e.to_string()))?;
        if url.scheme() != MAGNET_SCHEME {
            return Err(MagnetError::UnsupportedScheme(url.scheme().to_string()));
        }

        let mut info_hash: Option<InfoHash> = None;
        let mut display_name: Option<String> = None;
        let mut trackers = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    let topic = value
                        .strip_prefix(EXACT_TOPIC_PREFIX)
                        .ok_or_else(|| MagnetError::InvalidValue(value.to_string()))?;
                    info_hash = Some(
                        InfoHash::from_str(topic)
                            .map_err(|_| MagnetError::InvalidValue(topic.to_string()))?,
                    );
                }
                "dn" => display_name = Some(value.to_string()),
                "tr" => trackers.push(value.to_string()),
                _ => {}
            }
        }

        Ok(Self {
            info_hash: info_hash.ok_or(MagnetError::InvalidUri)?,
            display_name,
            trackers,
        })
    }
}
