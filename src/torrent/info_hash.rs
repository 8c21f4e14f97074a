use crate::torrent::{Result, SessionError};
use sha1::{Digest, Sha1};
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

/// The 20 byte SHA-1 identifier of a torrent's info dictionary.
/// This is the identifier of a torrent on the wire, within the DHT and the resume database.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Calculate the info hash for the given raw info dictionary bytes.
    pub fn from_info_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    /// Try to create an info hash from the given raw bytes.
    ///
    /// # Returns
    ///
    /// It returns an error when the given slice is not exactly 20 bytes.
    pub fn try_from_bytes(bytes: &[u8]) -> Result<Self> {
        let hash: [u8; 20] = bytes.try_into().map_err(|_| {
            SessionError::TorrentParse(format!(
                "expected an info hash of 20 bytes, but got {} instead",
                bytes.len()
            ))
        })?;
        Ok(Self(hash))
    }

    /// Get the raw bytes of the info hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Get the raw bytes of the info hash as an owned vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl FromStr for InfoHash {
    type Err = SessionError;

    /// Parse an info hash from its 40 character hex or 32 character base32 representation.
    fn from_str(s: &str) -> Result<Self> {
        match s.len() {
            40 => {
                let bytes = hex::decode(s)
                    .map_err(|e| SessionError::TorrentParse(e.to_string()))?;
                Self::try_from_bytes(&bytes)
            }
            32 => {
                let bytes = base32::decode(base32::Alphabet::Rfc4648 { padding: false }, s)
                    .ok_or_else(|| {
                        SessionError::TorrentParse(format!("invalid base32 info hash \"{}\"", s))
                    })?;
                Self::try_from_bytes(&bytes)
            }
            _ => Err(SessionError::TorrentParse(format!(
                "invalid info hash length {}",
                s.len()
            ))),
        }
    }
}

impl Display for InfoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

impl Debug for InfoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "InfoHash({})", self)
    }
}
