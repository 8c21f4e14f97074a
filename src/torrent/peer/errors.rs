use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// The peer operation specific [std::result::Result] type
pub type Result<T> = std::result::Result<T, Error>;

/// Indicates that an error occurred while establishing a peer connection
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    #[error("peer id is invalid")]
    InvalidPeerId,
    /// Indicates that the remote peer id is already connected
    #[error("peer id is already connected")]
    DuplicatePeerId,
    #[error("handshake with {0} failed, {1}")]
    Handshake(SocketAddr, String),
    /// Indicates that an io error occurred, the kind is kept for error classification
    #[error("an io error occurred, {1}")]
    Io(io::ErrorKind, String),
    /// Indicates that the connection attempt has been cancelled
    #[error("the connection attempt has been closed")]
    Closed,
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Io(error.kind(), error.to_string())
    }
}
