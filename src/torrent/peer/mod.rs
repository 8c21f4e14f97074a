pub use dialer::*;
pub use errors::*;
pub use handshake::*;

mod dialer;
mod errors;
mod handshake;

use bitmask_enum::bitmask;
use rand::distr::Alphanumeric;
use rand::Rng;
use std::collections::HashSet;
use std::fmt::{Debug, Display, Formatter};
use std::sync::{Arc, Mutex};

const PEER_ID_PREFIX: &[u8] = b"-DP0100-";

/// The 20 byte peer identifier exchanged within the BitTorrent handshake.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Generate a new random peer id carrying the client prefix.
    pub fn new() -> Self {
        let mut value = [0u8; 20];
        value[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
        let mut rng = rand::rng();
        for byte in value[PEER_ID_PREFIX.len()..].iter_mut() {
            *byte = rng.sample(Alphanumeric);
        }
        Self(value)
    }

    /// Get the raw bytes of the peer id.
    pub fn value(&self) -> [u8; 20] {
        self.0
    }
}

impl TryFrom<&[u8]> for PeerId {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self> {
        let bytes: [u8; 20] = value.try_into().map_err(|_| Error::InvalidPeerId)?;
        if bytes.iter().all(|e| *e == 0) {
            return Err(Error::InvalidPeerId);
        }
        Ok(Self(bytes))
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

/// The registry of remote peer ids the torrent is currently connected with.
/// It prevents establishing more than one connection to the same peer.
#[derive(Debug, Clone, Default)]
pub struct PeerIdRegistry {
    inner: Arc<Mutex<HashSet<PeerId>>>,
}

impl PeerIdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the given remote peer id.
    ///
    /// # Returns
    ///
    /// It returns false when the peer id is already registered.
    pub fn register(&self, peer_id: PeerId) -> bool {
        self.inner
            .lock()
            .expect("peer id registry lock poisoned")
            .insert(peer_id)
    }

    /// Remove the given remote peer id from the registry.
    pub fn deregister(&self, peer_id: &PeerId) {
        self.inner
            .lock()
            .expect("peer id registry lock poisoned")
            .remove(peer_id);
    }

    /// Get the number of registered peer ids.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("peer id registry lock poisoned")
            .len()
    }
}

/// The reserved-bit capabilities advertised within the BitTorrent handshake.
/// See BEP4 for the known reserved bits.
#[bitmask(u8)]
#[bitmask_config(vec_debug)]
pub enum ProtocolExtensionFlags {
    /// Libtorrent Extension Protocol, reserved bit 43
    Ltep,
    /// suggest, haveall, havenone, reject request, and allow fast extensions, reserved bit 61
    Fast,
    /// BitTorrent DHT, reserved bit 63
    Dht,
}

impl ProtocolExtensionFlags {
    /// Get the capabilities advertised by this client on outgoing handshakes.
    pub fn ours() -> Self {
        Self::Ltep | Self::Fast
    }
}

impl From<[u8; 8]> for ProtocolExtensionFlags {
    fn from(reserved: [u8; 8]) -> Self {
        let mut flags = Self::none();
        if reserved[5] & 0x10 != 0 {
            flags |= Self::Ltep;
        }
        if reserved[7] & 0x04 != 0 {
            flags |= Self::Fast;
        }
        if reserved[7] & 0x01 != 0 {
            flags |= Self::Dht;
        }
        flags
    }
}

impl From<ProtocolExtensionFlags> for [u8; 8] {
    fn from(flags: ProtocolExtensionFlags) -> Self {
        let mut reserved = [0u8; 8];
        if flags.contains(ProtocolExtensionFlags::Ltep) {
            reserved[5] |= 0x10;
        }
        if flags.contains(ProtocolExtensionFlags::Fast) {
            reserved[7] |= 0x04;
        }
        if flags.contains(ProtocolExtensionFlags::Dht) {
            reserved[7] |= 0x01;
        }
        reserved
    }
}

impl Display for ProtocolExtensionFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut extensions = Vec::new();

        if self.contains(Self::Ltep) {
            extensions.push("LTEP");
        }
        if self.contains(Self::Fast) {
            extensions.push("Fast");
        }
        if self.contains(Self::Dht) {
            extensions.push("DHT");
        }
        if extensions.is_empty() {
            extensions.push("None");
        }

        write!(f, "{}", extensions.join(" | "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_new() {
        let result = PeerId::new();

        assert_eq!(PEER_ID_PREFIX, &result.value()[..PEER_ID_PREFIX.len()]);
        assert_ne!(PeerId::new(), result);
    }

    #[test]
    fn test_peer_id_try_from() {
        let bytes = [0x41u8; 20];

        let result = PeerId::try_from(bytes.as_ref()).unwrap();
        assert_eq!(bytes, result.value());

        let result = PeerId::try_from([0u8; 20].as_ref());
        assert_eq!(Err(Error::InvalidPeerId), result);

        let result = PeerId::try_from([0x41u8; 19].as_ref());
        assert_eq!(Err(Error::InvalidPeerId), result);
    }

    #[test]
    fn test_peer_id_registry() {
        let registry = PeerIdRegistry::new();
        let peer_id = PeerId::new();

        assert_eq!(true, registry.register(peer_id));
        assert_eq!(
            false,
            registry.register(peer_id),
            "expected the duplicate id to have been rejected"
        );

        registry.deregister(&peer_id);
        assert_eq!(0, registry.len());
    }

    #[test]
    fn test_protocol_extension_flags_reserved_bytes() {
        let flags = ProtocolExtensionFlags::ours();

        let reserved: [u8; 8] = flags.into();

        // bit 43 is byte 5 mask 0x10, bit 61 is byte 7 mask 0x04
        assert_eq!([0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x04], reserved);
        assert_eq!(flags, ProtocolExtensionFlags::from(reserved));
    }

    #[test]
    fn test_protocol_extension_flags_intersection() {
        let ours = ProtocolExtensionFlags::Ltep | ProtocolExtensionFlags::Fast;
        let theirs = ProtocolExtensionFlags::Fast | ProtocolExtensionFlags::Dht;

        let result = ours & theirs;

        assert_eq!(ProtocolExtensionFlags::Fast, result);
    }

    #[test]
    fn test_protocol_extension_flags_display() {
        assert_eq!(
            "LTEP | Fast",
            ProtocolExtensionFlags::ours().to_string()
        );
        assert_eq!("None", ProtocolExtensionFlags::none().to_string());
    }
}
