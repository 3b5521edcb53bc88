use std::fmt;

use rand::Rng as _;
use sha1::{Digest, Sha1};

use crate::constants::CLIENT_PREFIX;

const WEB_SEED_PREFIX: &[u8] = b"-WS0000-";

/// A 20-byte peer identifier in Azureus style (`-XX0000-<random>`).
///
/// ```
/// use seedwire::peer::PeerId;
///
/// let id = PeerId::generate();
/// assert_eq!(id.client_id(), Some("SW0001"));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Generates a random peer ID carrying our client prefix.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(CLIENT_PREFIX);
        rand::rng().fill(&mut id[8..]);
        Self(id)
    }

    /// A stable identifier for a web seed, derived from its URL.
    ///
    /// Web seeds never send a handshake, so they get a synthetic ID that stays
    /// the same across reconnects.
    pub fn for_web_seed(url: &str) -> Self {
        let digest = Sha1::digest(url.as_bytes());
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(WEB_SEED_PREFIX);
        id[8..].copy_from_slice(&digest[..12]);
        Self(id)
    }

    /// Returns `None` unless the slice is exactly 20 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let id: [u8; 20] = bytes.try_into().ok()?;
        Some(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// The `XX0000` part of an Azureus-style ID.
    pub fn client_id(&self) -> Option<&str> {
        if self.0[0] == b'-' && self.0[7] == b'-' {
            std::str::from_utf8(&self.0[1..7]).ok()
        } else {
            None
        }
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.client_id() {
            Some(client) => write!(f, "PeerId({})", client),
            None => write!(f, "PeerId({:02x?})", &self.0[..8]),
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            if byte.is_ascii_alphanumeric() || *byte == b'-' {
                write!(f, "{}", *byte as char)?;
            } else {
                write!(f, "%{:02x}", byte)?;
            }
        }
        Ok(())
    }
}
