use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Size of a peer identity in bytes
pub const PEER_ID_LEN: usize = 16;

/// Universally unique 128-bit peer identity
///
/// Generated once per process. Identities are totally ordered by
/// lexicographic byte comparison; that order is the sole tie-breaker for
/// symmetric decisions such as electing a bridge.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Generate a fresh random identity
    pub fn random() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    /// Build an identity from raw bytes
    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// The identity's raw bytes, in memory order
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// Encode for the wire (little-endian byte order)
    pub fn to_wire(&self) -> [u8; PEER_ID_LEN] {
        let mut out = self.0;
        out.reverse();
        out
    }

    /// Decode from wire bytes; `None` unless exactly 16 bytes
    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != PEER_ID_LEN {
            return None;
        }
        let mut raw = [0u8; PEER_ID_LEN];
        raw.copy_from_slice(bytes);
        raw.reverse();
        Some(Self(raw))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", Uuid::from_bytes(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trip() {
        let id = PeerId::random();
        let wire = id.to_wire();
        let back = PeerId::from_wire(&wire).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn test_wire_rejects_bad_length() {
        assert!(PeerId::from_wire(&[0u8; 15]).is_none());
        assert!(PeerId::from_wire(&[0u8; 17]).is_none());
        assert!(PeerId::from_wire(&[]).is_none());
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let low = PeerId::from_bytes([0u8; PEER_ID_LEN]);
        let mut high_bytes = [0u8; PEER_ID_LEN];
        high_bytes[0] = 1;
        let high = PeerId::from_bytes(high_bytes);

        assert!(low < high);

        // Later bytes only matter when leading bytes tie
        let mut tail = [0u8; PEER_ID_LEN];
        tail[PEER_ID_LEN - 1] = 0xff;
        assert!(PeerId::from_bytes(tail) < high);
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(PeerId::random(), PeerId::random());
    }
}
