use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::types::peer_id::PeerId;

/// Hop count of the local peer to itself
pub const DISTANCE_SELF: u8 = 0;

/// Hop count of a peer reached over an owned socket
pub const DISTANCE_DIRECT: u8 = 1;

/// Hop count marking a peer as unreachable / disconnected
pub const DISTANCE_UNREACHABLE: u8 = 255;

/// A remote participant in the overlay
///
/// `bridge` is held as an id and resolved through the peer table on each
/// use, keeping the membership graph a flat table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Stable 128-bit identity
    pub id: PeerId,

    /// Last-known reachable address
    pub addr: IpAddr,

    /// Last-known listening port
    pub port: u16,

    /// Hop count from self: 0 self, 1 direct, >=2 bridged, 255 unreachable
    pub distance: u8,

    /// Direct peer currently relaying our traffic toward this peer,
    /// present iff `distance >= 2` and the peer is reachable
    pub bridge: Option<PeerId>,
}

impl Peer {
    /// A peer reached over an owned socket
    pub fn direct(id: PeerId, addr: IpAddr, port: u16) -> Self {
        Self {
            id,
            addr,
            port,
            distance: DISTANCE_DIRECT,
            bridge: None,
        }
    }

    /// A peer reached through a relay bridge
    pub fn bridged(id: PeerId, addr: IpAddr, port: u16, bridge: PeerId, distance: u8) -> Self {
        Self {
            id,
            addr,
            port,
            distance,
            bridge: Some(bridge),
        }
    }

    /// A known peer we currently have no route to
    pub fn unreachable(id: PeerId, addr: IpAddr, port: u16) -> Self {
        Self {
            id,
            addr,
            port,
            distance: DISTANCE_UNREACHABLE,
            bridge: None,
        }
    }

    /// The distinguished record for the local node, `distance = 0`
    pub fn local(id: PeerId, addr: IpAddr, port: u16) -> Self {
        Self {
            id,
            addr,
            port,
            distance: DISTANCE_SELF,
            bridge: None,
        }
    }

    /// Whether this peer is reached over an owned socket
    pub fn is_direct(&self) -> bool {
        self.distance == DISTANCE_DIRECT
    }

    /// Whether the forwarding engine may route to this peer at all
    pub fn is_reachable(&self) -> bool {
        self.distance != DISTANCE_UNREACHABLE
    }

    /// Last-known listening endpoint
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}
