// MeshNet - a peer-to-peer mesh overlay library
//
// Every node is simultaneously client and server: a node joins the overlay
// by dialing any existing member, learns the full membership from it, and
// connects directly to every other member it can reach. When two members
// cannot reach each other, a common neighbor elects itself as a bridge and
// relays their traffic.

pub mod codec;
pub mod config;
pub mod error;
pub mod manager;
pub mod peer;
pub mod transport;
pub mod types;

pub use config::{MeshConfig, DEFAULT_PORT};
pub use error::MeshError;
pub use manager::{ConnectionListener, DataListener, DisconnectionListener, PeerManager};
pub use peer::listeners::ListenerId;
pub use transport::{Acceptor, BoxedStream, TcpTransport, Transport};
pub use types::command::Command;
pub use types::peer::{Peer, DISTANCE_DIRECT, DISTANCE_SELF, DISTANCE_UNREACHABLE};
pub use types::peer_id::PeerId;

/// Initialize logging
pub fn init_logger() {
    env_logger::init();
}
