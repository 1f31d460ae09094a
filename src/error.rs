use thiserror::Error;

use crate::types::peer_id::PeerId;

/// Errors surfaced by the peer manager and its protocol plumbing
#[derive(Debug, Error)]
pub enum MeshError {
    /// A lifecycle precondition was violated (already running, mutating
    /// configuration while running, ...)
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Dial or admission handshake did not complete
    #[error("connection failed: {0}")]
    ConnectFailure(String),

    /// Bad tag or truncated payload; the frame is dropped, the connection kept
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A send targeted a peer that is no longer in the table
    #[error("peer {0} is not in the peer table")]
    PeerGone(PeerId),

    /// The remote spoke a different protocol revision
    #[error("protocol identifier mismatch (remote sent {remote:#018x})")]
    ProtocolMismatch { remote: u64 },

    /// Configuration could not be loaded or stored
    #[error("config error: {0}")]
    Config(String),

    /// Underlying I/O error
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
