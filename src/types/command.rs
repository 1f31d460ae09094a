/// Control/data operations carried in the one-byte frame tag
///
/// The set is closed; `NullCommand` is the upper bound used for tag
/// validation and never travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Unicast payload for the recipient (or for relaying at a bridge)
    SendTo = 0x00,

    /// Broadcast payload, delivered locally and relayed by bridges
    SendToAll = 0x01,

    /// Ask the recipient to relay our traffic toward the carried id
    ForwardTo = 0x02,

    /// Ask the recipient to stop relaying toward the carried id
    StopForwarding = 0x03,

    /// The sender accepts and now relays toward the carried id
    ForwardingTo = 0x04,

    /// Ask the recipient to try dialing the carried endpoint
    ConnectTo = 0x05,

    /// The sender failed to dial the carried id
    CantConnect = 0x06,

    /// The sender reports a new hop count to the carried id
    UpdateDistance = 0x07,

    /// Ask the recipient for a distance report on the carried id
    RetrieveDistance = 0x08,

    /// Ask the recipient for its view of the membership
    RetrievePeers = 0x09,

    /// The sender's view of the membership
    PeersList = 0x0a,

    /// The carried id left the network gracefully
    PeerDisconnection = 0x0b,

    /// Liveness no-op, resets the idle timer
    KeepAlive = 0x0c,

    /// Sentinel, upper bound for tag validation
    NullCommand = 0x0d,
}

impl Command {
    /// Decode a wire tag; `None` for anything at or past the sentinel
    pub fn from_u8(tag: u8) -> Option<Command> {
        match tag {
            0x00 => Some(Command::SendTo),
            0x01 => Some(Command::SendToAll),
            0x02 => Some(Command::ForwardTo),
            0x03 => Some(Command::StopForwarding),
            0x04 => Some(Command::ForwardingTo),
            0x05 => Some(Command::ConnectTo),
            0x06 => Some(Command::CantConnect),
            0x07 => Some(Command::UpdateDistance),
            0x08 => Some(Command::RetrieveDistance),
            0x09 => Some(Command::RetrievePeers),
            0x0a => Some(Command::PeersList),
            0x0b => Some(Command::PeerDisconnection),
            0x0c => Some(Command::KeepAlive),
            _ => None,
        }
    }

    /// The wire tag
    pub fn tag(self) -> u8 {
        self as u8
    }
}
