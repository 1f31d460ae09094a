use std::net::IpAddr;

use crate::error::MeshError;
use crate::types::peer::Peer;
use crate::types::peer_id::{PeerId, PEER_ID_LEN};

/// A roster entry: everything needed to attempt a dial
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEntry {
    pub id: PeerId,
    pub addr: IpAddr,
    pub port: u16,
}

impl PeerEntry {
    pub fn of(peer: &Peer) -> Self {
        Self {
            id: peer.id,
            addr: peer.addr,
            port: peer.port,
        }
    }
}

/// Decoded `SendTo` payload
#[derive(Debug, PartialEq, Eq)]
pub struct Unicast<'a> {
    pub source: PeerId,
    pub target: PeerId,
    pub data: &'a [u8],
}

/// Decoded `SendToAll` payload
#[derive(Debug, PartialEq, Eq)]
pub struct Broadcast<'a> {
    pub source: PeerId,
    pub data: &'a [u8],
}

// Cursor over a received payload; every read is bounds-checked so a
// truncated payload surfaces as MalformedFrame instead of a panic.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], MeshError> {
        if self.pos + n > self.buf.len() {
            return Err(MeshError::MalformedFrame(format!(
                "payload truncated: wanted {} more bytes, {} left",
                n,
                self.buf.len() - self.pos
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, MeshError> {
        Ok(self.take(1)?[0])
    }

    fn u16_le(&mut self) -> Result<u16, MeshError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn peer_id(&mut self) -> Result<PeerId, MeshError> {
        let bytes = self.take(PEER_ID_LEN)?;
        PeerId::from_wire(bytes)
            .ok_or_else(|| MeshError::MalformedFrame("bad peer id".to_string()))
    }

    fn rest(self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn expect_end(&self) -> Result<(), MeshError> {
        if self.pos != self.buf.len() {
            return Err(MeshError::MalformedFrame(format!(
                "{} trailing bytes",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

fn put_endpoint(out: &mut Vec<u8>, addr: IpAddr, port: u16) {
    out.extend_from_slice(&port.to_le_bytes());
    match addr {
        IpAddr::V4(v4) => {
            out.push(4);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.push(6);
            out.extend_from_slice(&v6.octets());
        }
    }
}

fn read_endpoint(reader: &mut Reader<'_>) -> Result<(IpAddr, u16), MeshError> {
    let port = reader.u16_le()?;
    let addr = match reader.u8()? {
        4 => {
            let octets = reader.take(4)?;
            IpAddr::from([octets[0], octets[1], octets[2], octets[3]])
        }
        6 => {
            let octets = reader.take(16)?;
            let mut raw = [0u8; 16];
            raw.copy_from_slice(octets);
            IpAddr::from(raw)
        }
        tag => {
            return Err(MeshError::MalformedFrame(format!(
                "unknown address tag {}",
                tag
            )))
        }
    };
    Ok((addr, port))
}

/// `SendTo`: `source_id || target_id || data`
pub fn encode_unicast(source: &PeerId, target: &PeerId, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 * PEER_ID_LEN + data.len());
    out.extend_from_slice(&source.to_wire());
    out.extend_from_slice(&target.to_wire());
    out.extend_from_slice(data);
    out
}

pub fn decode_unicast(payload: &[u8]) -> Result<Unicast<'_>, MeshError> {
    let mut reader = Reader::new(payload);
    let source = reader.peer_id()?;
    let target = reader.peer_id()?;
    Ok(Unicast {
        source,
        target,
        data: reader.rest(),
    })
}

/// `SendToAll`: `source_id || data`
pub fn encode_broadcast(source: &PeerId, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PEER_ID_LEN + data.len());
    out.extend_from_slice(&source.to_wire());
    out.extend_from_slice(data);
    out
}

pub fn decode_broadcast(payload: &[u8]) -> Result<Broadcast<'_>, MeshError> {
    let mut reader = Reader::new(payload);
    let source = reader.peer_id()?;
    Ok(Broadcast {
        source,
        data: reader.rest(),
    })
}

/// Bare id payload (`ForwardTo`, `StopForwarding`, `ForwardingTo`,
/// `CantConnect`, `RetrieveDistance`, `PeerDisconnection`)
pub fn encode_peer_id(id: &PeerId) -> Vec<u8> {
    id.to_wire().to_vec()
}

pub fn decode_peer_id(payload: &[u8]) -> Result<PeerId, MeshError> {
    let mut reader = Reader::new(payload);
    let id = reader.peer_id()?;
    reader.expect_end()?;
    Ok(id)
}

/// `ConnectTo`: a single roster entry
pub fn encode_peer_entry(entry: &PeerEntry) -> Vec<u8> {
    let mut out = Vec::with_capacity(PEER_ID_LEN + 19);
    put_entry(&mut out, entry);
    out
}

pub fn decode_peer_entry(payload: &[u8]) -> Result<PeerEntry, MeshError> {
    let mut reader = Reader::new(payload);
    let entry = read_entry(&mut reader)?;
    reader.expect_end()?;
    Ok(entry)
}

/// `UpdateDistance`: `id || distance`
pub fn encode_distance(id: &PeerId, distance: u8) -> Vec<u8> {
    let mut out = id.to_wire().to_vec();
    out.push(distance);
    out
}

pub fn decode_distance(payload: &[u8]) -> Result<(PeerId, u8), MeshError> {
    let mut reader = Reader::new(payload);
    let id = reader.peer_id()?;
    let distance = reader.u8()?;
    reader.expect_end()?;
    Ok((id, distance))
}

/// `PeersList`: `count(u16 le)` then `count` roster entries
pub fn encode_peers_list(entries: &[PeerEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    for entry in entries {
        put_entry(&mut out, entry);
    }
    out
}

pub fn decode_peers_list(payload: &[u8]) -> Result<Vec<PeerEntry>, MeshError> {
    let mut reader = Reader::new(payload);
    let count = reader.u16_le()?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        entries.push(read_entry(&mut reader)?);
    }
    reader.expect_end()?;
    Ok(entries)
}

fn put_entry(out: &mut Vec<u8>, entry: &PeerEntry) {
    out.extend_from_slice(&entry.id.to_wire());
    put_endpoint(out, entry.addr, entry.port);
}

fn read_entry(reader: &mut Reader<'_>) -> Result<PeerEntry, MeshError> {
    let id = reader.peer_id()?;
    let (addr, port) = read_endpoint(reader)?;
    Ok(PeerEntry { id, addr, port })
}
