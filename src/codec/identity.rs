use std::marker::Unpin;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::MeshError;
use crate::types::peer_id::{PeerId, PEER_ID_LEN};

/// First half of the protocol identifier, bumped on every compatibility break
pub const PROTOCOL_ID_1: u32 = 0x4d45_5348;

/// Second half of the protocol identifier
pub const PROTOCOL_ID_2: u32 = 0x0001_0000;

/// Read buffer for the identity packet; a length prefix past this bound is
/// rejected as malformed
pub const ID_BUFFER_LEN: usize = 64;

/// Identity announced during admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub id: PeerId,
    pub port: u16,
}

/// Encode the identity packet: `[len][id bytes le][port_hi][port_lo]`
///
/// The leading byte counts everything after itself, and the listening port
/// rides big-endian inside the packet. Both are wire-compatibility quirks
/// and must not change.
pub fn encode_identity(id: &PeerId, port: u16) -> Vec<u8> {
    let wire = id.to_wire();
    let mut packet = Vec::with_capacity(wire.len() + 3);
    packet.push((wire.len() + 2) as u8);
    packet.extend_from_slice(&wire);
    packet.push((port >> 8) as u8);
    packet.push((port & 0xff) as u8);
    packet
}

/// Decode an identity packet body (everything after the length prefix)
pub fn decode_identity(body: &[u8]) -> Result<Identity, MeshError> {
    if body.len() < 3 {
        return Err(MeshError::MalformedFrame(format!(
            "identity packet too short: {} bytes",
            body.len()
        )));
    }

    let id_bytes = &body[..body.len() - 2];
    let id = PeerId::from_wire(id_bytes).ok_or_else(|| {
        MeshError::MalformedFrame(format!(
            "unsupported identity length: {} bytes (expected {})",
            id_bytes.len(),
            PEER_ID_LEN
        ))
    })?;

    let port = (u16::from(body[body.len() - 2]) << 8) | u16::from(body[body.len() - 1]);
    Ok(Identity { id, port })
}

/// Exchange protocol identifiers over a fresh stream
///
/// Both halves are written little-endian immediately after the socket is
/// established, before any identity is revealed. A mismatch closes the
/// stream without creating a peer record.
pub async fn exchange_protocol_id<S>(stream: &mut S) -> Result<(), MeshError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_u32_le(PROTOCOL_ID_1).await?;
    stream.write_u32_le(PROTOCOL_ID_2).await?;
    stream.flush().await?;

    let remote_1 = stream.read_u32_le().await?;
    let remote_2 = stream.read_u32_le().await?;

    if remote_1 != PROTOCOL_ID_1 || remote_2 != PROTOCOL_ID_2 {
        return Err(MeshError::ProtocolMismatch {
            remote: (u64::from(remote_1) << 32) | u64::from(remote_2),
        });
    }

    Ok(())
}

/// Exchange identity packets over a stream that passed the protocol check
pub async fn exchange_identity<S>(stream: &mut S, id: &PeerId, port: u16) -> Result<Identity, MeshError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&encode_identity(id, port)).await?;
    stream.flush().await?;

    let len = stream.read_u8().await? as usize;
    if len > ID_BUFFER_LEN {
        return Err(MeshError::MalformedFrame(format!(
            "identity length prefix {} exceeds buffer of {} bytes",
            len, ID_BUFFER_LEN
        )));
    }

    let mut buf = [0u8; ID_BUFFER_LEN];
    stream.read_exact(&mut buf[..len]).await?;
    decode_identity(&buf[..len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_identity_round_trip() {
        let id = PeerId::random();
        let packet = encode_identity(&id, 3479);

        assert_eq!(packet[0] as usize, packet.len() - 1);

        let identity = decode_identity(&packet[1..]).unwrap();
        assert_eq!(identity.id, id);
        assert_eq!(identity.port, 3479);
    }

    #[test]
    fn test_identity_rejects_short_body() {
        assert!(decode_identity(&[]).is_err());
        assert!(decode_identity(&[1, 2]).is_err());
    }

    #[test]
    fn test_identity_rejects_wrong_id_length() {
        // 8 id bytes instead of 16
        let mut body = vec![0u8; 8];
        body.push(0x0d);
        body.push(0x97);
        assert!(matches!(
            decode_identity(&body),
            Err(MeshError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn test_protocol_id_exchange() {
        let (mut client, mut server) = duplex(64);

        let (a, b) = tokio::join!(
            exchange_protocol_id(&mut client),
            exchange_protocol_id(&mut server)
        );
        a.unwrap();
        b.unwrap();
    }

    #[tokio::test]
    async fn test_protocol_id_mismatch() {
        let (mut client, mut server) = duplex(64);

        // A remote speaking a different revision
        server.write_u32_le(PROTOCOL_ID_1 ^ 1).await.unwrap();
        server.write_u32_le(PROTOCOL_ID_2).await.unwrap();

        let result = exchange_protocol_id(&mut client).await;
        assert!(matches!(result, Err(MeshError::ProtocolMismatch { .. })));
    }

    #[tokio::test]
    async fn test_identity_exchange() {
        let (mut client, mut server) = duplex(128);

        let id_a = PeerId::random();
        let id_b = PeerId::random();

        let (a, b) = tokio::join!(
            exchange_identity(&mut client, &id_a, 4000),
            exchange_identity(&mut server, &id_b, 4001)
        );

        let seen_by_a = a.unwrap();
        let seen_by_b = b.unwrap();
        assert_eq!(seen_by_a.id, id_b);
        assert_eq!(seen_by_a.port, 4001);
        assert_eq!(seen_by_b.id, id_a);
        assert_eq!(seen_by_b.port, 4000);
    }

    #[tokio::test]
    async fn test_identity_length_past_buffer_is_malformed() {
        let (mut client, mut server) = duplex(512);

        // Length prefix claims more than the read buffer holds
        server.write_u8((ID_BUFFER_LEN + 1) as u8).await.unwrap();
        server.write_all(&[0u8; ID_BUFFER_LEN + 1]).await.unwrap();

        let id = PeerId::random();
        let result = exchange_identity(&mut client, &id, 3479).await;
        assert!(matches!(result, Err(MeshError::MalformedFrame(_))));
    }
}
