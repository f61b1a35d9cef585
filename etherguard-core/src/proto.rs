//! Wire format for packets exchanged between mesh nodes.
//!
//! Two layers of framing, both network byte order:
//!
//! - The **outer packet** is what travels in a UDP datagram: a clear header
//!   identifying the sender and carrying the AEAD nonce sequence, a detached
//!   16-byte authentication tag, and the encrypted payload. The header is
//!   authenticated as AEAD associated data.
//! - The **EG header** is the first 8 bytes of the *plaintext* payload: usage
//!   tag, TTL, source and destination node ids, body length. It is only ever
//!   seen after decryption and is therefore authenticated end to end.
//!
//! Outer header layout (17 bytes):
//! - Magic number (4 bytes): protocol identifier
//! - Version (1 byte)
//! - Sender node id (2 bytes)
//! - Sequence number (8 bytes): per-sender nonce counter
//! - Payload length (2 bytes)

use crate::types::Vertex;
use std::fmt;

/// Magic number identifying EtherGuard packets (ASCII: "EGRD").
pub const PROTOCOL_MAGIC: u32 = 0x45475244;

/// Current protocol version.
pub const CURRENT_VERSION: u8 = 1;

/// Size of the AEAD authentication tag (ChaCha20Poly1305).
pub const AUTH_TAG_SIZE: usize = 16;

/// Minimum outer packet size (header + tag, no payload).
pub const MIN_PACKET_SIZE: usize = PacketHeader::SIZE + AUTH_TAG_SIZE;

/// Maximum outer packet size (MTU bound).
pub const MAX_PACKET_SIZE: usize = 2048;

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion(pub u8);

impl ProtocolVersion {
    pub fn current() -> Self {
        Self(CURRENT_VERSION)
    }

    pub fn is_supported(&self) -> bool {
        self.0 == CURRENT_VERSION
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Outer packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub magic: u32,
    pub version: ProtocolVersion,
    /// Node id of the sender; selects the peer (and key) on receipt.
    pub sender: Vertex,
    /// Per-sender monotonically increasing counter, also the nonce input.
    pub sequence: u64,
    /// Length of the encrypted payload.
    pub payload_len: u16,
}

impl PacketHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 17;

    pub fn new(sender: Vertex, sequence: u64) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: ProtocolVersion::current(),
            sender,
            sequence,
            payload_len: 0,
        }
    }

    /// Encode header to bytes (network byte order).
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4] = self.version.0;
        buf[5..7].copy_from_slice(&self.sender.0.to_be_bytes());
        buf[7..15].copy_from_slice(&self.sequence.to_be_bytes());
        buf[15..17].copy_from_slice(&self.payload_len.to_be_bytes());
        buf
    }

    /// Decode header from bytes (network byte order).
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < Self::SIZE {
            return Err(ProtoError::Truncated {
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }

        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != PROTOCOL_MAGIC {
            return Err(ProtoError::InvalidMagic(magic));
        }

        let version = ProtocolVersion(buf[4]);
        if !version.is_supported() {
            return Err(ProtoError::UnsupportedVersion(version.0));
        }

        let sender = Vertex(u16::from_be_bytes([buf[5], buf[6]]));
        let sequence = u64::from_be_bytes([
            buf[7], buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14],
        ]);
        let payload_len = u16::from_be_bytes([buf[15], buf[16]]);

        Ok(Self {
            magic,
            version,
            sender,
            sequence,
            payload_len,
        })
    }
}

/// Complete outer packet with header, detached tag, and encrypted payload.
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: PacketHeader,
    pub auth_tag: [u8; AUTH_TAG_SIZE],
    /// Encrypted EG header + body.
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(sender: Vertex, sequence: u64, payload: Vec<u8>) -> Self {
        let mut header = PacketHeader::new(sender, sequence);
        header.payload_len = payload.len() as u16;

        Self {
            header,
            auth_tag: [0u8; AUTH_TAG_SIZE],
            payload,
        }
    }

    pub fn total_size(&self) -> usize {
        PacketHeader::SIZE + AUTH_TAG_SIZE + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.total_size());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.auth_tag);
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < MIN_PACKET_SIZE {
            return Err(ProtoError::Truncated {
                expected: MIN_PACKET_SIZE,
                actual: buf.len(),
            });
        }

        let header = PacketHeader::decode(&buf[..PacketHeader::SIZE])?;

        let tag_end = PacketHeader::SIZE + AUTH_TAG_SIZE;
        let mut auth_tag = [0u8; AUTH_TAG_SIZE];
        auth_tag.copy_from_slice(&buf[PacketHeader::SIZE..tag_end]);

        let expected = tag_end + header.payload_len as usize;
        if buf.len() < expected {
            return Err(ProtoError::Truncated {
                expected,
                actual: buf.len(),
            });
        }

        let payload = buf[tag_end..expected].to_vec();

        Ok(Self {
            header,
            auth_tag,
            payload,
        })
    }
}

/// Payload kind carried behind the EG header.
///
/// The numeric values are wire format and stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Usage {
    /// An Ethernet frame for the TAP device.
    Normal = 0,
    /// Edge → supernode liveness + state-hash echo.
    Register = 1,
    /// Supernode → edge: next-hop table hash changed, pull if mismatched.
    UpdateNhTable = 2,
    /// Supernode → edge: peer list hash changed, pull if mismatched.
    UpdatePeer = 3,
    /// Supernode → edge error/action directive.
    UpdateError = 4,
    /// Latency probe.
    Ping = 5,
    /// Latency report.
    Pong = 6,
    /// P2P peer gossip.
    BroadcastPeer = 7,
}

impl Usage {
    pub fn from_u8(v: u8) -> Result<Self, ProtoError> {
        match v {
            0 => Ok(Usage::Normal),
            1 => Ok(Usage::Register),
            2 => Ok(Usage::UpdateNhTable),
            3 => Ok(Usage::UpdatePeer),
            4 => Ok(Usage::UpdateError),
            5 => Ok(Usage::Ping),
            6 => Ok(Usage::Pong),
            7 => Ok(Usage::BroadcastPeer),
            other => Err(ProtoError::UnknownUsage(other)),
        }
    }
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Usage::Normal => "normal",
            Usage::Register => "register",
            Usage::UpdateNhTable => "update_nhtable",
            Usage::UpdatePeer => "update_peer",
            Usage::UpdateError => "update_error",
            Usage::Ping => "ping",
            Usage::Pong => "pong",
            Usage::BroadcastPeer => "broadcast_peer",
        };
        write!(f, "{s}")
    }
}

/// In-tunnel framing header, prepended to every plaintext payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EgHeader {
    pub usage: Usage,
    pub ttl: u8,
    pub src: Vertex,
    pub dst: Vertex,
    /// Length of the body following this header.
    pub body_len: u16,
}

impl EgHeader {
    /// Fixed size on the wire.
    pub const SIZE: usize = 8;

    pub fn new(usage: Usage, ttl: u8, src: Vertex, dst: Vertex, body_len: u16) -> Self {
        Self {
            usage,
            ttl,
            src,
            dst,
            body_len,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.usage as u8;
        buf[1] = self.ttl;
        buf[2..4].copy_from_slice(&self.src.0.to_be_bytes());
        buf[4..6].copy_from_slice(&self.dst.0.to_be_bytes());
        buf[6..8].copy_from_slice(&self.body_len.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < Self::SIZE {
            return Err(ProtoError::Truncated {
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }
        Ok(Self {
            usage: Usage::from_u8(buf[0])?,
            ttl: buf[1],
            src: Vertex(u16::from_be_bytes([buf[2], buf[3]])),
            dst: Vertex(u16::from_be_bytes([buf[4], buf[5]])),
            body_len: u16::from_be_bytes([buf[6], buf[7]]),
        })
    }

    /// Assemble header + body into one plaintext buffer.
    pub fn seal_body(usage: Usage, ttl: u8, src: Vertex, dst: Vertex, body: &[u8]) -> Vec<u8> {
        let hdr = EgHeader::new(usage, ttl, src, dst, body.len() as u16);
        let mut buf = Vec::with_capacity(Self::SIZE + body.len());
        buf.extend_from_slice(&hdr.encode());
        buf.extend_from_slice(body);
        buf
    }

    /// Split a plaintext buffer into header and body.
    pub fn open_body(plain: &[u8]) -> Result<(EgHeader, &[u8]), ProtoError> {
        let hdr = EgHeader::decode(plain)?;
        let end = Self::SIZE + hdr.body_len as usize;
        if plain.len() < end {
            return Err(ProtoError::Truncated {
                expected: end,
                actual: plain.len(),
            });
        }
        Ok((hdr, &plain[Self::SIZE..end]))
    }
}

/// Protocol-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("invalid magic number: 0x{0:08X} (expected 0x{magic:08X})", magic = PROTOCOL_MAGIC)]
    InvalidMagic(u32),

    #[error("unsupported protocol version: v{0}")]
    UnsupportedVersion(u8),

    #[error("packet truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("unknown usage tag: {0}")]
    UnknownUsage(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode() {
        let header = PacketHeader {
            magic: PROTOCOL_MAGIC,
            version: ProtocolVersion::current(),
            sender: Vertex(7),
            sequence: 42,
            payload_len: 100,
        };

        let encoded = header.encode();
        let decoded = PacketHeader::decode(&encoded).expect("decode header");
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_header_invalid_magic() {
        let mut buf = [0u8; PacketHeader::SIZE];
        buf[0..4].copy_from_slice(&0xDEADBEEFu32.to_be_bytes());
        buf[4] = CURRENT_VERSION;

        let result = PacketHeader::decode(&buf);
        assert!(matches!(result, Err(ProtoError::InvalidMagic(_))));
    }

    #[test]
    fn test_header_unsupported_version() {
        let mut buf = [0u8; PacketHeader::SIZE];
        buf[0..4].copy_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
        buf[4] = 99;

        let result = PacketHeader::decode(&buf);
        assert!(matches!(result, Err(ProtoError::UnsupportedVersion(_))));
    }

    #[test]
    fn test_packet_encode_decode() {
        let payload = vec![1, 2, 3, 4, 5];
        let packet = Packet::new(Vertex(3), 100, payload.clone());

        let encoded = packet.encode();
        let decoded = Packet::decode(&encoded).expect("decode packet");

        assert_eq!(packet.header.sender, decoded.header.sender);
        assert_eq!(packet.header.sequence, decoded.header.sequence);
        assert_eq!(packet.payload, decoded.payload);
    }

    #[test]
    fn test_packet_too_short() {
        let buf = vec![0u8; 10];
        let result = Packet::decode(&buf);
        assert!(matches!(result, Err(ProtoError::Truncated { .. })));
    }

    #[test]
    fn test_eg_header_roundtrip() {
        let hdr = EgHeader::new(Usage::Pong, 200, Vertex(1), Vertex(2), 37);
        let encoded = hdr.encode();
        let decoded = EgHeader::decode(&encoded).expect("decode eg header");
        assert_eq!(hdr, decoded);
    }

    #[test]
    fn test_eg_header_unknown_usage() {
        let mut buf = EgHeader::new(Usage::Normal, 1, Vertex(1), Vertex(2), 0).encode();
        buf[0] = 0xAB;
        assert!(matches!(
            EgHeader::decode(&buf),
            Err(ProtoError::UnknownUsage(0xAB))
        ));
    }

    #[test]
    fn test_usage_values_are_stable() {
        for (tag, value) in [
            (Usage::Normal, 0u8),
            (Usage::Register, 1),
            (Usage::UpdateNhTable, 2),
            (Usage::UpdatePeer, 3),
            (Usage::UpdateError, 4),
            (Usage::Ping, 5),
            (Usage::Pong, 6),
            (Usage::BroadcastPeer, 7),
        ] {
            assert_eq!(tag as u8, value);
            assert_eq!(Usage::from_u8(value).unwrap(), tag);
        }
    }

    #[test]
    fn test_seal_open_body() {
        let body = b"hello mesh";
        let plain = EgHeader::seal_body(Usage::Normal, 64, Vertex(5), Vertex(9), body);
        let (hdr, got) = EgHeader::open_body(&plain).expect("open body");
        assert_eq!(hdr.usage, Usage::Normal);
        assert_eq!(hdr.ttl, 64);
        assert_eq!(hdr.src, Vertex(5));
        assert_eq!(hdr.dst, Vertex(9));
        assert_eq!(got, body);
    }
}
