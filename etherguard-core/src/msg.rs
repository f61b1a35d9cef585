//! Control-plane message bodies.
//!
//! Each message is a flat sequence of fixed-order fields, encoded big-endian
//! with length prefixes for variable-size fields. These bodies ride behind an
//! [`crate::proto::EgHeader`] whose usage tag selects the message type, so the
//! encoding itself carries no discriminant.

use crate::types::{StateHash, Vertex};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum encoded length of a string field.
const MAX_STRING_LEN: usize = 512;

/// Decoding/encoding errors for control messages.
#[derive(Debug, thiserror::Error)]
pub enum MsgError {
    #[error("message truncated: needed {needed} more bytes")]
    UnexpectedEof { needed: usize },

    #[error("string field too long: {0} bytes")]
    StringTooLong(usize),

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("unknown error action: {0}")]
    UnknownAction(u8),

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

/// Cursor over a message body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], MsgError> {
        if self.remaining() < n {
            return Err(MsgError::UnexpectedEof {
                needed: n - self.remaining(),
            });
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn read_u8(&mut self) -> Result<u8, MsgError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, MsgError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u64(&mut self) -> Result<u64, MsgError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_f64(&mut self) -> Result<f64, MsgError> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    fn read_vertex(&mut self) -> Result<Vertex, MsgError> {
        Ok(Vertex(self.read_u16()?))
    }

    fn read_hash(&mut self) -> Result<StateHash, MsgError> {
        let b = self.take(32)?;
        let mut h = [0u8; 32];
        h.copy_from_slice(b);
        Ok(h)
    }

    fn read_string(&mut self) -> Result<String, MsgError> {
        let len = self.read_u16()? as usize;
        if len > MAX_STRING_LEN {
            return Err(MsgError::StringTooLong(len));
        }
        let b = self.take(len)?;
        String::from_utf8(b.to_vec()).map_err(|_| MsgError::InvalidUtf8)
    }

    fn finish(self) -> Result<(), MsgError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(MsgError::TrailingBytes(n)),
        }
    }
}

/// Append-only encoder mirroring [`Reader`].
#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_f64(&mut self, v: f64) {
        self.put_u64(v.to_bits());
    }

    fn put_vertex(&mut self, v: Vertex) {
        self.put_u16(v.0);
    }

    fn put_hash(&mut self, h: &StateHash) {
        self.buf.extend_from_slice(h);
    }

    fn put_string(&mut self, s: &str) {
        debug_assert!(s.len() <= MAX_STRING_LEN);
        self.put_u16(s.len() as u16);
        self.buf.extend_from_slice(s.as_bytes());
    }
}

/// Edge → supernode: liveness refresh plus state-hash echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMsg {
    pub node_id: Vertex,
    pub version: String,
    /// Next-hop table hash the edge currently holds.
    pub nh_state_hash: StateHash,
    /// Peer-info hash the edge currently holds.
    pub peer_state_hash: StateHash,
    /// Local v4 address seen on the edge's outgoing socket ("" if unknown).
    pub local_v4: String,
    /// Local v6 address seen on the edge's outgoing socket ("" if unknown).
    pub local_v6: String,
}

impl RegisterMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.put_vertex(self.node_id);
        w.put_string(&self.version);
        w.put_hash(&self.nh_state_hash);
        w.put_hash(&self.peer_state_hash);
        w.put_string(&self.local_v4);
        w.put_string(&self.local_v6);
        w.buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MsgError> {
        let mut r = Reader::new(buf);
        let msg = Self {
            node_id: r.read_vertex()?,
            version: r.read_string()?,
            nh_state_hash: r.read_hash()?,
            peer_state_hash: r.read_hash()?,
            local_v4: r.read_string()?,
            local_v6: r.read_string()?,
        };
        r.finish()?;
        Ok(msg)
    }
}

/// Latency probe carrying the sender's clock.
#[derive(Debug, Clone, PartialEq)]
pub struct PingMsg {
    pub request_id: u64,
    pub src: Vertex,
    pub dst: Vertex,
    /// Seconds since the Unix epoch at send time.
    pub sent_at_secs: f64,
}

impl PingMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.put_u64(self.request_id);
        w.put_vertex(self.src);
        w.put_vertex(self.dst);
        w.put_f64(self.sent_at_secs);
        w.buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MsgError> {
        let mut r = Reader::new(buf);
        let msg = Self {
            request_id: r.read_u64()?,
            src: r.read_vertex()?,
            dst: r.read_vertex()?,
            sent_at_secs: r.read_f64()?,
        };
        r.finish()?;
        Ok(msg)
    }
}

/// Measured one-way latency of the directed edge src → dst.
#[derive(Debug, Clone, PartialEq)]
pub struct PongMsg {
    pub request_id: u64,
    pub src: Vertex,
    pub dst: Vertex,
    /// Seconds, IEEE-754.
    pub time_diff_secs: f64,
}

impl PongMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.put_u64(self.request_id);
        w.put_vertex(self.src);
        w.put_vertex(self.dst);
        w.put_f64(self.time_diff_secs);
        w.buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MsgError> {
        let mut r = Reader::new(buf);
        let msg = Self {
            request_id: r.read_u64()?,
            src: r.read_vertex()?,
            dst: r.read_vertex()?,
            time_diff_secs: r.read_f64()?,
        };
        r.finish()?;
        Ok(msg)
    }
}

/// Supernode → edge: the published next-hop table hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateNhTableMsg {
    pub state_hash: StateHash,
}

impl UpdateNhTableMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.put_hash(&self.state_hash);
        w.buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MsgError> {
        let mut r = Reader::new(buf);
        let msg = Self {
            state_hash: r.read_hash()?,
        };
        r.finish()?;
        Ok(msg)
    }
}

/// Supernode → edge: the published peer-info hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePeerMsg {
    pub state_hash: StateHash,
}

impl UpdatePeerMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.put_hash(&self.state_hash);
        w.buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MsgError> {
        let mut r = Reader::new(buf);
        let msg = Self {
            state_hash: r.read_hash()?,
        };
        r.finish()?;
        Ok(msg)
    }
}

/// What an edge must do when the supernode reports an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorAction {
    /// Terminate cleanly.
    Shutdown = 1,
    /// Log loudly and terminate.
    Panic = 2,
    /// Keep running but lower the reporting frequency.
    ThrottleOnly = 3,
}

impl ErrorAction {
    fn from_u8(v: u8) -> Result<Self, MsgError> {
        match v {
            1 => Ok(ErrorAction::Shutdown),
            2 => Ok(ErrorAction::Panic),
            3 => Ok(ErrorAction::ThrottleOnly),
            other => Err(MsgError::UnknownAction(other)),
        }
    }
}

impl fmt::Display for ErrorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorAction::Shutdown => "shutdown",
            ErrorAction::Panic => "panic",
            ErrorAction::ThrottleOnly => "throttle-only",
        };
        write!(f, "{s}")
    }
}

/// Supernode → edge error directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateErrorMsg {
    pub node_id: Vertex,
    pub action: ErrorAction,
    /// HTTP-style code, e.g. 410 when the peer has been removed.
    pub error_code: u16,
    pub error_msg: String,
}

impl UpdateErrorMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.put_vertex(self.node_id);
        w.put_u8(self.action as u8);
        w.put_u16(self.error_code);
        w.put_string(&self.error_msg);
        w.buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MsgError> {
        let mut r = Reader::new(buf);
        let msg = Self {
            node_id: r.read_vertex()?,
            action: ErrorAction::from_u8(r.read_u8()?)?,
            error_code: r.read_u16()?,
            error_msg: r.read_string()?,
        };
        r.finish()?;
        Ok(msg)
    }
}

/// P2P peer gossip: "this peer exists and can be reached here".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastPeerMsg {
    pub request_id: u64,
    pub node_id: Vertex,
    pub pubkey: [u8; 32],
    /// Endpoint the announcing node uses for this peer ("" if unknown).
    pub conn_url: String,
}

impl BroadcastPeerMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.put_u64(self.request_id);
        w.put_vertex(self.node_id);
        w.put_hash(&self.pubkey);
        w.put_string(&self.conn_url);
        w.buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MsgError> {
        let mut r = Reader::new(buf);
        let msg = Self {
            request_id: r.read_u64()?,
            node_id: r.read_vertex()?,
            pubkey: r.read_hash()?,
            conn_url: r.read_string()?,
        };
        r.finish()?;
        Ok(msg)
    }
}

/// One peer as served by the supernode's `/api/peerinfo` endpoint.
///
/// This is HTTP JSON, not wire framing: edges pull the full list when the
/// pushed `PeerInfoHash` stops matching their cached copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiPeerInfo {
    #[serde(rename = "NodeID")]
    pub node_id: Vertex,
    #[serde(rename = "PubKey")]
    pub pubkey: String,
    /// Pre-shared key for inter-edge tunnels, present only when the
    /// supernode is configured to distribute one.
    #[serde(rename = "PSKey", default, skip_serializing_if = "Option::is_none")]
    pub psk: Option<String>,
    /// Reachable v4 endpoint ("" when unknown).
    #[serde(rename = "ConnV4", default)]
    pub conn_v4: String,
    /// Reachable v6 endpoint ("" when unknown).
    #[serde(rename = "ConnV6", default)]
    pub conn_v6: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_peer_info_json_roundtrip() {
        let info = ApiPeerInfo {
            node_id: Vertex(2),
            pubkey: "AAAA".to_string(),
            psk: None,
            conn_v4: "192.0.2.5:3000".to_string(),
            conn_v6: String::new(),
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"NodeID\":2"));
        let back: ApiPeerInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn test_register_roundtrip() {
        let msg = RegisterMsg {
            node_id: Vertex(3),
            version: "etherguard-rs 0.1.0".to_string(),
            nh_state_hash: [0xAA; 32],
            peer_state_hash: [0xBB; 32],
            local_v4: "192.0.2.7:3344".to_string(),
            local_v6: "".to_string(),
        };
        let decoded = RegisterMsg::decode(&msg.encode()).expect("decode register");
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_ping_pong_roundtrip() {
        let ping = PingMsg {
            request_id: 9,
            src: Vertex(1),
            dst: Vertex(2),
            sent_at_secs: 1690000000.123456,
        };
        assert_eq!(PingMsg::decode(&ping.encode()).unwrap(), ping);

        let pong = PongMsg {
            request_id: 9,
            src: Vertex(1),
            dst: Vertex(2),
            time_diff_secs: 0.0425,
        };
        assert_eq!(PongMsg::decode(&pong.encode()).unwrap(), pong);
    }

    #[test]
    fn test_update_msgs_roundtrip() {
        let nh = UpdateNhTableMsg {
            state_hash: [0x11; 32],
        };
        assert_eq!(UpdateNhTableMsg::decode(&nh.encode()).unwrap(), nh);

        let peer = UpdatePeerMsg {
            state_hash: [0x22; 32],
        };
        assert_eq!(UpdatePeerMsg::decode(&peer.encode()).unwrap(), peer);
    }

    #[test]
    fn test_update_error_roundtrip() {
        let msg = UpdateErrorMsg {
            node_id: Vertex(5),
            action: ErrorAction::Shutdown,
            error_code: 410,
            error_msg: "You've been removed from supernode.".to_string(),
        };
        assert_eq!(UpdateErrorMsg::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_broadcast_peer_roundtrip() {
        let msg = BroadcastPeerMsg {
            request_id: 77,
            node_id: Vertex(4),
            pubkey: [0x5A; 32],
            conn_url: "198.51.100.4:3001".to_string(),
        };
        assert_eq!(BroadcastPeerMsg::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_truncated_message() {
        let msg = PongMsg {
            request_id: 1,
            src: Vertex(1),
            dst: Vertex(2),
            time_diff_secs: 0.5,
        };
        let bytes = msg.encode();
        let result = PongMsg::decode(&bytes[..bytes.len() - 1]);
        assert!(matches!(result, Err(MsgError::UnexpectedEof { .. })));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let msg = UpdatePeerMsg {
            state_hash: [0x01; 32],
        };
        let mut bytes = msg.encode();
        bytes.push(0);
        assert!(matches!(
            UpdatePeerMsg::decode(&bytes),
            Err(MsgError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let msg = UpdateErrorMsg {
            node_id: Vertex(5),
            action: ErrorAction::Panic,
            error_code: 500,
            error_msg: "x".to_string(),
        };
        let mut bytes = msg.encode();
        bytes[2] = 0x7F;
        assert!(matches!(
            UpdateErrorMsg::decode(&bytes),
            Err(MsgError::UnknownAction(0x7F))
        ));
    }
}
