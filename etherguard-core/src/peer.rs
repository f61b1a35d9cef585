//! Peer and endpoint registry.
//!
//! Maps NodeID ↔ static public key ↔ remote endpoint, tracks liveness, and
//! owns the per-link cipher state. A node id may be served by more than one
//! key (the supernode is reachable over distinct v4 and v6 identities), so
//! the primary key of the table is the public key with a NodeID index on top.
//!
//! Endpoints are learned from the latest authenticated source address unless
//! the peer is marked static. The endpoint parser accepts only literal IP
//! addresses; DNS has no place on the hot path.

use crate::proto::Packet;
use crate::transport::{
    derive_session_key, pubkey_from_private, NoisePresharedKey, NoisePrivateKey, NoisePublicKey,
    PacketCrypto,
};
use crate::types::Vertex;
use base64::Engine;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

/// Errors for key text handling.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("failed to decode key as base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("key must decode to exactly 32 bytes, got {0}")]
    BadLength(usize),
}

/// Decode a base64 32-byte key from configuration.
pub fn key_from_base64(s: &str) -> Result<[u8; 32], KeyError> {
    let raw = base64::engine::general_purpose::STANDARD.decode(s)?;
    if raw.len() != 32 {
        return Err(KeyError::BadLength(raw.len()));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&raw);
    Ok(key)
}

/// Encode a 32-byte key for configuration or the HTTP API.
pub fn key_to_base64(key: &[u8; 32]) -> String {
    base64::engine::general_purpose::STANDARD.encode(key)
}

/// Endpoint parsing errors.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("endpoint '{0}' has no port")]
    MissingPort(String),

    #[error("invalid port in endpoint '{0}'")]
    InvalidPort(String),

    #[error("host '{0}' is not a literal IP address")]
    NotAnIpLiteral(String),

    #[error("endpoint '{0}' does not match requested address family v{1}")]
    AddressFamilyMismatch(String, u8),
}

/// Parse `host:port` where host must be a literal IPv4 or bracketed IPv6
/// address. IPv4-mapped IPv6 addresses are normalized to their 4-byte form so
/// endpoints compare equal across representations.
pub fn parse_endpoint(s: &str) -> Result<SocketAddr, EndpointError> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| EndpointError::MissingPort(s.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| EndpointError::InvalidPort(s.to_string()))?;

    let mut host = host.trim_start_matches('[').trim_end_matches(']');
    // Strip a zone id for the literal-address check; scoped link-local
    // endpoints are rejected past this point anyway if unparsable.
    if host.contains(':') {
        if let Some(i) = host.rfind('%') {
            host = &host[..i];
        }
    }

    let ip: IpAddr = host
        .parse()
        .map_err(|_| EndpointError::NotAnIpLiteral(host.to_string()))?;

    let ip = match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    };

    Ok(SocketAddr::new(ip, port))
}

/// Like [`parse_endpoint`], constrained to an address family: 4, 6, or 0 for
/// either.
pub fn parse_endpoint_af(s: &str, af: u8) -> Result<SocketAddr, EndpointError> {
    let addr = parse_endpoint(s)?;
    match (af, addr) {
        (0, _) | (4, SocketAddr::V4(_)) | (6, SocketAddr::V6(_)) => Ok(addr),
        _ => Err(EndpointError::AddressFamilyMismatch(s.to_string(), af)),
    }
}

/// Everything needed to install one peer.
pub struct PeerConfig {
    pub node_id: Vertex,
    pub pubkey: NoisePublicKey,
    pub psk: Option<NoisePresharedKey>,
    pub endpoint: Option<SocketAddr>,
    /// Human-readable endpoint string, kept for gossip and the HTTP API.
    pub conn_url: String,
    /// When set, the endpoint is never overwritten by a learned source.
    pub static_conn: bool,
    pub additional_cost: f64,
}

struct PeerEntry {
    node_id: Vertex,
    psk: Option<NoisePresharedKey>,
    crypto: Arc<PacketCrypto>,
    endpoint: Option<SocketAddr>,
    conn_url: String,
    static_conn: bool,
    additional_cost: f64,
    last_seen: Option<Instant>,
    send_seq: u64,
}

/// Read-only view of one peer, for push loops and the HTTP API.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub node_id: Vertex,
    pub pubkey: NoisePublicKey,
    pub endpoint: Option<SocketAddr>,
    pub conn_url: String,
    pub static_conn: bool,
    pub additional_cost: f64,
    pub last_seen: Option<Instant>,
}

/// The peer table of one local transport identity.
pub struct PeerTable {
    local_id: Vertex,
    local_pub: NoisePublicKey,
    inner: RwLock<HashMap<NoisePublicKey, Mutex<PeerEntry>>>,
    ids: RwLock<HashMap<Vertex, Vec<NoisePublicKey>>>,
}

impl PeerTable {
    pub fn new(local_id: Vertex, local_priv: &NoisePrivateKey) -> Self {
        Self {
            local_id,
            local_pub: pubkey_from_private(local_priv),
            inner: RwLock::new(HashMap::new()),
            ids: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_id(&self) -> Vertex {
        self.local_id
    }

    pub fn local_pubkey(&self) -> NoisePublicKey {
        self.local_pub
    }

    /// Install or replace a peer. Replacing re-derives the cipher and resets
    /// the send sequence; the old entry's endpoint survives unless the new
    /// config provides one.
    pub fn add_peer(&self, cfg: PeerConfig) {
        let key = derive_session_key(&self.local_pub, &cfg.pubkey, cfg.psk.as_ref());
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let prior_endpoint = inner
            .get(&cfg.pubkey)
            .and_then(|e| e.lock().unwrap_or_else(|p| p.into_inner()).endpoint);
        let entry = PeerEntry {
            node_id: cfg.node_id,
            psk: cfg.psk,
            crypto: Arc::new(PacketCrypto::new(&key)),
            endpoint: cfg.endpoint.or(prior_endpoint),
            conn_url: cfg.conn_url,
            static_conn: cfg.static_conn,
            additional_cost: cfg.additional_cost,
            last_seen: None,
            send_seq: 0,
        };
        let stale_id = inner
            .insert(cfg.pubkey, Mutex::new(entry))
            .map(|old| old.lock().unwrap_or_else(|p| p.into_inner()).node_id)
            .filter(|&old_id| old_id != cfg.node_id);
        drop(inner);
        if let Some(old_id) = stale_id {
            self.unindex(old_id, &cfg.pubkey);
        }
        let mut ids = self.ids.write().unwrap_or_else(|e| e.into_inner());
        let list = ids.entry(cfg.node_id).or_default();
        if !list.contains(&cfg.pubkey) {
            list.push(cfg.pubkey);
        }
    }

    fn unindex(&self, id: Vertex, pubkey: &NoisePublicKey) {
        let mut ids = self.ids.write().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = ids.get_mut(&id) {
            list.retain(|pk| pk != pubkey);
            if list.is_empty() {
                ids.remove(&id);
            }
        }
    }

    /// Remove every peer registered under `id`.
    pub fn remove_by_id(&self, id: Vertex) {
        let pks = {
            let mut ids = self.ids.write().unwrap_or_else(|e| e.into_inner());
            ids.remove(&id).unwrap_or_default()
        };
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for pk in pks {
            inner.remove(&pk);
        }
    }

    pub fn contains(&self, pubkey: &NoisePublicKey) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(pubkey)
    }

    /// All node ids with at least one registered peer.
    pub fn node_ids(&self) -> Vec<Vertex> {
        self.ids
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    /// Keys registered under one node id.
    pub fn pubkeys_of(&self, id: Vertex) -> Vec<NoisePublicKey> {
        self.ids
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshots of every peer.
    pub fn snapshots(&self) -> Vec<PeerSnapshot> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .iter()
            .map(|(pk, entry)| {
                let e = entry.lock().unwrap_or_else(|p| p.into_inner());
                PeerSnapshot {
                    node_id: e.node_id,
                    pubkey: *pk,
                    endpoint: e.endpoint,
                    conn_url: e.conn_url.clone(),
                    static_conn: e.static_conn,
                    additional_cost: e.additional_cost,
                    last_seen: e.last_seen,
                }
            })
            .collect()
    }

    /// Snapshot of one peer.
    pub fn snapshot(&self, pubkey: &NoisePublicKey) -> Option<PeerSnapshot> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.get(pubkey).map(|entry| {
            let e = entry.lock().unwrap_or_else(|p| p.into_inner());
            PeerSnapshot {
                node_id: e.node_id,
                pubkey: *pubkey,
                endpoint: e.endpoint,
                conn_url: e.conn_url.clone(),
                static_conn: e.static_conn,
                additional_cost: e.additional_cost,
                last_seen: e.last_seen,
            }
        })
    }

    /// Additional routing cost configured for `id` (0 when unknown).
    pub fn additional_cost_of(&self, id: Vertex) -> f64 {
        let ids = self.ids.read().unwrap_or_else(|e| e.into_inner());
        let Some(pk) = ids.get(&id).and_then(|l| l.first()) else {
            return 0.0;
        };
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .get(pk)
            .map(|e| e.lock().unwrap_or_else(|p| p.into_inner()).additional_cost)
            .unwrap_or(0.0)
    }

    /// Set a peer's endpoint. `learned` marks an address observed on the
    /// wire, which never overrides a static endpoint.
    pub fn set_endpoint(&self, pubkey: &NoisePublicKey, addr: SocketAddr, learned: bool) {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = inner.get(pubkey) {
            let mut e = entry.lock().unwrap_or_else(|p| p.into_inner());
            if learned && e.static_conn {
                return;
            }
            e.endpoint = Some(normalize_addr(addr));
        }
    }

    /// Seal a plaintext toward a specific peer key. Returns the wire bytes
    /// and the destination, or `None` when the peer is unknown or has no
    /// endpoint yet.
    pub fn seal_for(
        &self,
        pubkey: &NoisePublicKey,
        plaintext: &[u8],
    ) -> Option<(Vec<u8>, SocketAddr)> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let entry = inner.get(pubkey)?;
        let mut e = entry.lock().unwrap_or_else(|p| p.into_inner());
        let endpoint = e.endpoint?;
        e.send_seq = e.send_seq.wrapping_add(1);
        let seq = e.send_seq;
        let crypto = e.crypto.clone();
        drop(e);
        drop(inner);
        let packet = crypto.seal_packet(self.local_id, seq, plaintext).ok()?;
        Some((packet.encode(), endpoint))
    }

    /// Seal toward a node id, choosing the first registered key that has a
    /// usable endpoint.
    pub fn seal_for_id(&self, id: Vertex, plaintext: &[u8]) -> Option<(Vec<u8>, SocketAddr)> {
        let pks = {
            let ids = self.ids.read().unwrap_or_else(|e| e.into_inner());
            ids.get(&id).cloned().unwrap_or_default()
        };
        pks.iter().find_map(|pk| self.seal_for(pk, plaintext))
    }

    /// Authenticate an inbound packet against the peers registered under its
    /// sender id. On success refreshes `last_seen`, learns the source address
    /// (static peers excepted), and returns the matching key and plaintext.
    pub fn open_from(&self, packet: &Packet, src: SocketAddr) -> Option<(NoisePublicKey, Vec<u8>)> {
        let pks = {
            let ids = self.ids.read().unwrap_or_else(|e| e.into_inner());
            ids.get(&packet.header.sender).cloned().unwrap_or_default()
        };
        for pk in pks {
            let crypto = {
                let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
                match inner.get(&pk) {
                    Some(entry) => entry
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .crypto
                        .clone(),
                    None => continue,
                }
            };
            if let Ok(plain) = crypto.open_packet(packet) {
                let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
                if let Some(entry) = inner.get(&pk) {
                    let mut e = entry.lock().unwrap_or_else(|p| p.into_inner());
                    e.last_seen = Some(Instant::now());
                    if !e.static_conn {
                        e.endpoint = Some(normalize_addr(src));
                    }
                }
                return Some((pk, plain));
            }
        }
        None
    }

    /// PSK registered for a peer, for re-deriving gossip entries.
    pub fn psk_of(&self, pubkey: &NoisePublicKey) -> Option<NoisePresharedKey> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .get(pubkey)
            .and_then(|e| e.lock().unwrap_or_else(|p| p.into_inner()).psk)
    }
}

/// Collapse IPv4-mapped addresses so learned and configured endpoints
/// compare equal.
fn normalize_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        v4 => v4,
    }
}
