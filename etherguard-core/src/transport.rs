//! Encrypted UDP transport.
//!
//! This module handles:
//! - ChaCha20Poly1305 sealing/opening of outer packets (detached tag, outer
//!   header authenticated as AEAD associated data)
//! - the per-peer key schedule
//! - UDP sockets bound per address family
//!
//! The Noise-IK handshake of the underlying tunnel is an external
//! collaborator; [`derive_session_key`] stands in for its output while keeping
//! the same seal/open contract. Both directions share one key, so nonces are
//! scoped by the sender's node id (the nonce domain) on top of the per-sender
//! sequence counter.

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use sha2::{Digest, Sha256};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::warn;

use crate::proto::{Packet, AUTH_TAG_SIZE};
use crate::types::Vertex;

/// Size of ChaCha20Poly1305 key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of nonce in bytes.
const NONCE_SIZE: usize = 12;

pub type EncryptionKey = [u8; KEY_SIZE];
pub type NoisePrivateKey = [u8; KEY_SIZE];
pub type NoisePublicKey = [u8; KEY_SIZE];
pub type NoisePresharedKey = [u8; KEY_SIZE];

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("encryption error")]
    Encryption,

    #[error("decryption error")]
    Decryption,

    #[error("no socket bound for the {0} address family")]
    NoSocketForFamily(&'static str),
}

/// Static public key for a static private key.
///
/// Stand-in for the Noise static-key derivation of the external transport;
/// deterministic so both sides of a link agree on it from configuration.
pub fn pubkey_from_private(private: &NoisePrivateKey) -> NoisePublicKey {
    let mut h = Sha256::new();
    h.update(b"etherguard static v1");
    h.update(private);
    h.finalize().into()
}

/// Symmetric per-link key from the two static public keys plus the optional
/// pre-shared key. The keys are ordered before hashing so both ends derive
/// the same value.
pub fn derive_session_key(
    a: &NoisePublicKey,
    b: &NoisePublicKey,
    psk: Option<&NoisePresharedKey>,
) -> EncryptionKey {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut h = Sha256::new();
    h.update(b"etherguard session v1");
    h.update(lo);
    h.update(hi);
    if let Some(psk) = psk {
        h.update(psk);
    }
    h.finalize().into()
}

/// Packet encryptor/decryptor for one peer link.
pub struct PacketCrypto {
    cipher: ChaCha20Poly1305,
}

impl PacketCrypto {
    pub fn new(key: &EncryptionKey) -> Self {
        let key = Key::from_slice(key);
        let cipher = ChaCha20Poly1305::new(key);
        Self { cipher }
    }

    /// Nonce from the sender's node id (domain) and sequence number.
    ///
    /// Both directions share the session key; scoping each direction to its
    /// sender id keeps the nonce spaces disjoint.
    fn nonce_for(sender: Vertex, sequence: u64) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[0..4].copy_from_slice(&(sender.0 as u32).to_be_bytes());
        nonce[4..12].copy_from_slice(&sequence.to_be_bytes());
        nonce
    }

    /// Seal a plaintext payload into an outer [`Packet`]. The outer header is
    /// authenticated as AEAD associated data.
    pub fn seal_packet(
        &self,
        sender: Vertex,
        sequence: u64,
        plaintext: &[u8],
    ) -> Result<Packet, TransportError> {
        let mut packet = Packet::new(sender, sequence, plaintext.to_vec());

        let aad = packet.header.encode();
        let nonce = Self::nonce_for(sender, sequence);
        let nonce = Nonce::from_slice(&nonce);

        let tag = self
            .cipher
            .encrypt_in_place_detached(nonce, &aad, &mut packet.payload)
            .map_err(|_| TransportError::Encryption)?;

        let mut tag_bytes = [0u8; AUTH_TAG_SIZE];
        tag_bytes.copy_from_slice(tag.as_slice());
        packet.auth_tag = tag_bytes;
        Ok(packet)
    }

    /// Open an outer [`Packet`], verifying tag and header.
    pub fn open_packet(&self, packet: &Packet) -> Result<Vec<u8>, TransportError> {
        if packet.header.payload_len as usize != packet.payload.len() {
            return Err(TransportError::Decryption);
        }

        let aad = packet.header.encode();
        let nonce = Self::nonce_for(packet.header.sender, packet.header.sequence);
        let nonce = Nonce::from_slice(&nonce);
        let tag = chacha20poly1305::Tag::from_slice(&packet.auth_tag);

        let mut buf = packet.payload.clone();
        self.cipher
            .decrypt_in_place_detached(nonce, &aad, &mut buf, tag)
            .map_err(|_| TransportError::Decryption)?;

        Ok(buf)
    }
}

/// Which address families a [`Bind`] opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    Both,
    V4Only,
    V6Only,
}

/// UDP sockets bound per address family.
///
/// The v6 socket is opened with `IPV6_V6ONLY` so a v4 and a v6 bind can share
/// one port; v4-mapped traffic always arrives on the v4 socket in 4-byte
/// form.
pub struct Bind {
    v4: Option<Arc<UdpSocket>>,
    v6: Option<Arc<UdpSocket>>,
}

impl Bind {
    /// Open sockets for `mode` on `port` (0 picks ephemeral ports).
    ///
    /// In `Both` mode a single family failing to bind is logged and tolerated
    /// as long as the other came up.
    pub async fn open(mode: BindMode, port: u16) -> Result<Self, TransportError> {
        let want_v4 = matches!(mode, BindMode::Both | BindMode::V4Only);
        let want_v6 = matches!(mode, BindMode::Both | BindMode::V6Only);

        let v4 = if want_v4 {
            match UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)))
                .await
            {
                Ok(sock) => Some(Arc::new(sock)),
                Err(e) => {
                    if mode == BindMode::V4Only {
                        return Err(e.into());
                    }
                    warn!(error = %e, "failed to bind IPv4 socket, continuing without");
                    None
                }
            }
        } else {
            None
        };

        let v6 = if want_v6 {
            match Self::bind_v6only(port) {
                Ok(sock) => Some(Arc::new(sock)),
                Err(e) => {
                    if mode == BindMode::V6Only || v4.is_none() {
                        return Err(e.into());
                    }
                    warn!(error = %e, "failed to bind IPv6 socket, continuing without");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self { v4, v6 })
    }

    fn bind_v6only(port: u16) -> io::Result<UdpSocket> {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV6,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_only_v6(true)?;
        socket.set_nonblocking(true)?;
        let addr = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0));
        socket.bind(&addr.into())?;
        UdpSocket::from_std(socket.into())
    }

    /// Send `buf` to `addr` on the socket matching its family.
    pub async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize, TransportError> {
        let sock = match addr {
            SocketAddr::V4(_) => self
                .v4
                .as_ref()
                .ok_or(TransportError::NoSocketForFamily("IPv4"))?,
            SocketAddr::V6(_) => self
                .v6
                .as_ref()
                .ok_or(TransportError::NoSocketForFamily("IPv6"))?,
        };
        Ok(sock.send_to(buf, addr).await?)
    }

    /// The bound sockets, labeled "v4"/"v6" by construction. One receive task
    /// per entry.
    pub fn receivers(&self) -> Vec<(&'static str, Arc<UdpSocket>)> {
        let mut out = Vec::new();
        if let Some(s) = &self.v4 {
            out.push(("v4", s.clone()));
        }
        if let Some(s) = &self.v6 {
            out.push(("v6", s.clone()));
        }
        out
    }

    /// Local address of the IPv4 socket, if bound.
    pub fn local_v4(&self) -> Option<SocketAddr> {
        self.v4.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Local address of the IPv6 socket, if bound.
    pub fn local_v6(&self) -> Option<SocketAddr> {
        self.v6.as_ref().and_then(|s| s.local_addr().ok())
    }
}
