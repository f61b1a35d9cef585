//! Core identifier types shared by every component.
//!
//! A mesh participant is addressed by a 16-bit [`Vertex`]. Values at or above
//! [`SPECIAL_NODE_ID`] are control addresses and never appear as graph
//! vertices; vertex 0 is invalid and rejected at the configuration layer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Node identifier inside the mesh.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Vertex(pub u16);

/// First reserved control address. Everything at or above is non-routable.
pub const SPECIAL_NODE_ID: Vertex = Vertex(0xFFFD);

/// Destination for control traffic that terminates at the local node.
pub const CONTROL: Vertex = Vertex(0xFFFD);

/// The supernode's own address.
pub const SUPERNODE: Vertex = Vertex(0xFFFE);

/// Layer-2 broadcast/multicast destination.
pub const BROADCAST: Vertex = Vertex(0xFFFF);

impl Vertex {
    /// True for an id that can appear in the routing graph.
    pub fn is_normal(self) -> bool {
        self.0 != 0 && self < SPECIAL_NODE_ID
    }
}

impl fmt::Display for Vertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            SUPERNODE => write!(f, "super"),
            BROADCAST => write!(f, "broadcast"),
            CONTROL => write!(f, "control"),
            Vertex(v) => write!(f, "{v}"),
        }
    }
}

impl From<u16> for Vertex {
    fn from(v: u16) -> Self {
        Vertex(v)
    }
}

/// Finite stand-in for an unreachable distance.
///
/// Kept finite so it survives JSON/YAML round-trips; any real path is far
/// below it.
pub const INFINITY: f64 = 99999.0;

/// (src, dst) → first hop. A missing entry means unreachable.
pub type NextHopTable = BTreeMap<Vertex, BTreeMap<Vertex, Vertex>>;

/// (src, dst) → path cost in seconds.
pub type DistTable = BTreeMap<Vertex, BTreeMap<Vertex, f64>>;

/// 32 ASCII bytes of lowercase hex — the published digest of a routing table.
pub type StateHash = [u8; 32];

/// An all-zero hash, used as "not yet computed".
pub const ZERO_HASH: StateHash = [0u8; 32];

/// Per-area log switches from the configuration.
///
/// The subscriber level itself comes from `log_level`; these flags gate the
/// chattier per-packet areas independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LoggerInfo {
    /// Subscriber filter: "error", "normal" (info), "verbose"/"debug", "silent".
    pub log_level: String,
    /// Log frames relayed on behalf of other nodes.
    #[serde(default)]
    pub log_transit: bool,
    /// Log control-plane messages.
    #[serde(default)]
    pub log_control: bool,
    /// Log normal data frames.
    #[serde(default)]
    pub log_normal: bool,
    /// Log internal events (recomputation, negative-cycle repair).
    #[serde(default)]
    pub log_internal: bool,
}

impl Default for LoggerInfo {
    fn default() -> Self {
        Self {
            log_level: "error".to_string(),
            log_transit: false,
            log_control: false,
            log_normal: false,
            log_internal: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_is_normal() {
        assert!(Vertex(1).is_normal());
        assert!(Vertex(0xFFFC).is_normal());
        assert!(!Vertex(0).is_normal());
        assert!(!SUPERNODE.is_normal());
        assert!(!BROADCAST.is_normal());
        assert!(!CONTROL.is_normal());
    }

    #[test]
    fn test_vertex_serde_transparent() {
        let v = Vertex(42);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "42");
        let back: Vertex = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_next_hop_table_json_keys_are_stable() {
        let mut table = NextHopTable::new();
        table
            .entry(Vertex(2))
            .or_default()
            .insert(Vertex(1), Vertex(1));
        table
            .entry(Vertex(1))
            .or_default()
            .insert(Vertex(2), Vertex(2));
        let a = serde_json::to_string(&table).unwrap();
        let b = serde_json::to_string(&table).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("{\"1\""));
    }
}
