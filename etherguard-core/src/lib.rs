//! Core library for the EtherGuard layer-2 overlay VPN.
//!
//! Encrypted UDP tunnels between peers carry Ethernet frames; the mesh routes
//! over the tunnel graph using measured link latencies. This crate is the
//! routing plane shared by the edge and supernode runtimes:
//!
//! - `types`: node ids, reserved control addresses, table aliases
//! - `proto`: outer packet framing and the in-tunnel EG header
//! - `msg`: control-plane message bodies
//! - `graph`: latency graph, jitter hysteresis, Floyd–Warshall
//! - `router`: recomputation policy and hash publication
//! - `forward`: per-frame dispatch decisions
//! - `peer`: NodeID ↔ key ↔ endpoint registry
//! - `transport`: AEAD sealing and per-family UDP binds
//! - `tap`: frame source/sink contract

pub mod forward;
pub mod graph;
pub mod msg;
pub mod peer;
pub mod proto;
pub mod router;
pub mod tap;
pub mod transport;
pub mod types;

pub use graph::{Graph, GraphRecalculateSetting, RouteTables};
pub use proto::{EgHeader, Packet, Usage};
pub use types::{Vertex, BROADCAST, SPECIAL_NODE_ID, SUPERNODE};
