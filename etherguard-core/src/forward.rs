//! Per-frame forwarding decisions.
//!
//! The decision functions are pure: they take a routing-table snapshot plus
//! the frame's addressing and return what to do. The runtime owns the sockets
//! and the TAP; keeping the policy side-effect free makes it deterministic and
//! unit-testable.

use crate::graph::{broadcast_list, broadcast_through_list, next_hop, RouteTables};
use crate::proto::EgHeader;
use crate::types::{Vertex, BROADCAST, SPECIAL_NODE_ID};

/// Why a frame was not forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No next hop toward the destination.
    Unreachable,
    /// TTL reached zero before delivery.
    TtlExpired,
    /// The destination id is not routable (reserved or zero).
    InvalidDestination,
}

/// What to do with one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Deliver the payload to the local TAP device.
    ToTap,
    /// Send toward exactly one neighbor.
    Unicast(Vertex),
    /// Send a copy to each listed neighbor.
    Multicast(Vec<Vertex>),
    /// Deliver locally and relay copies downstream (incoming broadcast).
    TapAndRelay(Vec<Vertex>),
    Drop(DropReason),
}

/// Decide for a frame freshly read from the local TAP.
pub fn dispatch_from_tap(tables: &RouteTables, self_id: Vertex, dst: Vertex) -> Dispatch {
    if dst == BROADCAST {
        let targets: Vec<Vertex> = broadcast_list(tables, self_id).into_iter().collect();
        if targets.is_empty() {
            return Dispatch::Drop(DropReason::Unreachable);
        }
        return Dispatch::Multicast(targets);
    }
    if !dst.is_normal() || dst == self_id {
        return Dispatch::Drop(DropReason::InvalidDestination);
    }
    match next_hop(tables, self_id, dst) {
        Some(hop) => Dispatch::Unicast(hop),
        None => Dispatch::Drop(DropReason::Unreachable),
    }
}

/// Decide for a `Normal` frame that arrived from the network.
///
/// `in_id` is the node the packet was received from (the previous hop, not
/// necessarily the origin). The caller decrements the TTL before relaying.
pub fn dispatch_forward(
    tables: &RouteTables,
    self_id: Vertex,
    hdr: &EgHeader,
    in_id: Vertex,
) -> Dispatch {
    if hdr.dst == self_id {
        return Dispatch::ToTap;
    }
    if hdr.dst == BROADCAST {
        let relay: Vec<Vertex> = broadcast_through_list(tables, self_id, in_id, hdr.src)
            .into_iter()
            .collect();
        return Dispatch::TapAndRelay(relay);
    }
    if hdr.dst >= SPECIAL_NODE_ID {
        return Dispatch::Drop(DropReason::InvalidDestination);
    }
    if hdr.ttl == 0 {
        return Dispatch::Drop(DropReason::TtlExpired);
    }
    match next_hop(tables, self_id, hdr.dst) {
        Some(hop) => Dispatch::Unicast(hop),
        None => Dispatch::Drop(DropReason::Unreachable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Graph, GraphRecalculateSetting};
    use crate::proto::Usage;

    fn line_tables() -> RouteTables {
        let setting = GraphRecalculateSetting {
            jitter_tolerance: 0.0,
            jitter_tolerance_multiplier: 1.0,
            node_report_timeout: 9999.0,
            recalculate_cool_down: 0.0,
            ..Default::default()
        };
        let g = Graph::new(false, &setting);
        for (a, b) in [(1u16, 2u16), (2, 3), (3, 4)] {
            g.update_latency(Vertex(a), Vertex(b), 0.5, 0.0, false, false);
            g.update_latency(Vertex(b), Vertex(a), 0.5, 0.0, false, false);
        }
        g.floyd_warshall().expect("apsp")
    }

    fn hdr(usage: Usage, ttl: u8, src: u16, dst: u16) -> EgHeader {
        EgHeader::new(usage, ttl, Vertex(src), Vertex(dst), 0)
    }

    #[test]
    fn test_tap_unicast_uses_next_hop() {
        let tables = line_tables();
        assert_eq!(
            dispatch_from_tap(&tables, Vertex(1), Vertex(4)),
            Dispatch::Unicast(Vertex(2))
        );
        assert_eq!(
            dispatch_from_tap(&tables, Vertex(1), Vertex(2)),
            Dispatch::Unicast(Vertex(2))
        );
    }

    #[test]
    fn test_tap_unreachable_drops() {
        let tables = line_tables();
        assert_eq!(
            dispatch_from_tap(&tables, Vertex(1), Vertex(9)),
            Dispatch::Drop(DropReason::Unreachable)
        );
    }

    #[test]
    fn test_tap_broadcast_targets_first_hops() {
        let tables = line_tables();
        // Node 2 reaches 1 directly and everyone else via 3.
        match dispatch_from_tap(&tables, Vertex(2), BROADCAST) {
            Dispatch::Multicast(mut targets) => {
                targets.sort();
                assert_eq!(targets, vec![Vertex(1), Vertex(3)]);
            }
            other => panic!("expected multicast, got {other:?}"),
        }
    }

    #[test]
    fn test_forward_to_self_goes_to_tap() {
        let tables = line_tables();
        let h = hdr(Usage::Normal, 10, 1, 3);
        assert_eq!(
            dispatch_forward(&tables, Vertex(3), &h, Vertex(2)),
            Dispatch::ToTap
        );
    }

    #[test]
    fn test_forward_relays_toward_destination() {
        let tables = line_tables();
        let h = hdr(Usage::Normal, 10, 1, 4);
        assert_eq!(
            dispatch_forward(&tables, Vertex(2), &h, Vertex(1)),
            Dispatch::Unicast(Vertex(3))
        );
    }

    #[test]
    fn test_forward_ttl_expired_drops() {
        let tables = line_tables();
        let h = hdr(Usage::Normal, 0, 1, 4);
        assert_eq!(
            dispatch_forward(&tables, Vertex(2), &h, Vertex(1)),
            Dispatch::Drop(DropReason::TtlExpired)
        );
    }

    #[test]
    fn test_forward_broadcast_never_returns_to_ingress() {
        let tables = line_tables();
        let h = hdr(Usage::Normal, 10, 1, 0xFFFF);
        match dispatch_forward(&tables, Vertex(2), &h, Vertex(1)) {
            Dispatch::TapAndRelay(relay) => {
                assert!(!relay.contains(&Vertex(1)));
                assert_eq!(relay, vec![Vertex(3)]);
            }
            other => panic!("expected tap-and-relay, got {other:?}"),
        }
        // Tail of the line: deliver locally, relay nowhere.
        let h = hdr(Usage::Normal, 10, 1, 0xFFFF);
        assert_eq!(
            dispatch_forward(&tables, Vertex(4), &h, Vertex(3)),
            Dispatch::TapAndRelay(vec![])
        );
    }
}
