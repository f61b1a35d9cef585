//! Routing controller: the only writer of the routing tables.
//!
//! Latency reports, registrations, and the periodic staleness tick all funnel
//! through here. When a recomputation changes the next-hop table the
//! controller rehashes it (salted MD5 over the JSON serialization) and
//! publishes the new hash on a watch channel that push loops and runtimes
//! observe.

use crate::graph::{hash_nh_table, Graph};
use crate::types::{NextHopTable, StateHash, Vertex, ZERO_HASH};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Everything that can trigger a routing decision.
#[derive(Debug, Clone)]
pub enum RouteEvent {
    /// A measured latency for the directed edge src → dst.
    Pong {
        src: Vertex,
        dst: Vertex,
        seconds: f64,
        /// Additive cost of dst from its configuration.
        additional_cost: f64,
    },
    /// A liveness refresh from `node`.
    Register { node: Vertex },
    /// The periodic staleness tick.
    Tick,
}

/// Owns the recomputation policy and hash publication for one graph.
pub struct RoutingController {
    graph: Arc<Graph>,
    salt: [u8; 32],
    hash_tx: watch::Sender<StateHash>,
}

impl RoutingController {
    /// Returns the controller and the receiver side of the published-hash
    /// channel. The salt is per-process random, so hashes are not comparable
    /// across restarts.
    pub fn new(graph: Arc<Graph>) -> (Self, watch::Receiver<StateHash>) {
        let (hash_tx, hash_rx) = watch::channel(ZERO_HASH);
        (
            Self {
                graph,
                salt: rand::random(),
                hash_tx,
            },
            hash_rx,
        )
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Handle one event. Returns true when the next-hop table changed (and a
    /// fresh hash was published).
    pub fn handle(&self, event: RouteEvent) -> bool {
        let changed = match event {
            RouteEvent::Pong {
                src,
                dst,
                seconds,
                additional_cost,
            } => {
                if src.is_normal() && dst.is_normal() {
                    self.graph
                        .update_latency(src, dst, seconds, additional_cost, true, true)
                } else {
                    // Synthetic self-report: reassess staleness only.
                    self.reassess()
                }
            }
            RouteEvent::Register { .. } | RouteEvent::Tick => self.reassess(),
        };
        if changed {
            self.publish();
        }
        changed
    }

    /// Recompute if any edge drifted out of its jitter class (typically
    /// because it went stale).
    fn reassess(&self) -> bool {
        if self.graph.should_calculate() {
            self.graph.recalculate_nh_table(true)
        } else {
            false
        }
    }

    /// Rehash the current table and publish. Called after any table change.
    pub fn publish(&self) -> StateHash {
        let tables = self.graph.tables();
        let hash = hash_nh_table(&tables.next, &self.salt);
        self.graph.set_nh_table_hash(hash);
        self.hash_tx.send_replace(hash);
        debug!(hash = %String::from_utf8_lossy(&hash), "published next-hop table hash");
        hash
    }

    /// Currently published hash.
    pub fn current_hash(&self) -> StateHash {
        *self.hash_tx.borrow()
    }

    /// Install a table pushed by the supernode, trusting its hash.
    pub fn apply_pushed_table(&self, next: NextHopTable, hash: StateHash) {
        self.graph.set_nh_table(next, hash);
        self.hash_tx.send_replace(hash);
    }

    /// Hash an arbitrary table with this controller's salt.
    pub fn hash_table(&self, next: &NextHopTable) -> StateHash {
        hash_nh_table(next, &self.salt)
    }

    /// Hash any JSON-serializable state with this controller's salt (the
    /// peer-info payload uses this).
    pub fn hash_state<T: serde::Serialize>(&self, value: &T) -> StateHash {
        crate::graph::hash_json_state(value, &self.salt)
    }
}
